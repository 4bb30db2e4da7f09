//! Database gateway
//!
//! Wraps the driver's connection pool and concentrates identifier escaping
//! and name prefixing into one boundary. Every managed database object is
//! named `<prefix>__<logical>`, both halves checked against a conservative
//! grammar before any SQL is assembled.

use crate::config::ConnectionOptions;
use crate::error::{Error, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use futures::stream::StreamExt;
use once_cell::sync::Lazy;
use postgres_protocol::escape::{escape_identifier, escape_literal};
use regex::Regex;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, NoTls, Notification};
use tracing::{debug, warn};

/// Conservative grammar for the prefix and every logical object name.
/// Digits and uppercase are deliberately rejected.
static NAME_GRAMMAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z_-]+$").unwrap());

/// Validate a name against the conservative grammar. Violations fail fast as
/// configuration errors.
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    if NAME_GRAMMAR.is_match(name) {
        return Ok(());
    }
    Err(Error::config(format!(
        "invalid {kind} '{name}': must match ^[a-z_-]+$"
    )))
}

/// A pooled client borrowed from the gateway. Dropping it returns the
/// connection to the pool.
pub type PooledClient = deadpool_postgres::Object;

/// A dedicated, long-lived connection that surfaces asynchronous channel
/// notifications. The driver half runs on a spawned task; dropping the
/// client force-releases the connection.
pub struct ListenClient {
    client: tokio_postgres::Client,
    notifications: mpsc::UnboundedReceiver<Notification>,
    driver: tokio::task::JoinHandle<()>,
}

impl ListenClient {
    /// The underlying client, for issuing `LISTEN` and ad-hoc queries.
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }

    /// Receive the next channel notification. Returns `None` once the
    /// connection has closed.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.notifications.recv().await
    }
}

impl Drop for ListenClient {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Owns the connection pool and the naming boundary.
pub struct Gateway {
    options: ConnectionOptions,
    pool: Mutex<Option<Pool>>,
}

impl Gateway {
    /// Create a gateway. Fails fast on an invalid prefix.
    pub fn new(options: ConnectionOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            pool: Mutex::new(None),
        })
    }

    /// The configured prefix.
    pub fn prefix(&self) -> &str {
        &self.options.prefix
    }

    /// Build the pool. Idempotent: a second call is a no-op.
    pub fn connect(&self) -> Result<()> {
        let mut guard = self.pool.lock().expect("gateway pool lock poisoned");
        if guard.is_some() {
            return Ok(());
        }
        let manager = Manager::from_config(
            self.options.pg.clone(),
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(self.options.pool_size)
            .build()
            .map_err(|e| Error::other(format!("failed to build connection pool: {e}")))?;
        *guard = Some(pool);
        debug!(prefix = %self.options.prefix, "database gateway connected");
        Ok(())
    }

    /// Close the pool, waiting out borrowed connections. Idempotent.
    pub fn disconnect(&self) {
        let pool = self.pool.lock().expect("gateway pool lock poisoned").take();
        if let Some(pool) = pool {
            pool.close();
            debug!("database gateway disconnected");
        }
    }

    /// Borrow one pooled connection. Transactions open on the borrowed
    /// client commit on explicit `commit()` and roll back when dropped, so
    /// any error path releases the row locks and undoes the work.
    pub async fn client(&self) -> Result<PooledClient> {
        let pool = self
            .pool
            .lock()
            .expect("gateway pool lock poisoned")
            .clone()
            .ok_or_else(|| Error::invalid_state("gateway is not connected"))?;
        Ok(pool.get().await?)
    }

    /// Open a dedicated connection for the asynchronous notification
    /// channel. The caller owns it for its whole lifetime.
    pub async fn listen_client(&self) -> Result<ListenClient> {
        let (client, mut connection) = self.options.pg.connect(NoTls).await?;
        let (tx, notifications) = mpsc::unbounded_channel();

        let driver = tokio::spawn(async move {
            let mut messages =
                futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) => {
                        if tx.send(notification).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("listener connection error: {e}");
                        break;
                    }
                }
            }
            debug!("listener connection driver finished");
        });

        Ok(ListenClient {
            client,
            notifications,
            driver,
        })
    }

    /// `"<prefix>__<logical>"`, both halves grammar-checked.
    pub fn prefixed(&self, logical: &str) -> Result<String> {
        validate_name("logical name", logical)?;
        Ok(format!("{}__{}", self.options.prefix, logical))
    }

    /// The prefixed name escaped as a SQL identifier.
    pub fn prefixed_ident(&self, logical: &str) -> Result<String> {
        Ok(escape_identifier(&self.prefixed(logical)?))
    }

    /// The prefixed name escaped as a SQL string literal.
    pub fn prefixed_literal(&self, logical: &str) -> Result<String> {
        Ok(escape_literal(&self.prefixed(logical)?))
    }
}

/// Escape an arbitrary grammar-checked name as a SQL identifier.
pub(crate) fn ident(name: &str) -> Result<String> {
    validate_name("identifier", name)?;
    Ok(escape_identifier(name))
}

/// Escape an arbitrary grammar-checked name as a SQL string literal.
pub(crate) fn literal(name: &str) -> Result<String> {
    validate_name("literal", name)?;
    Ok(escape_literal(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> Gateway {
        let options =
            ConnectionOptions::from_url("postgres://postgres@localhost/postgres").unwrap();
        Gateway::new(options).unwrap()
    }

    #[test]
    fn test_name_grammar() {
        assert!(validate_name("prefix", "horton-meta").is_ok());
        assert!(validate_name("prefix", "my_app").is_ok());
        assert!(validate_name("prefix", "-_-").is_ok());

        assert!(validate_name("prefix", "").is_err());
        assert!(validate_name("prefix", "app2").is_err());
        assert!(validate_name("prefix", "App").is_err());
        assert!(validate_name("prefix", "a b").is_err());
        assert!(validate_name("prefix", "a;DROP TABLE x;--").is_err());
        assert!(validate_name("prefix", "a:b").is_err());
    }

    #[test]
    fn test_rejects_invalid_prefix_at_construction() {
        let options = ConnectionOptions::from_url("postgres://postgres@localhost/postgres")
            .unwrap()
            .prefix("Bad Prefix");
        assert!(Gateway::new(options).is_err());
    }

    #[test]
    fn test_prefixed() {
        let gateway = gateway();
        assert_eq!(
            gateway.prefixed("event_queue").unwrap(),
            "horton-meta__event_queue"
        );
        assert!(gateway.prefixed("Event").is_err());
        assert!(gateway.prefixed("queue;--").is_err());
    }

    #[test]
    fn test_prefixed_matches_managed_name_shape() {
        let gateway = gateway();
        let shape = Regex::new(r"^[a-z_-]+(__[a-z_-]+)+$").unwrap();
        for logical in ["event_queue", "internal", "listener_trigger_orders_fn"] {
            assert!(shape.is_match(&gateway.prefixed(logical).unwrap()));
        }
    }

    #[test]
    fn test_escaping() {
        let gateway = gateway();
        assert_eq!(
            gateway.prefixed_ident("event_queue").unwrap(),
            "\"horton-meta__event_queue\""
        );
        assert_eq!(
            gateway.prefixed_literal("internal").unwrap(),
            "'horton-meta__internal'"
        );
        assert_eq!(ident("orders").unwrap(), "\"orders\"");
        assert_eq!(literal("orders").unwrap(), "'orders'");
        assert!(ident("orders; --").is_err());
    }

    #[tokio::test]
    async fn test_connect_disconnect_idempotent() {
        let gateway = gateway();
        // pool construction is lazy, no live database needed
        gateway.connect().unwrap();
        gateway.connect().unwrap();
        gateway.disconnect();
        gateway.disconnect();

        // borrowing after disconnect is an invalid-state error
        let err = gateway.client().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }
}
