//! Keyed in-process event bus
//!
//! A plain `key -> list<handler>` registry with synchronous, awaited
//! fan-out. Handler invocation traverses a snapshot of the subscriber list,
//! so subscribing while an emit is in flight never perturbs that emit.

use crate::error::{Error, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// A subscribed handler: owns its captures, returns a boxed future.
pub type BusHandler<P> = Arc<dyn Fn(P) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Keyed multi-handler registry with awaited fan-out.
pub struct EventBus<P> {
    handlers: RwLock<HashMap<String, Vec<BusHandler<P>>>>,
}

impl<P: Clone + Send + 'static> EventBus<P> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for a key.
    pub async fn subscribe<F, Fut>(&self, key: impl Into<String>, handler: F)
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe_handler(key, Arc::new(move |payload| Box::pin(handler(payload))))
            .await;
    }

    /// Register an already-boxed handler (used to fan one handler out over
    /// several keys).
    pub async fn subscribe_handler(&self, key: impl Into<String>, handler: BusHandler<P>) {
        let mut handlers = self.handlers.write().await;
        handlers.entry(key.into()).or_default().push(handler);
    }

    /// Number of handlers registered for a key.
    pub async fn handler_count(&self, key: &str) -> usize {
        self.handlers
            .read()
            .await
            .get(key)
            .map_or(0, |handlers| handlers.len())
    }

    fn snapshot(
        handlers: &HashMap<String, Vec<BusHandler<P>>>,
        key: &str,
    ) -> Vec<BusHandler<P>> {
        handlers.get(key).cloned().unwrap_or_default()
    }

    /// Await every handler for `key`, swallowing individual failures so one
    /// handler cannot poison the batch. Returns the failure count.
    pub async fn emit_sync(&self, key: &str, payload: P) -> usize {
        let snapshot = Self::snapshot(&*self.handlers.read().await, key);
        let mut failures = 0;
        for handler in snapshot {
            if let Err(e) = handler(payload.clone()).await {
                warn!(key, "event handler failed: {e}");
                failures += 1;
            }
        }
        failures
    }

    /// Await every handler for `key`; every handler still runs, but the
    /// first failure is surfaced to the caller.
    pub async fn emit_strict(&self, key: &str, payload: P) -> Result<()> {
        let snapshot = Self::snapshot(&*self.handlers.read().await, key);
        let mut first_failure: Option<Error> = None;
        for handler in snapshot {
            if let Err(e) = handler(payload.clone()).await {
                warn!(key, "event handler failed: {e}");
                first_failure.get_or_insert(e);
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<P: Clone + Send + 'static> Default for EventBus<P> {
    fn default() -> Self {
        Self::new()
    }
}
