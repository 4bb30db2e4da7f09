//! Dispatcher
//!
//! Top-level lifecycle and the user-facing event surface. Binds queue
//! notifications to registered handlers keyed `<table>:<operation>` (plus the
//! `<table>:*` wildcard), reacts to liveness degradation, and owns connect /
//! disconnect / teardown for the whole system.

use crate::bus::{BusHandler, EventBus};
use crate::config::{DispatcherConfig, DEFAULT_GRACE_PERIOD};
use crate::error::Result;
use crate::event::{QueueRow, TriggerOp};
use crate::gateway::{validate_name, Gateway};
use crate::installer::TriggerInstaller;
use crate::liveness::{HealthEvent, LivenessChecker};
use crate::queue::EventQueue;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Coordinates the gateway, trigger installer, event queue and liveness
/// checker, and delivers queue rows to user handlers.
pub struct Dispatcher {
    config: DispatcherConfig,
    gateway: Arc<Gateway>,
    queue: Arc<EventQueue>,
    installer: TriggerInstaller,
    liveness: Arc<LivenessChecker>,
    user_bus: Arc<EventBus<QueueRow>>,
    wired: AtomicBool,
}

impl Dispatcher {
    /// Build a dispatcher. Configuration faults are fatal here.
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        config.validate()?;
        let gateway = Arc::new(Gateway::new(config.connection.clone())?);
        let queue = Arc::new(EventQueue::new(
            gateway.clone(),
            config.event_queue.clone(),
        )?);
        let installer = TriggerInstaller::new(gateway.clone());
        let liveness = Arc::new(LivenessChecker::new(
            queue.clone(),
            config.liveness.clone(),
        ));

        Ok(Self {
            config,
            gateway,
            queue,
            installer,
            liveness,
            user_bus: Arc::new(EventBus::new()),
            wired: AtomicBool::new(false),
        })
    }

    /// The event queue, for direct enqueue/dequeue access.
    pub fn event_queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Subscribe a handler for one `(table, operation)` pair.
    pub async fn on<F, Fut>(&self, table: &str, operation: TriggerOp, handler: F) -> Result<()>
    where
        F: Fn(QueueRow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        validate_name("table name", table)?;
        self.user_bus
            .subscribe(format!("{table}:{operation}"), handler)
            .await;
        Ok(())
    }

    /// Subscribe a wildcard handler: fires once per row on `table`
    /// regardless of operation, from the same dequeue as the
    /// operation-specific handlers.
    pub async fn on_any<F, Fut>(&self, table: &str, handler: F) -> Result<()>
    where
        F: Fn(QueueRow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        validate_name("table name", table)?;
        self.user_bus
            .subscribe(format!("{table}:*"), handler)
            .await;
        Ok(())
    }

    /// Observe health events: `heartbeat`, `healthy`, `unhealthy`, `dead`.
    pub async fn on_health<F, Fut>(&self, handler: F)
    where
        F: Fn(HealthEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: BusHandler<HealthEvent> =
            Arc::new(move |event| Box::pin(handler(event)));
        for key in ["heartbeat", "healthy", "unhealthy", "dead"] {
            self.liveness
                .bus()
                .subscribe_handler(key, handler.clone())
                .await;
        }
    }

    /// Bind queue notifications to the dequeue-and-fan-out path, and health
    /// events to their reactions. Runs once for the dispatcher's lifetime;
    /// subscriber lists survive reconnects.
    async fn wire(&self) {
        if self.wired.swap(true, Ordering::SeqCst) {
            return;
        }

        for (table, listener) in &self.config.table_listeners {
            for operation in listener.operation_set() {
                let queue = self.queue.clone();
                let user_bus = self.user_bus.clone();
                let strict = self.config.fail_dequeue_on_handler_error;
                let specific_key = format!("{table}:{operation}");
                let wildcard_key = format!("{table}:*");

                self.queue
                    .bus()
                    .subscribe(format!("queued:{table}:{operation}"), move |row_id: i64| {
                        let queue = queue.clone();
                        let user_bus = user_bus.clone();
                        let specific_key = specific_key.clone();
                        let wildcard_key = wildcard_key.clone();
                        async move {
                            queue
                                .dequeue(row_id, move |row: QueueRow| async move {
                                    if strict {
                                        user_bus
                                            .emit_strict(&specific_key, row.clone())
                                            .await?;
                                        user_bus.emit_strict(&wildcard_key, row).await?;
                                    } else {
                                        user_bus
                                            .emit_sync(&specific_key, row.clone())
                                            .await;
                                        user_bus.emit_sync(&wildcard_key, row).await;
                                    }
                                    Ok(())
                                })
                                .await?;
                            Ok(())
                        }
                    })
                    .await;
            }
        }

        // liveness reactions run on their own tasks so a reconnect or full
        // disconnect never stalls the pulse timer that triggered it
        let queue = self.queue.clone();
        self.liveness
            .bus()
            .subscribe("unhealthy", move |_event| {
                let queue = queue.clone();
                async move {
                    warn!("liveness degraded, reconnecting event queue");
                    tokio::spawn(async move {
                        if let Err(e) = queue.reconnect(DEFAULT_GRACE_PERIOD).await {
                            error!("event queue reconnect failed: {e}");
                        }
                    });
                    Ok(())
                }
            })
            .await;

        let gateway = self.gateway.clone();
        let queue = self.queue.clone();
        let liveness = self.liveness.clone();
        self.liveness
            .bus()
            .subscribe("dead", move |_event| {
                let gateway = gateway.clone();
                let queue = queue.clone();
                let liveness = liveness.clone();
                async move {
                    error!("liveness dead, disconnecting");
                    tokio::spawn(async move {
                        liveness.stop();
                        queue.disconnect(DEFAULT_GRACE_PERIOD).await;
                        gateway.disconnect();
                    });
                    Ok(())
                }
            })
            .await;
    }

    /// Connect everything: gateway, event queue, optional queue
    /// initialization, listener triggers for every configured table, then
    /// the liveness checker.
    pub async fn connect(&self, initialize_queue: bool) -> Result<()> {
        self.gateway.connect()?;
        self.queue.connect().await?;
        if initialize_queue {
            self.queue.initialize().await?;
        }
        self.wire().await;
        for (table, listener) in &self.config.table_listeners {
            self.installer.install(table, listener).await?;
        }
        // triggers left over from tables the configuration no longer watches
        for table in self.installer.find_listener_triggers().await?.keys() {
            if !self.config.table_listeners.contains_key(table) {
                self.installer.drop_listener_trigger(table).await?;
            }
        }
        self.liveness.start().await?;
        info!(
            tables = self.config.table_listeners.len(),
            "dispatcher connected"
        );
        Ok(())
    }

    /// Disconnect everything, granting in-flight dequeues the grace period
    /// (default 5 s).
    pub async fn disconnect(&self, grace_period: Option<Duration>) {
        let grace_period = grace_period.unwrap_or(DEFAULT_GRACE_PERIOD);
        self.liveness.stop();
        self.queue.disconnect(grace_period).await;
        self.gateway.disconnect();
        info!("dispatcher disconnected");
    }

    /// Drop every listener trigger and all queue objects.
    pub async fn teardown(&self) -> Result<()> {
        self.gateway.connect()?;
        self.installer.teardown().await?;
        self.queue.teardown().await?;
        info!("teardown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionOptions, TableListenerConfig};

    fn config() -> DispatcherConfig {
        let connection =
            ConnectionOptions::from_url("postgres://postgres@localhost/postgres").unwrap();
        DispatcherConfig::new(connection)
            .listen_ops("orders", [TriggerOp::Insert, TriggerOp::Update])
            .listen(
                "users",
                TableListenerConfig::ops([TriggerOp::Delete]).record_columns(["name"]),
            )
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let connection =
            ConnectionOptions::from_url("postgres://postgres@localhost/postgres")
                .unwrap()
                .prefix("NotValid");
        assert!(Dispatcher::new(DispatcherConfig::new(connection)).is_err());

        let bad_table = DispatcherConfig::new(
            ConnectionOptions::from_url("postgres://postgres@localhost/postgres").unwrap(),
        )
        .listen_ops("Orders", TriggerOp::ALL);
        assert!(Dispatcher::new(bad_table).is_err());
    }

    #[tokio::test]
    async fn test_wire_subscribes_configured_pairs() {
        let dispatcher = Dispatcher::new(config()).unwrap();
        dispatcher.wire().await;

        let bus = dispatcher.queue.bus();
        assert_eq!(bus.handler_count("queued:orders:INSERT").await, 1);
        assert_eq!(bus.handler_count("queued:orders:UPDATE").await, 1);
        assert_eq!(bus.handler_count("queued:orders:DELETE").await, 0);
        assert_eq!(bus.handler_count("queued:users:DELETE").await, 1);

        // wiring is once-only, reconnects must not double-subscribe
        dispatcher.wire().await;
        assert_eq!(bus.handler_count("queued:orders:INSERT").await, 1);
    }

    #[tokio::test]
    async fn test_wire_registers_health_reactions() {
        let dispatcher = Dispatcher::new(config()).unwrap();
        dispatcher.wire().await;

        let bus = dispatcher.liveness.bus();
        assert_eq!(bus.handler_count("unhealthy").await, 1);
        assert_eq!(bus.handler_count("dead").await, 1);
        assert_eq!(bus.handler_count("healthy").await, 0);
    }

    #[tokio::test]
    async fn test_user_subscriptions() {
        let dispatcher = Dispatcher::new(config()).unwrap();

        dispatcher
            .on("orders", TriggerOp::Insert, |_row| async { Ok(()) })
            .await
            .unwrap();
        dispatcher.on_any("orders", |_row| async { Ok(()) }).await.unwrap();

        assert_eq!(dispatcher.user_bus.handler_count("orders:INSERT").await, 1);
        assert_eq!(dispatcher.user_bus.handler_count("orders:*").await, 1);

        // table names flow through the same conservative grammar
        assert!(dispatcher
            .on("Orders", TriggerOp::Insert, |_row| async { Ok(()) })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_on_health_subscribes_all_keys() {
        let dispatcher = Dispatcher::new(config()).unwrap();
        dispatcher.on_health(|_event| async { Ok(()) }).await;

        let bus = dispatcher.liveness.bus();
        for key in ["heartbeat", "healthy", "unhealthy", "dead"] {
            assert_eq!(bus.handler_count(key).await, 1, "missing handler for {key}");
        }
    }
}
