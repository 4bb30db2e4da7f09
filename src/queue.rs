//! Event queue
//!
//! The durable, transactional change log. Source-table triggers insert queue
//! rows; the queue table's own insert trigger pushes
//! `"<rowId>:<tableName>:<operation>"` over a notification channel; a
//! periodic reconciler sweeps for rows whose notification was lost. Each row
//! is dequeued under a row-level lock in its own transaction, the registered
//! callback runs at most once per row, and the row is deleted only when the
//! callback returns successfully.

use crate::bus::EventBus;
use crate::config::EventQueueOptions;
use crate::error::{Error, Result};
use crate::event::{InternalOp, Operation, QueueNotification, QueueRow, TriggerOp};
use crate::gateway::Gateway;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Logical name of the queue table.
pub(crate) const QUEUE_TABLE: &str = "event_queue";

/// Logical name of the queue insert trigger.
const QUEUE_TRIGGER: &str = "event_queue_trigger";

/// Logical name of the queue insert trigger's function.
const QUEUE_TRIGGER_FUNCTION: &str = "event_queue_trigger_function";

/// Logical name of the notification channel.
const NOTIFICATION_CHANNEL: &str = "event_queue_notifications";

/// Logical name of the reserved internal pseudo-table.
const INTERNAL_TABLE: &str = "internal";

/// Upper bound on rows visited per reconciliation sweep.
const RECONCILE_BATCH_LIMIT: i64 = 1_000;

/// Expected queue-table signature: (column, data type, nullable), in
/// ordinal order. A pre-existing table deviating in any way is rejected.
const EXPECTED_COLUMNS: [(&str, &str, bool); 6] = [
    ("id", "bigint", false),
    ("table_name", "text", false),
    ("operation", "text", false),
    ("previous_record", "json", true),
    ("current_record", "json", true),
    ("queued_at", "timestamp with time zone", false),
];

/// Compare a live column signature against the expected one. Returns a
/// human-readable description of the first deviation.
fn check_signature(actual: &[(String, String, bool)]) -> std::result::Result<(), String> {
    if actual.len() != EXPECTED_COLUMNS.len() {
        return Err(format!(
            "expected {} columns, found {}",
            EXPECTED_COLUMNS.len(),
            actual.len()
        ));
    }
    for ((name, data_type, nullable), (expected_name, expected_type, expected_nullable)) in
        actual.iter().zip(EXPECTED_COLUMNS)
    {
        if name != expected_name {
            return Err(format!("expected column '{expected_name}', found '{name}'"));
        }
        if data_type != expected_type {
            return Err(format!(
                "column '{name}' has type '{data_type}', expected '{expected_type}'"
            ));
        }
        if *nullable != expected_nullable {
            return Err(format!(
                "column '{name}' nullability is {nullable}, expected {expected_nullable}"
            ));
        }
    }
    Ok(())
}

/// Owns the queue table, its insert trigger, the listener connection and the
/// reconciler.
pub struct EventQueue {
    gateway: Arc<Gateway>,
    options: EventQueueOptions,
    bus: Arc<EventBus<i64>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    reconciler: Mutex<Option<JoinHandle<()>>>,

    // names and statements, fixed at construction
    queue_raw: String,
    queue_ident: String,
    channel_raw: String,
    channel_ident: String,
    channel_literal: String,
    trigger_ident: String,
    function_ident: String,
    internal_table: String,
    insert_sql: String,
    select_for_update_sql: String,
    delete_sql: String,
    reconcile_sql: String,
}

impl EventQueue {
    pub fn new(gateway: Arc<Gateway>, options: EventQueueOptions) -> Result<Self> {
        let queue_raw = gateway.prefixed(QUEUE_TABLE)?;
        let queue_ident = gateway.prefixed_ident(QUEUE_TABLE)?;
        let insert_sql = format!(
            "INSERT INTO {queue_ident} \
             (table_name, operation, previous_record, current_record, queued_at) \
             VALUES ($1, $2, $3, $4, clock_timestamp()) RETURNING id"
        );
        let select_for_update_sql = format!(
            "SELECT id, table_name, operation, previous_record, current_record, queued_at \
             FROM {queue_ident} WHERE id = $1 FOR UPDATE"
        );
        let delete_sql = format!("DELETE FROM {queue_ident} WHERE id = $1");
        let reconcile_sql = format!(
            "SELECT id, table_name, operation FROM {queue_ident} \
             ORDER BY queued_at ASC FOR UPDATE SKIP LOCKED LIMIT {RECONCILE_BATCH_LIMIT}"
        );

        Ok(Self {
            channel_raw: gateway.prefixed(NOTIFICATION_CHANNEL)?,
            channel_ident: gateway.prefixed_ident(NOTIFICATION_CHANNEL)?,
            channel_literal: gateway.prefixed_literal(NOTIFICATION_CHANNEL)?,
            trigger_ident: gateway.prefixed_ident(QUEUE_TRIGGER)?,
            function_ident: gateway.prefixed_ident(QUEUE_TRIGGER_FUNCTION)?,
            internal_table: gateway.prefixed(INTERNAL_TABLE)?,
            gateway,
            options,
            bus: Arc::new(EventBus::new()),
            listener: Mutex::new(None),
            reconciler: Mutex::new(None),
            queue_raw,
            queue_ident,
            insert_sql,
            select_for_update_sql,
            delete_sql,
            reconcile_sql,
        })
    }

    /// The in-process bus carrying row ids, keyed `queued:<table>:<op>` and
    /// `internal:<op>`.
    pub(crate) fn bus(&self) -> &Arc<EventBus<i64>> {
        &self.bus
    }

    /// The queue table's name as created in the database.
    pub fn table_name(&self) -> &str {
        &self.queue_raw
    }

    /// The reserved pseudo-table name carried by internal queue rows.
    pub fn internal_table_name(&self) -> &str {
        &self.internal_table
    }

    fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n\
             \x20   id BIGSERIAL PRIMARY KEY,\n\
             \x20   table_name TEXT NOT NULL,\n\
             \x20   operation TEXT NOT NULL,\n\
             \x20   previous_record JSON,\n\
             \x20   current_record JSON,\n\
             \x20   queued_at TIMESTAMPTZ NOT NULL\n\
             )",
            self.queue_ident
        )
    }

    fn create_trigger_sql(&self) -> String {
        format!(
            "CREATE OR REPLACE FUNCTION {function}() RETURNS trigger AS $trigstream$\n\
             BEGIN\n\
             \x20   PERFORM pg_notify({channel}, NEW.id || ':' || NEW.table_name || ':' || NEW.operation);\n\
             \x20   RETURN NULL;\n\
             END;\n\
             $trigstream$ LANGUAGE plpgsql;\n\
             DROP TRIGGER IF EXISTS {trigger} ON {queue};\n\
             CREATE TRIGGER {trigger}\n\
             AFTER INSERT ON {queue}\n\
             FOR EACH ROW EXECUTE FUNCTION {function}();",
            function = self.function_ident,
            channel = self.channel_literal,
            trigger = self.trigger_ident,
            queue = self.queue_ident,
        )
    }

    /// Create the queue table if needed, validate its column signature, and
    /// create/replace the insert trigger, all in one transaction.
    pub async fn initialize(&self) -> Result<()> {
        let mut client = self.gateway.client().await?;
        let tx = client.transaction().await?;
        tx.batch_execute(&self.create_table_sql()).await?;

        let rows = tx
            .query(
                "SELECT column_name, data_type, is_nullable \
                 FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1 \
                 ORDER BY ordinal_position",
                &[&self.queue_raw],
            )
            .await?;
        let actual: Vec<(String, String, bool)> = rows
            .iter()
            .map(|row| {
                let nullable: String = row.get("is_nullable");
                (
                    row.get("column_name"),
                    row.get("data_type"),
                    nullable == "YES",
                )
            })
            .collect();
        check_signature(&actual).map_err(Error::schema_mismatch)?;

        tx.batch_execute(&self.create_trigger_sql()).await?;
        tx.commit().await?;
        info!(table = %self.queue_raw, "event queue initialized");
        Ok(())
    }

    async fn insert_row(
        &self,
        table_name: &str,
        operation: &str,
        previous_record: Option<serde_json::Value>,
        current_record: Option<serde_json::Value>,
    ) -> Result<i64> {
        let mut client = self.gateway.client().await?;
        let tx = client.transaction().await?;
        let row = tx
            .query_one(
                &self.insert_sql,
                &[&table_name, &operation, &previous_record, &current_record],
            )
            .await?;
        tx.commit().await?;
        Ok(row.get(0))
    }

    /// Enqueue one row in a fresh transaction. The queue-table trigger fires
    /// the channel notification on commit.
    pub async fn queue(
        &self,
        table_name: &str,
        operation: TriggerOp,
        previous_record: Option<serde_json::Value>,
        current_record: Option<serde_json::Value>,
    ) -> Result<i64> {
        self.insert_row(table_name, operation.as_sql(), previous_record, current_record)
            .await
    }

    /// Enqueue an internal row carrying `metadata` as its current record.
    pub async fn queue_internal(
        &self,
        operation: InternalOp,
        metadata: serde_json::Value,
    ) -> Result<i64> {
        self.insert_row(&self.internal_table, operation.as_str(), None, Some(metadata))
            .await
    }

    /// Dequeue one row under a row-level lock.
    ///
    /// Locks the row `FOR UPDATE`, invokes the callback with it, deletes it,
    /// and commits, all in one transaction. Returns `false` without
    /// invoking the callback when the row is already gone (dequeued by this
    /// or a concurrent worker). A callback error rolls the transaction back
    /// and leaves the row for retry via reconciliation, so a committed
    /// dequeue implies a successful callback return.
    pub async fn dequeue<F, Fut>(&self, row_id: i64, callback: F) -> Result<bool>
    where
        F: FnOnce(QueueRow) -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send,
    {
        let mut client = self.gateway.client().await?;
        let tx = client.transaction().await?;
        let row = tx
            .query_opt(&self.select_for_update_sql, &[&row_id])
            .await?;
        let Some(row) = row else {
            debug!(row_id, "queue row already dequeued");
            return Ok(false);
        };
        let queue_row = QueueRow::from_row(&row)?;
        callback(queue_row).await?;
        tx.execute(&self.delete_sql, &[&row_id]).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Start the listener connection and the reconciliation timer.
    /// Idempotent while connected.
    pub async fn connect(&self) -> Result<()> {
        {
            let listener = self.listener.lock().expect("listener lock poisoned");
            if listener.is_some() {
                return Ok(());
            }
        }

        let mut listen = self.gateway.listen_client().await?;
        listen
            .client()
            .batch_execute(&format!("LISTEN {}", self.channel_ident))
            .await?;

        let bus = self.bus.clone();
        let channel = self.channel_raw.clone();
        let ingest = tokio::spawn(async move {
            while let Some(notification) = listen.recv().await {
                if notification.channel() != channel {
                    continue;
                }
                let Some(note) = QueueNotification::parse(notification.payload()) else {
                    debug!(
                        payload = notification.payload(),
                        "dropping malformed notification"
                    );
                    continue;
                };
                bus.emit_sync(&note.bus_key(), note.row_id).await;
            }
            debug!("notification stream ended");
        });
        *self.listener.lock().expect("listener lock poisoned") = Some(ingest);

        let gateway = self.gateway.clone();
        let bus = self.bus.clone();
        let reconcile_sql = self.reconcile_sql.clone();
        let period = self.options.reconciliation_frequency;
        let reconciler = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if let Err(e) = reconcile_once(&gateway, &bus, &reconcile_sql).await {
                    warn!("reconciliation sweep failed: {e}");
                }
            }
        });
        *self.reconciler.lock().expect("reconciler lock poisoned") = Some(reconciler);

        info!(channel = %self.channel_raw, "event queue connected");
        Ok(())
    }

    /// Stop the reconciler, force-release the listener connection, then wait
    /// out the grace period so in-flight dequeues may finish.
    pub async fn disconnect(&self, grace_period: Duration) {
        let reconciler = self
            .reconciler
            .lock()
            .expect("reconciler lock poisoned")
            .take();
        if let Some(handle) = reconciler {
            handle.abort();
        }
        let listener = self.listener.lock().expect("listener lock poisoned").take();
        if let Some(handle) = listener {
            handle.abort();
        }
        tokio::time::sleep(grace_period).await;
        info!("event queue disconnected");
    }

    /// Disconnect with a cooldown, then connect again. Driven by the
    /// liveness checker when the round trip degrades.
    pub async fn reconnect(&self, cooldown: Duration) -> Result<()> {
        warn!("event queue reconnecting");
        self.disconnect(cooldown).await;
        self.connect().await
    }

    /// Drop the queue trigger, its function and the queue table, in one
    /// transaction.
    pub async fn teardown(&self) -> Result<()> {
        let mut client = self.gateway.client().await?;
        let tx = client.transaction().await?;
        tx.batch_execute(&format!(
            "DROP TRIGGER IF EXISTS {trigger} ON {queue};\n\
             DROP FUNCTION IF EXISTS {function}();\n\
             DROP TABLE IF EXISTS {queue}",
            trigger = self.trigger_ident,
            function = self.function_ident,
            queue = self.queue_ident,
        ))
        .await?;
        tx.commit().await?;
        info!(table = %self.queue_raw, "event queue torn down");
        Ok(())
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        for slot in [&self.reconciler, &self.listener] {
            if let Ok(mut guard) = slot.lock() {
                if let Some(handle) = guard.take() {
                    handle.abort();
                }
            }
        }
    }
}

/// One reconciliation sweep: read unclaimed rows under `SKIP LOCKED`, close
/// the transaction to release the speculative locks, then re-emit the same
/// in-process notifications the channel would have carried. The actual
/// dequeue happens in each handler's own transaction.
async fn reconcile_once(
    gateway: &Gateway,
    bus: &EventBus<i64>,
    reconcile_sql: &str,
) -> Result<()> {
    let rows = {
        let mut client = gateway.client().await?;
        let tx = client.transaction().await?;
        let rows = tx.query(reconcile_sql, &[]).await?;
        tx.rollback().await?;
        rows
    };

    let mut emitted = 0usize;
    for row in rows {
        let row_id: i64 = row.try_get("id")?;
        let table_name: String = row.try_get("table_name")?;
        let operation: String = row.try_get("operation")?;
        let Ok(operation) = operation.parse::<Operation>() else {
            warn!(row_id, operation = %operation, "queue row carries unknown operation");
            continue;
        };
        let note = QueueNotification {
            row_id,
            table_name,
            operation,
        };
        bus.emit_sync(&note.bus_key(), note.row_id).await;
        emitted += 1;
    }
    if emitted > 0 {
        debug!(emitted, "reconciled unclaimed queue rows");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionOptions;

    fn queue() -> EventQueue {
        let options =
            ConnectionOptions::from_url("postgres://postgres@localhost/postgres").unwrap();
        let gateway = Arc::new(Gateway::new(options).unwrap());
        EventQueue::new(gateway, EventQueueOptions::default()).unwrap()
    }

    fn expected_signature() -> Vec<(String, String, bool)> {
        EXPECTED_COLUMNS
            .iter()
            .map(|(name, ty, nullable)| (name.to_string(), ty.to_string(), *nullable))
            .collect()
    }

    #[test]
    fn test_signature_accepts_expected() {
        assert!(check_signature(&expected_signature()).is_ok());
    }

    #[test]
    fn test_signature_rejects_missing_column() {
        let mut actual = expected_signature();
        actual.pop();
        let err = check_signature(&actual).unwrap_err();
        assert!(err.contains("expected 6 columns"));
    }

    #[test]
    fn test_signature_rejects_type_change() {
        let mut actual = expected_signature();
        actual[2].1 = "integer".to_string();
        let err = check_signature(&actual).unwrap_err();
        assert!(err.contains("'operation'"));
        assert!(err.contains("integer"));
    }

    #[test]
    fn test_signature_rejects_nullability_change() {
        let mut actual = expected_signature();
        actual[5].2 = true;
        let err = check_signature(&actual).unwrap_err();
        assert!(err.contains("queued_at"));
    }

    #[test]
    fn test_signature_rejects_reordered_columns() {
        let mut actual = expected_signature();
        actual.swap(1, 2);
        assert!(check_signature(&actual).is_err());
    }

    #[test]
    fn test_managed_names() {
        let queue = queue();
        assert_eq!(queue.table_name(), "horton-meta__event_queue");
        assert_eq!(queue.internal_table_name(), "horton-meta__internal");
    }

    #[test]
    fn test_create_table_sql() {
        let sql = queue().create_table_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"horton-meta__event_queue\""));
        assert!(sql.contains("id BIGSERIAL PRIMARY KEY"));
        assert!(sql.contains("queued_at TIMESTAMPTZ NOT NULL"));
        assert!(sql.contains("previous_record JSON"));
    }

    #[test]
    fn test_create_trigger_sql() {
        let sql = queue().create_trigger_sql();
        assert!(sql.contains("pg_notify('horton-meta__event_queue_notifications'"));
        assert!(sql.contains("NEW.id || ':' || NEW.table_name || ':' || NEW.operation"));
        assert!(sql.contains("AFTER INSERT ON \"horton-meta__event_queue\""));
        assert!(sql.contains("FOR EACH ROW"));
    }

    #[test]
    fn test_statement_shapes() {
        let queue = queue();
        assert!(queue.select_for_update_sql.ends_with("WHERE id = $1 FOR UPDATE"));
        assert!(queue.reconcile_sql.contains("ORDER BY queued_at ASC"));
        assert!(queue.reconcile_sql.contains("FOR UPDATE SKIP LOCKED"));
        assert!(queue.reconcile_sql.contains("LIMIT 1000"));
        assert!(queue.insert_sql.contains("clock_timestamp()"));
        assert!(queue.insert_sql.ends_with("RETURNING id"));
    }
}
