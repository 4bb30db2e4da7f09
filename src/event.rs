//! Queue row and notification types
//!
//! The queue row is the canonical log record: one durable entry per captured
//! row change, carrying the previous and current row images as JSON. The
//! queue notification is its transient counterpart pushed over the
//! asynchronous channel as `"<rowId>:<tableName>:<operation>"`.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A trigger operation on a watched source table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerOp {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl TriggerOp {
    /// All trigger operations, in trigger-clause order.
    pub const ALL: [TriggerOp; 3] = [TriggerOp::Insert, TriggerOp::Update, TriggerOp::Delete];

    /// The SQL spelling used in trigger clauses and queue rows.
    pub fn as_sql(&self) -> &'static str {
        match self {
            TriggerOp::Insert => "INSERT",
            TriggerOp::Update => "UPDATE",
            TriggerOp::Delete => "DELETE",
        }
    }
}

impl fmt::Display for TriggerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for TriggerOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INSERT" => Ok(TriggerOp::Insert),
            "UPDATE" => Ok(TriggerOp::Update),
            "DELETE" => Ok(TriggerOp::Delete),
            other => Err(Error::config(format!(
                "unknown trigger operation '{other}', expected INSERT, UPDATE or DELETE"
            ))),
        }
    }
}

/// An internal operation round-tripped through the queue by the library
/// itself, never produced by a source-table trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InternalOp {
    /// Liveness heartbeat row
    LivenessPulse,
}

impl InternalOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            InternalOp::LivenessPulse => "LIVENESS_PULSE",
        }
    }
}

impl fmt::Display for InternalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InternalOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "LIVENESS_PULSE" => Ok(InternalOp::LivenessPulse),
            other => Err(Error::config(format!(
                "unknown internal operation '{other}'"
            ))),
        }
    }
}

/// The operation recorded on a queue row: either a trigger operation from a
/// watched table or an internal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operation {
    Trigger(TriggerOp),
    Internal(InternalOp),
}

impl Operation {
    /// Check whether this is an internal operation.
    pub fn is_internal(&self) -> bool {
        matches!(self, Operation::Internal(_))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Trigger(op) => op.fmt(f),
            Operation::Internal(op) => op.fmt(f),
        }
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(op) = s.parse::<TriggerOp>() {
            return Ok(Operation::Trigger(op));
        }
        let op = s.parse::<InternalOp>().map_err(|_| {
            Error::config(format!("unknown queue operation '{s}'"))
        })?;
        Ok(Operation::Internal(op))
    }
}

impl From<TriggerOp> for Operation {
    fn from(op: TriggerOp) -> Self {
        Operation::Trigger(op)
    }
}

impl From<InternalOp> for Operation {
    fn from(op: InternalOp) -> Self {
        Operation::Internal(op)
    }
}

/// A durable queue row: one captured row change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRow {
    /// Monotonically increasing id assigned by the database
    pub id: i64,
    /// Source table name, or the reserved internal pseudo-table name
    pub table_name: String,
    /// Operation that produced this row
    pub operation: Operation,
    /// Row image before the change (null on INSERT and internal rows)
    pub previous_record: Option<serde_json::Value>,
    /// Row image after the change (derived from the old image on DELETE,
    /// metadata on internal rows, null under an empty column projection)
    pub current_record: Option<serde_json::Value>,
    /// Database clock timestamp captured inside the trigger
    pub queued_at: DateTime<Utc>,
}

impl QueueRow {
    /// Build a queue row from a `SELECT *` result row.
    pub fn from_row(row: &tokio_postgres::Row) -> Result<Self> {
        let operation: String = row.try_get("operation")?;
        Ok(Self {
            id: row.try_get("id")?,
            table_name: row.try_get("table_name")?,
            operation: operation.parse()?,
            previous_record: row.try_get("previous_record")?,
            current_record: row.try_get("current_record")?,
            queued_at: row.try_get("queued_at")?,
        })
    }
}

/// A transient notification derived from a queue row.
///
/// Carried over the notification channel as
/// `"<rowId>:<tableName>:<operation>"`. Table names cannot contain `:` (the
/// identifier grammar forbids it), so the payload splits unambiguously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNotification {
    pub row_id: i64,
    pub table_name: String,
    pub operation: Operation,
}

impl QueueNotification {
    /// Parse a channel payload. Malformed payloads yield `None`; the caller
    /// drops them and lets reconciliation recover the row.
    pub fn parse(payload: &str) -> Option<Self> {
        let parts: Vec<&str> = payload.split(':').collect();
        if parts.len() != 3 {
            return None;
        }
        let row_id = parts[0].parse::<i64>().ok()?;
        let operation = parts[2].parse::<Operation>().ok()?;
        Some(Self {
            row_id,
            table_name: parts[1].to_string(),
            operation,
        })
    }

    /// Check whether this notification refers to an internal queue row.
    pub fn is_internal(&self) -> bool {
        self.operation.is_internal()
    }

    /// The in-process bus key this notification routes to.
    ///
    /// Trigger operations route `queued:<table>:<operation>`; internal
    /// operations route `internal:<operation>`.
    pub fn bus_key(&self) -> String {
        match self.operation {
            Operation::Trigger(op) => format!("queued:{}:{}", self.table_name, op),
            Operation::Internal(op) => format!("internal:{op}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_op_round_trip() {
        for op in TriggerOp::ALL {
            assert_eq!(op.as_sql().parse::<TriggerOp>().unwrap(), op);
        }
        assert!("TRUNCATE".parse::<TriggerOp>().is_err());
        assert!("insert".parse::<TriggerOp>().is_err());
    }

    #[test]
    fn test_operation_parse() {
        assert_eq!(
            "UPDATE".parse::<Operation>().unwrap(),
            Operation::Trigger(TriggerOp::Update)
        );
        assert_eq!(
            "LIVENESS_PULSE".parse::<Operation>().unwrap(),
            Operation::Internal(InternalOp::LivenessPulse)
        );
        assert!("VACUUM".parse::<Operation>().is_err());
    }

    #[test]
    fn test_operation_serde_spelling() {
        let op = Operation::Trigger(TriggerOp::Delete);
        assert_eq!(serde_json::to_string(&op).unwrap(), "\"DELETE\"");

        let op: Operation = serde_json::from_str("\"LIVENESS_PULSE\"").unwrap();
        assert_eq!(op, Operation::Internal(InternalOp::LivenessPulse));
    }

    #[test]
    fn test_notification_parse() {
        let note = QueueNotification::parse("42:orders:INSERT").unwrap();
        assert_eq!(note.row_id, 42);
        assert_eq!(note.table_name, "orders");
        assert_eq!(note.operation, Operation::Trigger(TriggerOp::Insert));
        assert!(!note.is_internal());
        assert_eq!(note.bus_key(), "queued:orders:INSERT");
    }

    #[test]
    fn test_notification_parse_internal() {
        let note = QueueNotification::parse("7:horton-meta__internal:LIVENESS_PULSE").unwrap();
        assert!(note.is_internal());
        assert_eq!(note.bus_key(), "internal:LIVENESS_PULSE");
    }

    #[test]
    fn test_notification_parse_malformed() {
        assert!(QueueNotification::parse("").is_none());
        assert!(QueueNotification::parse("42:orders").is_none());
        assert!(QueueNotification::parse("42:orders:INSERT:extra").is_none());
        assert!(QueueNotification::parse("not-a-number:orders:INSERT").is_none());
        assert!(QueueNotification::parse("42:orders:VACUUM").is_none());
    }

    #[test]
    fn test_queue_row_serde() {
        let row = QueueRow {
            id: 1,
            table_name: "orders".into(),
            operation: Operation::Trigger(TriggerOp::Insert),
            previous_record: None,
            current_record: Some(serde_json::json!({"id": 1, "name": "a"})),
            queued_at: Utc::now(),
        };

        let json = serde_json::to_string(&row).unwrap();
        assert!(json.contains("\"operation\":\"INSERT\""));

        let parsed: QueueRow = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, 1);
        assert!(parsed.previous_record.is_none());
    }
}
