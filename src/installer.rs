//! Trigger installer
//!
//! Code-generates and installs the per-source-table trigger/function pairs
//! that serialise row images into the event queue. Installed state is
//! discovered back out of `information_schema.triggers`, so install,
//! enumerate and teardown all key off the deterministic name prefix.

use crate::config::TableListenerConfig;
use crate::error::Result;
use crate::event::TriggerOp;
use crate::gateway::{ident, literal, Gateway};
use crate::queue::QUEUE_TABLE;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Build the row-image expression for one side of a change.
///
/// `source` is `OLD` or `NEW`. No projection uses the whole row; an empty
/// projection produces no payload; a non-empty projection builds a keyed
/// record of exactly the listed columns, in list order (`json`, not `jsonb`,
/// so the database never reorders the keys).
fn record_expr(source: &str, record_columns: Option<&[String]>) -> Result<String> {
    match record_columns {
        None => Ok(format!("to_json({source})")),
        Some([]) => Ok("NULL::json".to_string()),
        Some(columns) => {
            let mut pairs = Vec::with_capacity(columns.len());
            for column in columns {
                pairs.push(format!("{}, {source}.{}", literal(column)?, ident(column)?));
            }
            Ok(format!("json_build_object({})", pairs.join(", ")))
        }
    }
}

/// The trigger function for one watched table: computes both row images,
/// inserts one queue row stamped with `clock_timestamp()`, and converts a
/// unique-constraint violation into a notice so a trigger storm cannot abort
/// the host transaction.
fn create_function_sql(
    function_ident: &str,
    queue_ident: &str,
    table_literal: &str,
    config: &TableListenerConfig,
) -> Result<String> {
    let columns = config.record_columns.as_deref();
    let old_expr = record_expr("OLD", columns)?;
    let new_expr = record_expr("NEW", columns)?;

    Ok(format!(
        r#"CREATE OR REPLACE FUNCTION {function_ident}() RETURNS trigger AS $trigstream$
DECLARE
    previous_record json;
    current_record json;
BEGIN
    IF TG_OP = 'INSERT' THEN
        previous_record := NULL;
        current_record := {new_expr};
    ELSIF TG_OP = 'UPDATE' THEN
        previous_record := {old_expr};
        current_record := {new_expr};
    ELSE
        previous_record := {old_expr};
        current_record := {old_expr};
    END IF;

    INSERT INTO {queue_ident} (table_name, operation, previous_record, current_record, queued_at)
    VALUES ({table_literal}, TG_OP, previous_record, current_record, clock_timestamp());

    RETURN NULL;
EXCEPTION WHEN unique_violation THEN
    RAISE NOTICE 'change already queued for table % operation %', {table_literal}, TG_OP;
    RETURN NULL;
END;
$trigstream$ LANGUAGE plpgsql;"#
    ))
}

/// The trigger binding: AFTER the union of requested operations, FOR EACH ROW.
fn create_trigger_sql(
    trigger_ident: &str,
    table_ident: &str,
    function_ident: &str,
    operations: &[TriggerOp],
) -> String {
    let events = operations
        .iter()
        .map(TriggerOp::as_sql)
        .collect::<Vec<_>>()
        .join(" OR ");
    format!(
        "DROP TRIGGER IF EXISTS {trigger_ident} ON {table_ident};\n\
         CREATE TRIGGER {trigger_ident}\n\
         AFTER {events} ON {table_ident}\n\
         FOR EACH ROW EXECUTE FUNCTION {function_ident}();"
    )
}

/// Escape `LIKE` metacharacters so a prefix search matches literally.
fn like_prefix_pattern(prefix: &str) -> String {
    let escaped = prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("{escaped}%")
}

/// Installs and removes the per-source-table trigger machinery.
pub struct TriggerInstaller {
    gateway: Arc<Gateway>,
}

impl TriggerInstaller {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    fn trigger_logical(table: &str) -> String {
        format!("listener_trigger_{table}")
    }

    fn function_logical(table: &str) -> String {
        format!("listener_trigger_{table}_fn")
    }

    /// Create (or idempotently re-create) the trigger/function pair for one
    /// watched table, in one transaction.
    pub async fn install(&self, table: &str, config: &TableListenerConfig) -> Result<()> {
        config.validate(table)?;

        let function_ident = self
            .gateway
            .prefixed_ident(&Self::function_logical(table))?;
        let trigger_ident = self.gateway.prefixed_ident(&Self::trigger_logical(table))?;
        let queue_ident = self.gateway.prefixed_ident(QUEUE_TABLE)?;
        let table_ident = ident(table)?;
        let table_literal = literal(table)?;

        let function_sql =
            create_function_sql(&function_ident, &queue_ident, &table_literal, config)?;
        let trigger_sql = create_trigger_sql(
            &trigger_ident,
            &table_ident,
            &function_ident,
            &config.operation_set(),
        );

        let mut client = self.gateway.client().await?;
        let tx = client.transaction().await?;
        tx.batch_execute(&function_sql).await?;
        tx.batch_execute(&trigger_sql).await?;
        tx.commit().await?;

        info!(table, operations = ?config.operation_set(), "installed listener trigger");
        Ok(())
    }

    /// Discover installed listener triggers from the catalogue, grouped by
    /// source table with their operation sets.
    pub async fn find_listener_triggers(
        &self,
    ) -> Result<BTreeMap<String, BTreeSet<TriggerOp>>> {
        let name_prefix =
            like_prefix_pattern(&self.gateway.prefixed(&Self::trigger_logical(""))?);

        let client = self.gateway.client().await?;
        let rows = client
            .query(
                "SELECT event_object_table, event_manipulation \
                 FROM information_schema.triggers \
                 WHERE trigger_name LIKE $1 \
                 ORDER BY event_object_table, event_manipulation",
                &[&name_prefix],
            )
            .await?;

        let mut installed: BTreeMap<String, BTreeSet<TriggerOp>> = BTreeMap::new();
        for row in rows {
            let table: String = row.try_get("event_object_table")?;
            let manipulation: String = row.try_get("event_manipulation")?;
            if let Ok(op) = manipulation.parse::<TriggerOp>() {
                installed.entry(table).or_default().insert(op);
            }
        }
        debug!(count = installed.len(), "discovered listener triggers");
        Ok(installed)
    }

    /// Drop the trigger/function pair for one table, in one transaction.
    pub async fn drop_listener_trigger(&self, table: &str) -> Result<()> {
        let function_ident = self
            .gateway
            .prefixed_ident(&Self::function_logical(table))?;
        let trigger_ident = self.gateway.prefixed_ident(&Self::trigger_logical(table))?;
        let table_ident = ident(table)?;

        let mut client = self.gateway.client().await?;
        let tx = client.transaction().await?;
        tx.batch_execute(&format!(
            "DROP TRIGGER IF EXISTS {trigger_ident} ON {table_ident};\n\
             DROP FUNCTION IF EXISTS {function_ident}();"
        ))
        .await?;
        tx.commit().await?;

        info!(table, "dropped listener trigger");
        Ok(())
    }

    /// Discover and drop every installed listener trigger in one transaction.
    pub async fn teardown(&self) -> Result<usize> {
        let installed = self.find_listener_triggers().await?;
        if installed.is_empty() {
            return Ok(0);
        }

        let mut statements = Vec::with_capacity(installed.len() * 2);
        for table in installed.keys() {
            let function_ident = self
                .gateway
                .prefixed_ident(&Self::function_logical(table))?;
            let trigger_ident =
                self.gateway.prefixed_ident(&Self::trigger_logical(table))?;
            let table_ident = ident(table)?;
            statements.push(format!(
                "DROP TRIGGER IF EXISTS {trigger_ident} ON {table_ident}"
            ));
            statements.push(format!("DROP FUNCTION IF EXISTS {function_ident}()"));
        }

        let mut client = self.gateway.client().await?;
        let tx = client.transaction().await?;
        tx.batch_execute(&statements.join(";\n")).await?;
        tx.commit().await?;

        info!(count = installed.len(), "tore down listener triggers");
        Ok(installed.len())
    }
}
