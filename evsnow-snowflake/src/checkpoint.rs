//! [`evsnow_core::CheckpointStore`] backed by the `INGESTION_STATUS`
//! hybrid table (spec.md §6). Hybrid tables give Snowflake a real primary
//! key with row-level locking, which is what makes `save` a true
//! upsert-by-key rather than an append grounded on eventual compaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evsnow_core::error::CheckpointError;
use evsnow_core::ports::{Checkpoint, CheckpointKey, CheckpointStore};
use hashbrown::HashMap;
use serde_json::Value;
use std::time::Duration;

use crate::pool::SnowflakePool;
use crate::wire::Binding;

fn to_checkpoint_error(err: crate::error::SnowflakeError) -> CheckpointError {
    if is_object_missing(&err) {
        return CheckpointError::ControlTableMissing;
    }
    CheckpointError::PersistFailure(Box::new(err))
}

/// Snowflake raises SQL code `002003` ("object does not exist") when a
/// statement references `INGESTION_STATUS` after it's been dropped out
/// from under a running engine — distinct from a transient failure, since
/// retrying `ensure_table`/`load_all`/`save` as-is will never succeed.
fn is_object_missing(err: &crate::error::SnowflakeError) -> bool {
    matches!(err, crate::error::SnowflakeError::StatementFailed { code, .. } if code == "002003")
}

/// Bound to one pool; every call checks out a session, since checkpoint
/// traffic is bursty (one `save` per batch per partition) rather than
/// held open like a channel.
pub struct SnowflakeCheckpointStore {
    pool: SnowflakePool,
    statement_deadline: Duration,
}

impl SnowflakeCheckpointStore {
    pub fn new(pool: SnowflakePool, statement_deadline: Duration) -> Self {
        Self { pool, statement_deadline }
    }

    fn statements(&self) -> Result<crate::wire::StatementClient, crate::error::SnowflakeError> {
        let session = self.pool.get().map_err(crate::error::SnowflakeError::Pool)?;
        Ok(session.statements())
    }
}

#[async_trait]
impl CheckpointStore for SnowflakeCheckpointStore {
    async fn ensure_table(&self) -> Result<(), CheckpointError> {
        let statements = self.statements().map_err(to_checkpoint_error)?;

        let sql = r#"
CREATE HYBRID TABLE IF NOT EXISTS INGESTION_STATUS (
    TS_INSERTED TIMESTAMP_LTZ DEFAULT CURRENT_TIMESTAMP(),
    EVENTHUB_NAMESPACE VARCHAR(500) NOT NULL,
    EVENTHUB VARCHAR(200) NOT NULL,
    TARGET_DB VARCHAR(200) NOT NULL,
    TARGET_SCHEMA VARCHAR(200) NOT NULL,
    TARGET_TABLE VARCHAR(200) NOT NULL,
    WATERLEVEL NUMBER(38,0) NOT NULL,
    PARTITION_ID VARCHAR(50) NOT NULL,
    METADATA VARIANT,
    PRIMARY KEY (EVENTHUB_NAMESPACE, EVENTHUB, TARGET_DB, TARGET_SCHEMA, TARGET_TABLE, PARTITION_ID)
)"#;

        statements
            .execute_and_wait(sql, HashMap::new(), self.statement_deadline)
            .await
            .map_err(to_checkpoint_error)
    }

    async fn load_all(
        &self,
        namespace: &str,
        hub: &str,
        target_db: &str,
        target_schema: &str,
        target_table: &str,
    ) -> Result<HashMap<String, Checkpoint>, CheckpointError> {
        let statements = self.statements().map_err(to_checkpoint_error)?;

        let sql = r#"
SELECT PARTITION_ID, WATERLEVEL, TS_INSERTED, METADATA
FROM INGESTION_STATUS
WHERE EVENTHUB_NAMESPACE = :1 AND EVENTHUB = :2 AND TARGET_DB = :3 AND TARGET_SCHEMA = :4 AND TARGET_TABLE = :5"#;

        let mut bindings = HashMap::new();
        bindings.insert("1".to_string(), Binding::text(namespace));
        bindings.insert("2".to_string(), Binding::text(hub));
        bindings.insert("3".to_string(), Binding::text(target_db));
        bindings.insert("4".to_string(), Binding::text(target_schema));
        bindings.insert("5".to_string(), Binding::text(target_table));

        let rows = statements
            .query_rows(sql, bindings, self.statement_deadline)
            .await
            .map_err(to_checkpoint_error)?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let (partition_id, checkpoint) = decode_checkpoint_row(&row)?;
            out.insert(partition_id, checkpoint);
        }
        Ok(out)
    }

    async fn save(&self, key: &CheckpointKey, waterlevel: u64, metadata: Value) -> Result<(), CheckpointError> {
        let statements = self.statements().map_err(to_checkpoint_error)?;

        let sql = r#"
MERGE INTO INGESTION_STATUS AS t
USING (SELECT :1 AS ns, :2 AS hub, :3 AS db, :4 AS schema, :5 AS tbl, :6 AS partition_id, :7 AS waterlevel, PARSE_JSON(:8) AS metadata) AS s
ON t.EVENTHUB_NAMESPACE = s.ns AND t.EVENTHUB = s.hub AND t.TARGET_DB = s.db
   AND t.TARGET_SCHEMA = s.schema AND t.TARGET_TABLE = s.tbl AND t.PARTITION_ID = s.partition_id
WHEN MATCHED THEN UPDATE SET WATERLEVEL = s.waterlevel, METADATA = s.metadata, TS_INSERTED = CURRENT_TIMESTAMP()
WHEN NOT MATCHED THEN INSERT (EVENTHUB_NAMESPACE, EVENTHUB, TARGET_DB, TARGET_SCHEMA, TARGET_TABLE, PARTITION_ID, WATERLEVEL, METADATA)
VALUES (s.ns, s.hub, s.db, s.schema, s.tbl, s.partition_id, s.waterlevel, s.metadata)"#;

        let mut bindings = HashMap::new();
        bindings.insert("1".to_string(), Binding::text(key.namespace.as_str()));
        bindings.insert("2".to_string(), Binding::text(key.hub.as_str()));
        bindings.insert("3".to_string(), Binding::text(key.target_db.as_str()));
        bindings.insert("4".to_string(), Binding::text(key.target_schema.as_str()));
        bindings.insert("5".to_string(), Binding::text(key.target_table.as_str()));
        bindings.insert("6".to_string(), Binding::text(key.partition_id.as_str()));
        bindings.insert("7".to_string(), Binding::fixed(waterlevel as i64));
        bindings.insert("8".to_string(), Binding::variant(&metadata));

        statements
            .execute_and_wait(sql, bindings, self.statement_deadline)
            .await
            .map_err(to_checkpoint_error)
    }
}

/// Decodes one `SELECT PARTITION_ID, WATERLEVEL, TS_INSERTED, METADATA`
/// row, in that column order, as returned by the REST API's `data` array.
fn decode_checkpoint_row(row: &[Value]) -> Result<(String, Checkpoint), CheckpointError> {
    let malformed = || CheckpointError::PersistFailure(Box::new(crate::error::SnowflakeError::UnexpectedResponse("malformed INGESTION_STATUS row".to_string())));

    let partition_id = row.first().and_then(Value::as_str).ok_or_else(malformed)?.to_string();

    let waterlevel = row
        .get(1)
        .and_then(|v| v.as_str().and_then(|s| s.parse::<u64>().ok()).or_else(|| v.as_u64()))
        .ok_or_else(malformed)?;

    let ts_inserted = row
        .get(2)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let metadata = row.get(3).cloned().unwrap_or(Value::Null);

    Ok((partition_id, Checkpoint { waterlevel, ts_inserted, metadata }))
}
