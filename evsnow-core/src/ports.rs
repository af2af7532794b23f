//! The two leaf abstractions `PartitionWorker` drives: a durable
//! checkpoint store and a streaming ingest channel (spec.md §4.1, §4.2).
//! The concrete Snowflake-backed implementations live in `evsnow-snowflake`
//! and depend on this crate to implement these traits, rather than the
//! other way around, so `evsnow-core` can be tested with nothing but the
//! in-memory doubles in [`crate::testutil`].

use crate::error::{CheckpointError, IngestChannelError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use serde_json::Value;
use std::time::Duration;

/// The composite primary key of one checkpoint row (spec.md §3, §6).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointKey {
    pub namespace: String,
    pub hub: String,
    pub target_db: String,
    pub target_schema: String,
    pub target_table: String,
    pub partition_id: String,
}

impl CheckpointKey {
    pub fn new(
        namespace: impl Into<String>,
        hub: impl Into<String>,
        target_db: impl Into<String>,
        target_schema: impl Into<String>,
        target_table: impl Into<String>,
        partition_id: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            hub: hub.into(),
            target_db: target_db.into(),
            target_schema: target_schema.into(),
            target_table: target_table.into(),
            partition_id: partition_id.into(),
        }
    }
}

/// A checkpoint row: the last durably-ingested sequence number for one
/// partition, plus free-form metadata (offset, client id, batch size).
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub waterlevel: u64,
    pub ts_inserted: DateTime<Utc>,
    pub metadata: Value,
}

/// Durable reads and writes of per-partition high-water marks (spec.md
/// §4.1). Implementations must make `save` an atomic upsert keyed by
/// [`CheckpointKey`], and must be safe to share across every worker of
/// every mapping (internally pooled, not a single shared connection).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Idempotently create the control table and its schema if absent.
    async fn ensure_table(&self) -> Result<(), CheckpointError>;

    /// Snapshot read of every partition's checkpoint for one
    /// (namespace, hub, target) triple. Missing partitions are simply
    /// absent from the map — that is not an error.
    async fn load_all(
        &self,
        namespace: &str,
        hub: &str,
        target_db: &str,
        target_schema: &str,
        target_table: &str,
    ) -> Result<HashMap<String, Checkpoint>, CheckpointError>;

    /// Atomically upsert one checkpoint row. Once this returns `Ok`, the
    /// checkpoint is durable.
    async fn save(
        &self,
        key: &CheckpointKey,
        waterlevel: u64,
        metadata: Value,
    ) -> Result<(), CheckpointError>;
}

/// An opaque token identifying a sent batch's position in the server's
/// streaming buffer (spec.md §4.2). Never inspected by the core beyond
/// passing it to `wait_for_durable`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckToken(pub String);

/// The result of waiting for a batch's durable ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Durable,
    Timeout,
}

/// A short-lived per-partition session with the streaming ingest service
/// (spec.md §4.2). Exactly one batch is ever in flight through one handle
/// at a time; the worker enforces that, not the handle.
#[async_trait]
pub trait ChannelHandle: Send {
    /// Enqueue `rows` into the server's streaming buffer. Does not block
    /// for durability; returns a token identifying the batch.
    async fn send(&mut self, rows: Vec<Value>) -> Result<AckToken, IngestChannelError>;

    /// Block until the server confirms `token`'s batch is committed, or
    /// `deadline` elapses.
    async fn wait_for_durable(
        &mut self,
        token: &AckToken,
        deadline: Duration,
    ) -> Result<WaitOutcome, IngestChannelError>;

    /// Flush any pending rows and release server-side resources.
    async fn close(&mut self) -> Result<(), IngestChannelError>;
}

/// A long-lived connection context bound to one account + user + PIPE,
/// exclusively owning the set of [`ChannelHandle`]s opened under it
/// (spec.md §4.2). Shared by every worker of one mapping.
#[async_trait]
pub trait IngestClient: Send + Sync {
    /// Idempotent: returns a handle to the same underlying channel if one
    /// is already open for `partition_id`.
    async fn open(&self, partition_id: &str) -> Result<Box<dyn ChannelHandle>, IngestChannelError>;

    /// Close every channel opened under this client.
    async fn close(&self) -> Result<(), IngestChannelError>;
}
