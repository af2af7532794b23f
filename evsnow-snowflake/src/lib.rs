//! Snowflake-backed implementations of `evsnow_core`'s ports: a
//! [`checkpoint::SnowflakeCheckpointStore`] over the `INGESTION_STATUS`
//! hybrid table, and an [`ingest_channel::SnowflakeIngestClient`] /
//! [`ingest_channel::SnowflakeChannelHandle`] pair over the SQL REST API.
//! See `SPEC_FULL.md` at the workspace root for the full design.

pub mod checkpoint;
pub mod credential;
pub mod error;
pub mod ingest_channel;
pub mod pool;
pub mod wire;

pub use checkpoint::SnowflakeCheckpointStore;
pub use credential::{ConnectionProfile, TokenProvider};
pub use error::SnowflakeError;
pub use ingest_channel::{SnowflakeChannelHandle, SnowflakeIngestClient};
pub use pool::{get_pool, SessionManager, SnowflakePool, SnowflakeSession};
pub use wire::{Binding, StatementClient};
