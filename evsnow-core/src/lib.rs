//! The streaming ingestion engine: per-partition consumption, batch
//! assembly, ordered ingestion, checkpoint persistence, retry/backoff, and
//! coordinated graceful shutdown across many Event-Hub-to-Snowflake-table
//! mappings. See `SPEC_FULL.md` at the workspace root for the full design.

pub mod assembler;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod ports;
pub mod retry;
pub mod stats;
pub mod supervisor;
pub mod testutil;
pub mod tracer;
pub mod worker;

pub use assembler::{Batch, BatchAssembler};
pub use config::{EngineConfig, MappingConfig, RetryConfig};
pub use error::{CheckpointError, IngestChannelError, SupervisorError, WorkerError};
pub use evsnow_broker::{Event, PropertyMap, PropertyValue};
pub use orchestrator::{MappingFactory, Orchestrator, RunOutcome};
pub use ports::{AckToken, Checkpoint, CheckpointKey, CheckpointStore, ChannelHandle, IngestClient, WaitOutcome};
pub use retry::{Decision, ExponentialBackoffPolicy, FailureKind, RetryPolicy, WorkerFailure};
pub use stats::{MappingState, PartitionStats, WorkerStatus};
pub use supervisor::MappingSupervisor;
pub use tracer::{AttrValue, NoopTracer, SpanHandle, Tracer};
pub use worker::PartitionWorker;
