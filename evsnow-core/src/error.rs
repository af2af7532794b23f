use crate::retry::FailureKind;
use evsnow_broker::BrokerError;
use miette::Diagnostic;
use thiserror::Error;

/// Failure taxonomy, matching spec.md §7 one-to-one.
#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointError {
    #[error("checkpoint persist failed")]
    PersistFailure(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("the control table is missing")]
    ControlTableMissing,

    #[error("checkpoint save did not complete within the configured timeout")]
    SaveTimeout,
}

impl CheckpointError {
    pub fn is_transient(&self) -> bool {
        match self {
            CheckpointError::PersistFailure(_) | CheckpointError::SaveTimeout => true,
            CheckpointError::ControlTableMissing => false,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum IngestChannelError {
    #[error("transient ingest failure: {0}")]
    Transient(String),

    #[error("permanent ingest failure: {0}")]
    Permanent(String),

    #[error("durable ack was not received within the deadline")]
    DurabilityTimeout,
}

impl IngestChannelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestChannelError::Transient(_) | IngestChannelError::DurabilityTimeout)
    }
}

/// An error a [`crate::PartitionWorker`] could not recover from in place.
/// Raised to the [`crate::MappingSupervisor`], which raises it in turn to
/// the [`crate::Orchestrator`] (spec.md §4.4, §7). Every variant carries
/// the [`FailureKind`] that triggered it, how many attempts had already
/// been made, and the last sequence number this partition had
/// successfully committed, so the supervisor can log all of it without
/// reaching back into the worker that no longer exists.
#[derive(Debug, Error, Diagnostic)]
pub enum WorkerError {
    #[error("broker error on partition {partition} ({kind:?}, attempt {attempts})")]
    Broker {
        partition: String,
        kind: FailureKind,
        attempts: u32,
        last_committed_sequence: Option<u64>,
        #[source]
        source: BrokerError,
    },

    #[error("checkpoint error on partition {partition} ({kind:?}, attempt {attempts})")]
    Checkpoint {
        partition: String,
        kind: FailureKind,
        attempts: u32,
        last_committed_sequence: Option<u64>,
        #[source]
        source: CheckpointError,
    },

    #[error("ingest channel error on partition {partition} ({kind:?}, attempt {attempts})")]
    IngestChannel {
        partition: String,
        kind: FailureKind,
        attempts: u32,
        last_committed_sequence: Option<u64>,
        #[source]
        source: IngestChannelError,
    },

    #[error("retry policy gave up after {attempts} attempts on partition {partition} ({kind:?})")]
    RetriesExhausted {
        partition: String,
        kind: FailureKind,
        attempts: u32,
        last_committed_sequence: Option<u64>,
    },
}

impl WorkerError {
    pub fn partition(&self) -> &str {
        match self {
            WorkerError::Broker { partition, .. }
            | WorkerError::Checkpoint { partition, .. }
            | WorkerError::IngestChannel { partition, .. }
            | WorkerError::RetriesExhausted { partition, .. } => partition,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            WorkerError::Broker { kind, .. }
            | WorkerError::Checkpoint { kind, .. }
            | WorkerError::IngestChannel { kind, .. }
            | WorkerError::RetriesExhausted { kind, .. } => *kind,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            WorkerError::Broker { attempts, .. }
            | WorkerError::Checkpoint { attempts, .. }
            | WorkerError::IngestChannel { attempts, .. }
            | WorkerError::RetriesExhausted { attempts, .. } => *attempts,
        }
    }

    pub fn last_committed_sequence(&self) -> Option<u64> {
        match self {
            WorkerError::Broker { last_committed_sequence, .. }
            | WorkerError::Checkpoint { last_committed_sequence, .. }
            | WorkerError::IngestChannel { last_committed_sequence, .. }
            | WorkerError::RetriesExhausted { last_committed_sequence, .. } => *last_committed_sequence,
        }
    }
}

/// One mapping's set of workers failed to start or a worker raised a fatal
/// error that the supervisor could not isolate. spec.md §7: a failed
/// mapping does not cancel other mappings.
#[derive(Debug, Error, Diagnostic)]
pub enum SupervisorError {
    #[error("error enumerating partitions")]
    PartitionEnumeration(#[source] BrokerError),

    #[error("error ensuring the control table exists")]
    EnsureControlTable(#[source] CheckpointError),

    #[error("worker for partition {0} failed")]
    WorkerFailed(String, #[source] WorkerError),

    #[error("couldn't spawn a worker task")]
    TaskSpawnFailure(#[source] std::io::Error),

    #[error("couldn't join a worker task")]
    TaskJoinFailure(#[source] tokio::task::JoinError),

    #[error("orchestrator asked for an unconfigured mapping {0}")]
    UnknownMapping(String),
}

/// Errors the orchestrator itself can raise, distinct from a single
/// mapping failing (which is recorded in [`crate::RunOutcome`], not
/// returned as an `Err`).
#[derive(Debug, Error, Diagnostic)]
pub enum OrchestratorError {
    #[error("couldn't install a signal handler")]
    SignalHandlerInstall(#[source] std::io::Error),

    #[error("couldn't join a mapping supervisor task")]
    TaskJoinFailure(#[source] tokio::task::JoinError),
}
