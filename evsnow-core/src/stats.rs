//! Read-only snapshots of engine state, exposed by
//! [`crate::MappingSupervisor`] and [`crate::Orchestrator`] for health
//! checks and operator tooling (spec.md §4.5, §9 open question on a status
//! endpoint — resolved in DESIGN.md by keeping this a pull-based snapshot
//! rather than adding an HTTP surface to core).

use std::time::SystemTime;

/// The lifecycle state of one [`crate::PartitionWorker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Initializing,
    Running,
    Draining,
    Closed,
    Failed,
}

/// A snapshot of one partition worker's progress.
#[derive(Debug, Clone)]
pub struct PartitionStats {
    pub partition_id: String,
    pub status: WorkerStatus,
    pub last_committed_sequence: Option<u64>,
    pub rows_ingested_total: u64,
    pub batches_ingested_total: u64,
    pub bytes_ingested_total: u64,
    pub last_batch_at: Option<SystemTime>,
    pub consecutive_failures: u32,
    pub retries_total: u64,
    /// Rough estimate of how far this partition's committed offset trails
    /// the broker's latest known sequence number, in event count. `None`
    /// until the worker has both observed and committed at least once.
    pub lag: Option<u64>,
}

/// A snapshot of one mapping's supervisor: every partition it owns plus
/// whether the mapping as a whole is still healthy.
#[derive(Debug, Clone)]
pub struct MappingState {
    pub mapping_name: String,
    pub partitions: Vec<PartitionStats>,
    pub healthy: bool,
}

impl MappingState {
    pub fn rows_ingested_total(&self) -> u64 {
        self.partitions.iter().map(|p| p.rows_ingested_total).sum()
    }

    pub fn batches_ingested_total(&self) -> u64 {
        self.partitions.iter().map(|p| p.batches_ingested_total).sum()
    }

    pub fn bytes_ingested_total(&self) -> u64 {
        self.partitions.iter().map(|p| p.bytes_ingested_total).sum()
    }

    /// The most recent batch commit across every partition in this
    /// mapping, or `None` if nothing has been committed yet.
    pub fn last_ingest_at(&self) -> Option<SystemTime> {
        self.partitions.iter().filter_map(|p| p.last_batch_at).max()
    }
}
