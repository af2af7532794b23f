use crate::{BrokerError, Event};
use async_trait::async_trait;
use std::time::Duration;

/// A partition identifier. Event Hubs partition ids are small decimal
/// strings ("0", "1", ...) but are kept opaque here rather than parsed as
/// integers, since nothing in the core needs their numeric value.
pub type PartitionId = String;

/// Where to start consuming a partition that has no checkpoint yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Earliest,
    Latest,
}

/// A handle to the set of partitions behind one (namespace, hub,
/// consumer-group) triple, and the ability to open a cursor onto one of
/// them. Implemented by [`crate::MemoryEventSource`] for tests and by the
/// production Event Hubs adapter.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Enumerate the partitions this source currently knows about.
    /// spec.md treats the partition set as fixed for the lifetime of a
    /// `MappingSupervisor` (startup-only enumeration; see Open Questions
    /// in DESIGN.md).
    async fn partitions(&self) -> Result<Vec<PartitionId>, BrokerError>;

    /// Open a cursor over one partition, resuming after `after_sequence`
    /// if given, or starting at `start` otherwise.
    async fn open_partition(
        &self,
        partition: &PartitionId,
        after_sequence: Option<u64>,
        start: StartPosition,
    ) -> Result<Box<dyn PartitionCursor>, BrokerError>;
}

/// A live subscription to one partition. Events are strictly ordered by
/// `sequence_number` within one cursor's lifetime.
#[async_trait]
pub trait PartitionCursor: Send {
    /// Receive up to `max` events, waiting no longer than `timeout` for the
    /// first one. Returns an empty vec on timeout with no events available
    /// — that is not an error (spec.md §5, broker receive poll).
    async fn receive(&mut self, max: usize, timeout: Duration) -> Result<Vec<Event>, BrokerError>;

    /// Release broker-side resources held by this cursor. Idempotent.
    async fn close(&mut self) -> Result<(), BrokerError>;
}
