//! Broker-facing types and the `EventSource` abstraction that lets
//! `evsnow-core` drive partition consumption without knowing whether the
//! events come from a real Event Hub, a recorded fixture, or a unit test.

mod error;
mod event;
mod memory;
mod source;

#[cfg(feature = "azure")]
mod azure;

pub use error::BrokerError;
pub use event::{Event, PropertyMap, PropertyValue};
pub use memory::MemoryEventSource;
pub use source::{EventSource, PartitionCursor, PartitionId, StartPosition};

#[cfg(feature = "azure")]
pub use azure::AzureEventHubSource;
