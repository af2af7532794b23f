use miette::Diagnostic;
use thiserror::Error;

/// Failures surfaced from an [`crate::EventSource`] / [`crate::PartitionCursor`].
///
/// `Transient` covers anything spec.md §4.2/§7 calls a network blip or
/// server-side throttle: the caller's `RetryPolicy` decides whether to
/// retry. `Fatal` covers anything that will never succeed on retry
/// (partition gone, auth revoked) and should propagate straight to the
/// worker as a `PermanentIngestFailure`-class error.
#[derive(Debug, Error, Diagnostic)]
pub enum BrokerError {
    #[error("transient broker failure: {0}")]
    Transient(String),

    #[error("fatal broker failure: {0}")]
    Fatal(String),

    #[error("broker receive timed out")]
    Timeout,

    #[error("partition {0} is not known to this event source")]
    UnknownPartition(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient(_) | BrokerError::Timeout)
    }
}
