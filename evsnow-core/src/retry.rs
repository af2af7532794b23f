//! Retry and backoff policy for [`crate::PartitionWorker`] (spec.md §4.7):
//! exponential backoff with full jitter, generalized from a fixed error
//! type to a pluggable [`FailureKind`] classifier, so the same policy
//! shape can back off on a broker read, a checkpoint write, or an ingest
//! send alike. `classify` is async and receives the error and elapsed
//! time so a richer policy can consult an external service; the caller is
//! responsible for bounding that call's latency (spec.md §4.7).

use crate::error::{CheckpointError, IngestChannelError};
use async_trait::async_trait;
use rand::Rng;
use std::fmt;
use std::time::Duration;

/// What kind of thing failed, used only to let a [`RetryPolicy`]
/// distinguish recoverable hiccups from conditions it should never retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    BrokerRead,
    CheckpointWrite,
    IngestSend,
    IngestDurabilityWait,
}

/// The error a [`RetryPolicy`] is being asked to classify, borrowed for
/// the duration of the call so `classify` sees the real failure instead
/// of a pre-digested boolean.
#[derive(Debug, Clone, Copy)]
pub enum WorkerFailure<'a> {
    Broker(&'a evsnow_broker::BrokerError),
    Checkpoint(&'a CheckpointError),
    IngestChannel(&'a IngestChannelError),
}

impl WorkerFailure<'_> {
    pub fn is_transient(&self) -> bool {
        match self {
            WorkerFailure::Broker(e) => e.is_transient(),
            WorkerFailure::Checkpoint(e) => e.is_transient(),
            WorkerFailure::IngestChannel(e) => e.is_transient(),
        }
    }
}

impl fmt::Display for WorkerFailure<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerFailure::Broker(e) => write!(f, "{e}"),
            WorkerFailure::Checkpoint(e) => write!(f, "{e}"),
            WorkerFailure::IngestChannel(e) => write!(f, "{e}"),
        }
    }
}

/// What a [`RetryPolicy`] decided to do about one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Wait this long, then retry the same operation.
    RetryAfter(Duration),
    /// Stop retrying but do not treat this as a fatal error (e.g. a
    /// worker's retry budget is exhausted for this attempt cycle).
    GiveUp,
    /// The failure can never succeed on retry; surface it immediately.
    Fatal,
}

/// Given a failure, its kind, how many consecutive attempts have already
/// been made, and how long this operation has been retrying, decide what
/// to do next (spec.md §4.7: `classify(error, attempt_number, elapsed) ->
/// Decision`). Implementations that call out to an external service must
/// still resolve within whatever timeout the caller wraps this in.
#[async_trait]
pub trait RetryPolicy: Send + Sync {
    async fn classify(&self, error: &WorkerFailure<'_>, kind: FailureKind, attempt: u32, elapsed: Duration) -> Decision;
}

/// Exponential backoff with full jitter: `init_backoff` doubles each
/// attempt up to `max_backoff`, and a fixed `max_retries` turns a long
/// string of transient failures into [`Decision::GiveUp`] rather than
/// retrying forever. Any error that isn't transient is [`Decision::Fatal`]
/// regardless of attempt count.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub init_backoff: Duration,
    pub max_backoff: Duration,
    pub base: f64,
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            base: 2.0,
            max_retries: 10,
        }
    }
}

/// The default [`RetryPolicy`]: every [`FailureKind`] backs off the same
/// way. Callers that need per-kind treatment (e.g. never retry a
/// durability timeout more than once) should wrap this in their own
/// `RetryPolicy` rather than modify it.
pub struct ExponentialBackoffPolicy {
    config: BackoffConfig,
}

impl ExponentialBackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self.config.base.powi(attempt.min(32) as i32);
        let raw = self.config.init_backoff.mul_f64(exp);
        let capped = raw.min(self.config.max_backoff);
        // Full jitter: uniform in [0, capped].
        let jittered_millis = rand::thread_rng().gen_range(0..=capped.as_millis().max(1)) as u64;
        Duration::from_millis(jittered_millis)
    }
}

#[async_trait]
impl RetryPolicy for ExponentialBackoffPolicy {
    async fn classify(&self, error: &WorkerFailure<'_>, _kind: FailureKind, attempt: u32, _elapsed: Duration) -> Decision {
        if !error.is_transient() {
            return Decision::Fatal;
        }
        if attempt >= self.config.max_retries {
            return Decision::GiveUp;
        }
        Decision::RetryAfter(self.backoff_for(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestChannelError;

    fn transient() -> IngestChannelError {
        IngestChannelError::Transient("blip".to_string())
    }

    fn permanent() -> IngestChannelError {
        IngestChannelError::Permanent("nope".to_string())
    }

    #[tokio::test]
    async fn backoff_grows_then_caps() {
        let policy = ExponentialBackoffPolicy::new(BackoffConfig {
            init_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            base: 2.0,
            max_retries: 20,
        });
        let err = transient();
        let failure = WorkerFailure::IngestChannel(&err);

        for attempt in 0..10 {
            match policy.classify(&failure, FailureKind::BrokerRead, attempt, Duration::ZERO).await {
                Decision::RetryAfter(d) => assert!(d <= Duration::from_millis(100)),
                other => panic!("expected RetryAfter, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn gives_up_past_max_retries() {
        let policy = ExponentialBackoffPolicy::new(BackoffConfig {
            max_retries: 3,
            ..BackoffConfig::default()
        });
        let err = transient();
        let failure = WorkerFailure::IngestChannel(&err);
        assert_eq!(policy.classify(&failure, FailureKind::IngestSend, 3, Duration::ZERO).await, Decision::GiveUp);
        assert_eq!(policy.classify(&failure, FailureKind::IngestSend, 100, Duration::ZERO).await, Decision::GiveUp);
    }

    #[tokio::test]
    async fn retries_below_max() {
        let policy = ExponentialBackoffPolicy::new(BackoffConfig::default());
        let err = transient();
        let failure = WorkerFailure::IngestChannel(&err);
        assert!(matches!(
            policy.classify(&failure, FailureKind::CheckpointWrite, 0, Duration::ZERO).await,
            Decision::RetryAfter(_)
        ));
    }

    #[tokio::test]
    async fn permanent_failure_is_fatal_regardless_of_attempt() {
        let policy = ExponentialBackoffPolicy::new(BackoffConfig::default());
        let err = permanent();
        let failure = WorkerFailure::IngestChannel(&err);
        assert_eq!(policy.classify(&failure, FailureKind::IngestSend, 0, Duration::ZERO).await, Decision::Fatal);
    }
}
