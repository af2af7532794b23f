//! `PartitionWorker`: the receive -> assemble -> ingest -> checkpoint loop
//! for one (mapping, partition) (spec.md §4.4). A `tokio::select!`-driven
//! task loop that exits on `CancellationToken`, with batch assembly and
//! retry/backoff as separate single-owner stages it drives in sequence.

use crate::assembler::{Batch, BatchAssembler};
use crate::config::{BatchingConfig, RetryConfig, StartPositionConfig};
use crate::error::WorkerError;
use crate::ports::{CheckpointKey, CheckpointStore, ChannelHandle, WaitOutcome};
use crate::retry::{Decision, ExponentialBackoffPolicy, FailureKind, RetryPolicy, WorkerFailure};
use crate::stats::{PartitionStats, WorkerStatus};
use crate::tracer::{AttrValue, Tracer};
use evsnow_broker::{EventSource, PartitionCursor, StartPosition};
use serde_json::{json, Value};
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use twox_hash::XxHash64;

/// Fixed across the process's lifetime so restarts resynthesize the same
/// `row_id` for the same `(partition, sequence)` pair (spec.md §4.4: "row
/// id synthesis... such that re-ingests of the same event after a crash
/// produce the same id"). `std::collections::hash_map::RandomState` is
/// reseeded every process start and would break that guarantee, which is
/// why this worker hashes with a fixed-seed `XxHash64` instead.
const ROW_ID_HASH_SEED: u64 = 0x45564E53_4E4F5721;

/// Bound on how long a `RetryPolicy::classify` call may run before this
/// worker falls back to the default exponential-backoff policy for that
/// one decision (spec.md §4.7: "must treat classifier calls as
/// bounded-latency... apply a hard timeout").
const CLASSIFIER_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens (or reopens) this worker's ingest channel. Shared as an `Arc` so
/// the send-retry path can reopen the handle after a transient failure
/// (spec.md §4.2: "transient... policy: close and reopen the handle,
/// retry the batch") without the worker needing to know how `open()` is
/// implemented.
pub type ChannelOpener = Arc<
    dyn Fn() -> futures::future::BoxFuture<'static, Result<Box<dyn ChannelHandle>, crate::error::IngestChannelError>>
        + Send
        + Sync,
>;

/// Identifying context a worker needs to address its checkpoint row and
/// report itself in traces; everything here is immutable for the life of
/// the worker.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub mapping_name: String,
    pub namespace: String,
    pub hub: String,
    pub target_db: String,
    pub target_schema: String,
    pub target_table: String,
    pub partition_id: String,
    pub process_suffix: String,
}

impl WorkerContext {
    fn checkpoint_key(&self) -> CheckpointKey {
        CheckpointKey::new(
            &self.namespace,
            &self.hub,
            &self.target_db,
            &self.target_schema,
            &self.target_table,
            &self.partition_id,
        )
    }
}

/// Runs one partition's full lifecycle: seed from checkpoint, open a
/// broker cursor and an ingest channel, then loop receive -> assemble ->
/// ingest -> checkpoint until cancelled or a fatal error (spec.md §4.4).
pub struct PartitionWorker {
    ctx: WorkerContext,
    checkpoint_store: Arc<dyn CheckpointStore>,
    retry_policy: Arc<dyn RetryPolicy>,
    /// Fallback policy used when the (possibly pluggable) `retry_policy`
    /// above doesn't resolve within [`CLASSIFIER_TIMEOUT`].
    default_policy: ExponentialBackoffPolicy,
    checkpoint_save_timeout: Duration,
    tracer: Arc<dyn Tracer>,
    batching: BatchingConfig,
    ack_timeout: Duration,
    status: Arc<Mutex<WorkerStatus>>,
    rows_ingested_total: AtomicU64,
    batches_ingested_total: AtomicU64,
    bytes_ingested_total: AtomicU64,
    last_committed_sequence: AtomicU64,
    has_committed: AtomicBool,
    last_observed_sequence: AtomicU64,
    has_observed: AtomicBool,
    last_batch_at_millis: AtomicU64,
    retries_total: AtomicU64,
}

impl PartitionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: WorkerContext,
        checkpoint_store: Arc<dyn CheckpointStore>,
        retry_config: &RetryConfig,
        batching: BatchingConfig,
        ack_timeout: Duration,
        checkpoint_save_timeout: Duration,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        let backoff_config = crate::retry::BackoffConfig {
            init_backoff: retry_config.base_delay(),
            max_backoff: retry_config.max_delay(),
            base: 2.0,
            max_retries: retry_config.max_attempts,
        };
        let retry_policy: Arc<dyn RetryPolicy> = Arc::new(ExponentialBackoffPolicy::new(backoff_config.clone()));
        let default_policy = ExponentialBackoffPolicy::new(backoff_config);
        Self {
            ctx,
            checkpoint_store,
            retry_policy,
            default_policy,
            checkpoint_save_timeout,
            tracer,
            batching,
            ack_timeout,
            status: Arc::new(Mutex::new(WorkerStatus::Initializing)),
            rows_ingested_total: AtomicU64::new(0),
            batches_ingested_total: AtomicU64::new(0),
            bytes_ingested_total: AtomicU64::new(0),
            last_committed_sequence: AtomicU64::new(0),
            has_committed: AtomicBool::new(false),
            last_observed_sequence: AtomicU64::new(0),
            has_observed: AtomicBool::new(false),
            last_batch_at_millis: AtomicU64::new(0),
            retries_total: AtomicU64::new(0),
        }
    }

    pub async fn status(&self) -> WorkerStatus {
        *self.status.lock().await
    }

    /// The last sequence number this partition has committed a checkpoint
    /// for, if any. Carried on [`WorkerError`] so a reader downstream of
    /// this worker's demise can tell how far it got.
    fn last_committed(&self) -> Option<u64> {
        self.has_committed
            .load(Ordering::Relaxed)
            .then(|| self.last_committed_sequence.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> PartitionStats {
        let last_committed_sequence = self.last_committed();

        let lag = if self.has_committed.load(Ordering::Relaxed) && self.has_observed.load(Ordering::Relaxed) {
            let observed = self.last_observed_sequence.load(Ordering::Relaxed);
            let committed = last_committed_sequence.unwrap_or(0);
            Some(observed.saturating_sub(committed))
        } else {
            None
        };

        let last_batch_at_millis = self.last_batch_at_millis.load(Ordering::Relaxed);
        let last_batch_at = if last_batch_at_millis > 0 {
            Some(SystemTime::UNIX_EPOCH + Duration::from_millis(last_batch_at_millis))
        } else {
            None
        };

        PartitionStats {
            partition_id: self.ctx.partition_id.clone(),
            status: WorkerStatus::Running,
            last_committed_sequence,
            rows_ingested_total: self.rows_ingested_total.load(Ordering::Relaxed),
            batches_ingested_total: self.batches_ingested_total.load(Ordering::Relaxed),
            bytes_ingested_total: self.bytes_ingested_total.load(Ordering::Relaxed),
            last_batch_at,
            consecutive_failures: 0,
            retries_total: self.retries_total.load(Ordering::Relaxed),
            lag,
        }
    }

    /// Drive this partition to completion: returns `Ok(())` on a clean
    /// cancellation-driven shutdown, `Err(WorkerError)` on a fatal or
    /// retry-exhausted failure that the supervisor must isolate.
    pub async fn run(
        &self,
        source: Arc<dyn EventSource>,
        open_channel: ChannelOpener,
        start_position: StartPositionConfig,
        cancel: CancellationToken,
    ) -> Result<(), WorkerError> {
        let key = self.ctx.checkpoint_key();

        let checkpoints = self
            .checkpoint_store
            .load_all(
                &self.ctx.namespace,
                &self.ctx.hub,
                &self.ctx.target_db,
                &self.ctx.target_schema,
                &self.ctx.target_table,
            )
            .await
            .map_err(|source| WorkerError::Checkpoint {
                partition: self.ctx.partition_id.clone(),
                kind: FailureKind::CheckpointWrite,
                attempts: 0,
                last_committed_sequence: self.last_committed(),
                source,
            })?;

        let existing = checkpoints.get(&self.ctx.partition_id);
        if let Some(checkpoint) = existing {
            self.last_committed_sequence.store(checkpoint.waterlevel, Ordering::Relaxed);
            self.has_committed.store(true, Ordering::Relaxed);
        }

        let start = match start_position {
            StartPositionConfig::Earliest => StartPosition::Earliest,
            StartPositionConfig::Latest => StartPosition::Latest,
        };

        let mut cursor = source
            .open_partition(&self.ctx.partition_id, existing.map(|c| c.waterlevel), start)
            .await
            .map_err(|source| WorkerError::Broker {
                partition: self.ctx.partition_id.clone(),
                kind: FailureKind::BrokerRead,
                attempts: 0,
                last_committed_sequence: self.last_committed(),
                source,
            })?;

        let mut channel = open_channel()
            .await
            .map_err(|source| WorkerError::IngestChannel {
                partition: self.ctx.partition_id.clone(),
                kind: FailureKind::IngestSend,
                attempts: 0,
                last_committed_sequence: self.last_committed(),
                source,
            })?;

        *self.status.lock().await = WorkerStatus::Running;

        let mut assembler = BatchAssembler::new(
            self.ctx.partition_id.clone(),
            self.batching.max_batch_size,
            self.batching.max_wait(),
        );

        let result = self
            .steady_state_loop(&mut cursor, &mut channel, &open_channel, &mut assembler, &cancel, &key)
            .await;

        *self.status.lock().await = if result.is_ok() { WorkerStatus::Draining } else { WorkerStatus::Failed };

        // Drain: flush whatever is buffered regardless of how the loop ended,
        // unless the loop itself already failed fatally on a send/ack.
        if result.is_ok() {
            if let Some(batch) = assembler.flush_if_nonempty() {
                self.ingest_and_checkpoint(&mut channel, &open_channel, batch, &key).await?;
            }
        }

        let _ = cursor.close().await;
        let _ = channel.close().await;
        *self.status.lock().await = WorkerStatus::Closed;

        result
    }

    async fn steady_state_loop(
        &self,
        cursor: &mut Box<dyn PartitionCursor>,
        channel: &mut Box<dyn ChannelHandle>,
        open_channel: &ChannelOpener,
        assembler: &mut BatchAssembler,
        cancel: &CancellationToken,
        key: &CheckpointKey,
    ) -> Result<(), WorkerError> {
        const POLL_TIMEOUT: Duration = Duration::from_secs(2);
        const POLL_MAX: usize = 500;

        let mut broker_attempt = 0u32;
        let mut broker_retry_started: Option<Instant> = None;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                received = cursor.receive(POLL_MAX, POLL_TIMEOUT) => received,
            };

            let events = match received {
                Ok(events) => {
                    broker_attempt = 0;
                    broker_retry_started = None;
                    events
                }
                Err(err) => {
                    let elapsed = broker_retry_started.get_or_insert_with(Instant::now).elapsed();
                    let failure = WorkerFailure::Broker(&err);
                    match self.classify_and_wait(failure, FailureKind::BrokerRead, broker_attempt, elapsed).await {
                        Ok(()) => {
                            broker_attempt += 1;
                            continue;
                        }
                        Err(decision) => {
                            return Err(self.give_up_or_fatal(decision, FailureKind::BrokerRead, broker_attempt, || WorkerError::Broker {
                                partition: self.ctx.partition_id.clone(),
                                kind: FailureKind::BrokerRead,
                                attempts: broker_attempt,
                                last_committed_sequence: self.last_committed(),
                                source: err,
                            }));
                        }
                    }
                }
            };

            for event in &events {
                self.last_observed_sequence.fetch_max(event.sequence_number, Ordering::Relaxed);
                self.has_observed.store(true, Ordering::Relaxed);
            }

            // One `receive` can hand back more events than fit in a single
            // batch (spec.md §4.4 step 1 allows up to `K`, independent of
            // `max_batch_size`); ingest every batch that becomes ready
            // along the way instead of stopping at the first one, or the
            // remaining events in this poll would be silently dropped.
            for event in events {
                if assembler.add(event) {
                    let batch = assembler.take();
                    self.ingest_and_checkpoint(channel, open_channel, batch, key).await?;
                }
            }

            if assembler.is_ready() {
                if let Some(batch) = assembler.flush_if_nonempty() {
                    self.ingest_and_checkpoint(channel, open_channel, batch, key).await?;
                }
            }
        }
    }

    /// Send one batch, wait for its durable ack, then save the
    /// checkpoint, retrying per [`RetryPolicy`] on transient failures at
    /// each step (spec.md §4.4, §4.7). Never advances the checkpoint
    /// before the ack; never sends a second batch while this one is in
    /// flight. On a transient send failure, closes and reopens the
    /// channel before retrying, per spec.md §4.2.
    async fn ingest_and_checkpoint(
        &self,
        channel: &mut Box<dyn ChannelHandle>,
        open_channel: &ChannelOpener,
        batch: Batch,
        key: &CheckpointKey,
    ) -> Result<(), WorkerError> {
        let rows: Vec<Value> = batch
            .events
            .iter()
            .map(|event| self.row_for_event(event))
            .collect();
        let batch_bytes: u64 = batch.events.iter().map(|event| event.payload.len() as u64).sum();

        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            let send_result = channel.send(rows.clone()).await;
            let token = match send_result {
                Ok(token) => token,
                Err(err) => {
                    let failure = WorkerFailure::IngestChannel(&err);
                    match self.classify_and_wait(failure, FailureKind::IngestSend, attempt, started.elapsed()).await {
                        Ok(()) => {
                            attempt += 1;
                            let _ = channel.close().await;
                            if let Ok(reopened) = open_channel().await {
                                *channel = reopened;
                            }
                            continue;
                        }
                        Err(decision) => {
                            return Err(self.give_up_or_fatal(decision, FailureKind::IngestSend, attempt, || WorkerError::IngestChannel {
                                partition: self.ctx.partition_id.clone(),
                                kind: FailureKind::IngestSend,
                                attempts: attempt,
                                last_committed_sequence: self.last_committed(),
                                source: err,
                            }));
                        }
                    }
                }
            };

            let wait_result = channel.wait_for_durable(&token, self.ack_timeout).await;
            match wait_result {
                Ok(WaitOutcome::Durable) => break,
                Ok(WaitOutcome::Timeout) => {
                    let timeout_err = crate::error::IngestChannelError::DurabilityTimeout;
                    let failure = WorkerFailure::IngestChannel(&timeout_err);
                    match self
                        .classify_and_wait(failure, FailureKind::IngestDurabilityWait, attempt, started.elapsed())
                        .await
                    {
                        Ok(()) => {
                            attempt += 1;
                            continue;
                        }
                        Err(decision) => {
                            return Err(self.give_up_or_fatal(decision, FailureKind::IngestDurabilityWait, attempt, || WorkerError::IngestChannel {
                                partition: self.ctx.partition_id.clone(),
                                kind: FailureKind::IngestDurabilityWait,
                                attempts: attempt,
                                last_committed_sequence: self.last_committed(),
                                source: timeout_err,
                            }));
                        }
                    }
                }
                Err(err) => {
                    let failure = WorkerFailure::IngestChannel(&err);
                    match self
                        .classify_and_wait(failure, FailureKind::IngestDurabilityWait, attempt, started.elapsed())
                        .await
                    {
                        Ok(()) => {
                            attempt += 1;
                            continue;
                        }
                        Err(decision) => {
                            return Err(self.give_up_or_fatal(decision, FailureKind::IngestDurabilityWait, attempt, || WorkerError::IngestChannel {
                                partition: self.ctx.partition_id.clone(),
                                kind: FailureKind::IngestDurabilityWait,
                                attempts: attempt,
                                last_committed_sequence: self.last_committed(),
                                source: err,
                            }));
                        }
                    }
                }
            }
        }

        self.save_checkpoint_with_retry(key, &batch).await?;

        self.rows_ingested_total.fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.batches_ingested_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_ingested_total.fetch_add(batch_bytes, Ordering::Relaxed);
        self.last_committed_sequence.store(batch.last_sequence, Ordering::Relaxed);
        self.has_committed.store(true, Ordering::Relaxed);
        let now_millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.last_batch_at_millis.store(now_millis, Ordering::Relaxed);

        self.tracer.counter_add(
            "evsnow.rows_ingested",
            batch.len() as u64,
            &[("partition", AttrValue::Str(self.ctx.partition_id.clone()))],
        );
        self.tracer.counter_add(
            "evsnow.bytes_ingested",
            batch_bytes,
            &[("partition", AttrValue::Str(self.ctx.partition_id.clone()))],
        );

        Ok(())
    }

    async fn save_checkpoint_with_retry(&self, key: &CheckpointKey, batch: &Batch) -> Result<(), WorkerError> {
        let metadata = json!({
            "batch_size": batch.len(),
            "earliest_enqueued": batch.earliest_enqueued,
            "latest_enqueued": batch.latest_enqueued,
        });

        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            let save_result = match tokio::time::timeout(
                self.checkpoint_save_timeout,
                self.checkpoint_store.save(key, batch.last_sequence, metadata.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(crate::error::CheckpointError::SaveTimeout),
            };

            match save_result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let failure = WorkerFailure::Checkpoint(&err);
                    match self
                        .classify_and_wait(failure, FailureKind::CheckpointWrite, attempt, started.elapsed())
                        .await
                    {
                        Ok(()) => {
                            attempt += 1;
                            continue;
                        }
                        Err(decision) => {
                            return Err(self.give_up_or_fatal(decision, FailureKind::CheckpointWrite, attempt, || WorkerError::Checkpoint {
                                partition: self.ctx.partition_id.clone(),
                                kind: FailureKind::CheckpointWrite,
                                attempts: attempt,
                                last_committed_sequence: self.last_committed(),
                                source: err,
                            }));
                        }
                    }
                }
            }
        }
    }

    /// Consult the retry policy, bounding the call's latency so a
    /// pluggable classifier that calls out to an external service can
    /// never stall this worker (spec.md §4.7). Sleeps and signals "keep
    /// going" on `RetryAfter`; on `GiveUp`/`Fatal` logs which one it was
    /// (they mean different things: one is a budget exhausted, the other
    /// is never going to succeed) and hands the decision back so the
    /// caller can build the right `WorkerError` variant.
    async fn classify_and_wait(
        &self,
        failure: WorkerFailure<'_>,
        kind: FailureKind,
        attempt: u32,
        elapsed: Duration,
    ) -> Result<(), Decision> {
        let decision = match tokio::time::timeout(CLASSIFIER_TIMEOUT, self.retry_policy.classify(&failure, kind, attempt, elapsed)).await {
            Ok(decision) => decision,
            Err(_) => {
                self.tracer.event(
                    "evsnow.classifier_timeout",
                    &[("partition", AttrValue::Str(self.ctx.partition_id.clone()))],
                );
                self.default_policy.classify(&failure, kind, attempt, elapsed).await
            }
        };

        match decision {
            Decision::RetryAfter(d) => {
                self.retries_total.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(d).await;
                Ok(())
            }
            Decision::GiveUp => {
                self.tracer.event(
                    "evsnow.retries_exhausted",
                    &[
                        ("partition", AttrValue::Str(self.ctx.partition_id.clone())),
                        ("kind", AttrValue::Str(format!("{kind:?}"))),
                        ("attempts", AttrValue::UInt(attempt as u64)),
                    ],
                );
                Err(Decision::GiveUp)
            }
            Decision::Fatal => {
                self.tracer.event(
                    "evsnow.fatal_failure",
                    &[
                        ("partition", AttrValue::Str(self.ctx.partition_id.clone())),
                        ("kind", AttrValue::Str(format!("{kind:?}"))),
                    ],
                );
                Err(Decision::Fatal)
            }
        }
    }

    /// Turn a `classify_and_wait` give-up into the right `WorkerError`:
    /// `GiveUp` becomes `RetriesExhausted` (the policy's budget ran out,
    /// not a property of this particular error), `Fatal` becomes the
    /// caller-supplied per-kind error.
    fn give_up_or_fatal(
        &self,
        decision: Decision,
        kind: FailureKind,
        attempts: u32,
        fatal: impl FnOnce() -> WorkerError,
    ) -> WorkerError {
        match decision {
            Decision::GiveUp => WorkerError::RetriesExhausted {
                partition: self.ctx.partition_id.clone(),
                kind,
                attempts,
                last_committed_sequence: self.last_committed(),
            },
            Decision::Fatal => fatal(),
            Decision::RetryAfter(_) => unreachable!("classify_and_wait only errors on GiveUp/Fatal"),
        }
    }

    fn row_for_event(&self, event: &evsnow_broker::Event) -> Value {
        let row_id = self.synthesize_row_id(event.sequence_number);
        json!({
            "row_id": row_id,
            "event_body": event.payload_as_json(),
            "partition_id": event.partition_id,
            "sequence_number": event.sequence_number,
            "enqueued_time": event.enqueued_time,
            "properties": evsnow_broker::PropertyValue::to_storage_map(&event.properties),
            "system_properties": evsnow_broker::PropertyValue::to_storage_map(&event.system_properties),
        })
    }

    /// `row_id = hash(partition_id || sequence_number || process_suffix)`
    /// (spec.md §4.4), using a fixed-seed hasher so the same event
    /// produces the same id across process restarts.
    fn synthesize_row_id(&self, sequence_number: u64) -> String {
        let mut hasher = XxHash64::with_seed(ROW_ID_HASH_SEED);
        hasher.write(self.ctx.partition_id.as_bytes());
        hasher.write_u64(sequence_number);
        hasher.write(self.ctx.process_suffix.as_bytes());
        format!("{:016x}", hasher.finish())
    }
}
