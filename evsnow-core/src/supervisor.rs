//! `MappingSupervisor`: owns one mapping's `IngestClient` and spawns one
//! `PartitionWorker` per partition the broker reports (spec.md §4.5).
//! Fan-out/fan-in via a `tokio::spawn`-then-`JoinHandle::await` pairing
//! per partition, joined together at shutdown.

use crate::config::MappingConfig;
use crate::error::{SupervisorError, WorkerError};
use crate::ports::{CheckpointStore, ChannelHandle, IngestClient};
use crate::stats::{MappingState, PartitionStats, WorkerStatus};
use crate::tracer::{AttrValue, Tracer};
use crate::worker::{PartitionWorker, WorkerContext};
use evsnow_broker::EventSource;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One mapping's running state: its workers and the tasks driving them.
pub struct MappingSupervisor {
    mapping: MappingConfig,
    ingest_client: Arc<dyn IngestClient>,
    workers: Vec<Arc<PartitionWorker>>,
    tasks: Vec<JoinHandle<Result<(), WorkerError>>>,
    tracer: Arc<dyn Tracer>,
    failed: std::sync::atomic::AtomicBool,
}

impl MappingSupervisor {
    /// Implements spec.md §4.5's startup order: build the ingest client
    /// (already opened by the caller), ensure the control table, enumerate
    /// partitions, then spawn one worker per partition.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        mapping: MappingConfig,
        source: Arc<dyn EventSource>,
        checkpoint_store: Arc<dyn CheckpointStore>,
        ingest_client: Arc<dyn IngestClient>,
        retry_config: &crate::config::RetryConfig,
        ack_timeout: std::time::Duration,
        checkpoint_save_timeout: std::time::Duration,
        tracer: Arc<dyn Tracer>,
        process_suffix: String,
        cancel: CancellationToken,
    ) -> Result<Self, SupervisorError> {
        checkpoint_store
            .ensure_table()
            .await
            .map_err(SupervisorError::EnsureControlTable)?;

        let partitions = source
            .partitions()
            .await
            .map_err(SupervisorError::PartitionEnumeration)?;

        tracer.event(
            "evsnow.mapping_starting",
            &[
                ("mapping", AttrValue::Str(mapping.mapping_name.clone())),
                ("partitions", AttrValue::UInt(partitions.len() as u64)),
            ],
        );

        let mut workers = Vec::with_capacity(partitions.len());
        let mut tasks = Vec::with_capacity(partitions.len());

        for partition_id in partitions {
            let ctx = WorkerContext {
                mapping_name: mapping.mapping_name.clone(),
                namespace: mapping.source_namespace.clone(),
                hub: mapping.source_hub.clone(),
                target_db: mapping.target_db.clone(),
                target_schema: mapping.target_schema.clone(),
                target_table: mapping.target_table.clone(),
                partition_id: partition_id.clone(),
                process_suffix: process_suffix.clone(),
            };

            let worker = Arc::new(PartitionWorker::new(
                ctx,
                checkpoint_store.clone(),
                retry_config,
                mapping.batching.clone(),
                ack_timeout,
                checkpoint_save_timeout,
                tracer.clone(),
            ));

            let task = spawn_worker(
                worker.clone(),
                source.clone(),
                ingest_client.clone(),
                partition_id,
                mapping.start_position,
                cancel.clone(),
            );

            workers.push(worker);
            tasks.push(task);
        }

        Ok(Self {
            mapping,
            ingest_client,
            workers,
            tasks,
            tracer,
            failed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Await every worker task, then close the shared `IngestClient`
    /// (spec.md §4.5 shutdown). Returns the first fatal `WorkerError`
    /// encountered, if any; a failed worker does not stop the others from
    /// being awaited and drained.
    pub async fn join(&mut self) -> Result<(), SupervisorError> {
        let mut first_error = None;

        for task in self.tasks.drain(..) {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(worker_err)) => {
                    self.tracer.event(
                        "evsnow.worker_failed",
                        &[
                            ("mapping", AttrValue::Str(self.mapping.mapping_name.clone())),
                            ("partition", AttrValue::Str(worker_err.partition().to_string())),
                            ("kind", AttrValue::Str(format!("{:?}", worker_err.kind()))),
                            ("attempts", AttrValue::UInt(worker_err.attempts() as u64)),
                            (
                                "last_committed_sequence",
                                match worker_err.last_committed_sequence() {
                                    Some(seq) => AttrValue::UInt(seq),
                                    None => AttrValue::Str("none".to_string()),
                                },
                            ),
                        ],
                    );
                    self.failed.store(true, std::sync::atomic::Ordering::Relaxed);
                    if first_error.is_none() {
                        first_error = Some(worker_err);
                    }
                }
                Err(join_err) => {
                    self.failed.store(true, std::sync::atomic::Ordering::Relaxed);
                    return Err(SupervisorError::TaskJoinFailure(join_err));
                }
            }
        }

        let _ = self.ingest_client.close().await;

        if let Some(err) = first_error {
            return Err(SupervisorError::WorkerFailed(self.mapping.mapping_name.clone(), err));
        }
        Ok(())
    }

    pub fn mapping_name(&self) -> &str {
        &self.mapping.mapping_name
    }

    /// A snapshot of every worker's stats (spec.md §4.5 "expose
    /// per-mapping stats"). `healthy` iff every worker is `Running` or
    /// `Draining`.
    pub async fn state(&self) -> MappingState {
        let mut partitions = Vec::with_capacity(self.workers.len());
        let mut healthy = true;

        for worker in &self.workers {
            let status = worker.status().await;
            if !matches!(status, WorkerStatus::Running | WorkerStatus::Draining | WorkerStatus::Closed) {
                healthy = false;
            }
            let mut stats: PartitionStats = worker.stats();
            stats.status = status;
            partitions.push(stats);
        }

        MappingState {
            mapping_name: self.mapping.mapping_name.clone(),
            partitions,
            healthy: healthy && !self.failed.load(std::sync::atomic::Ordering::Relaxed),
        }
    }
}

fn spawn_worker(
    worker: Arc<PartitionWorker>,
    source: Arc<dyn EventSource>,
    ingest_client: Arc<dyn IngestClient>,
    partition_id: String,
    start_position: crate::config::StartPositionConfig,
    cancel: CancellationToken,
) -> JoinHandle<Result<(), WorkerError>> {
    tokio::spawn(async move {
        let open_channel: crate::worker::ChannelOpener = {
            let ingest_client = ingest_client.clone();
            let partition_id = partition_id.clone();
            Arc::new(move || -> futures::future::BoxFuture<'static, Result<Box<dyn ChannelHandle>, crate::error::IngestChannelError>> {
                let ingest_client = ingest_client.clone();
                let partition_id = partition_id.clone();
                Box::pin(async move { ingest_client.open(&partition_id).await })
            })
        };

        worker.run(source, open_channel, start_position, cancel).await
    })
}
