//! `Orchestrator`: owns every `MappingSupervisor`, installs signal
//! handlers, and coordinates process-wide shutdown (spec.md §4.6). One
//! `CancellationToken` fans out to every mapping; a `tokio::select!`
//! between the incoming signal and the mappings' join future enforces a
//! bounded drain deadline before forcing an exit on a second signal.

use crate::config::EngineConfig;
use crate::error::{OrchestratorError, SupervisorError};
use crate::ports::{CheckpointStore, IngestClient};
use crate::stats::MappingState;
use crate::supervisor::MappingSupervisor;
use crate::tracer::{AttrValue, Tracer};
use evsnow_broker::EventSource;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Builds an `EventSource` and an `IngestClient` for one mapping. The
/// orchestrator is deliberately ignorant of Snowflake and Event Hubs
/// specifics; `evsnow-app` supplies this factory at startup.
#[async_trait::async_trait]
pub trait MappingFactory: Send + Sync {
    async fn build_source(&self, mapping_name: &str) -> Result<Arc<dyn EventSource>, SupervisorError>;
    async fn build_ingest_client(&self, mapping_name: &str) -> Result<Arc<dyn IngestClient>, SupervisorError>;
}

/// The outcome of one full run of the orchestrator, returned instead of
/// thrown: a partial mapping failure is expected, routine behavior, not
/// an exceptional one (spec.md §7: "the orchestrator does not
/// automatically cancel other mappings when one fails").
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub mapping_states: Vec<MappingState>,
    pub forced_exit: bool,
}

impl RunOutcome {
    /// Maps to spec.md §6's exit status table: 0 clean, 1 a mapping
    /// failed, 2 forced exit on a second signal.
    pub fn exit_code(&self) -> i32 {
        if self.forced_exit {
            2
        } else if self.mapping_states.iter().any(|m| !m.healthy) {
            1
        } else {
            0
        }
    }
}

/// Owns every mapping's supervisor for the process's lifetime. Each
/// mapping carries its own `source_namespace` (spec.md §6: different
/// mappings may point at different Event Hubs namespaces), so the
/// orchestrator has no namespace of its own to track.
pub struct Orchestrator {
    config: EngineConfig,
    checkpoint_store: Arc<dyn CheckpointStore>,
    tracer: Arc<dyn Tracer>,
    process_suffix: String,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        checkpoint_store: Arc<dyn CheckpointStore>,
        tracer: Arc<dyn Tracer>,
        process_suffix: String,
    ) -> Self {
        Self {
            config,
            checkpoint_store,
            tracer,
            process_suffix,
        }
    }

    /// Start every configured mapping, install signal handlers, and run
    /// until every mapping's workers finish or a shutdown signal arrives.
    pub async fn run(&self, factory: Arc<dyn MappingFactory>) -> Result<RunOutcome, OrchestratorError> {
        let cancel = CancellationToken::new();

        let mut sigterm = signal(SignalKind::terminate()).map_err(OrchestratorError::SignalHandlerInstall)?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(OrchestratorError::SignalHandlerInstall)?;

        let mut supervisors = Vec::with_capacity(self.config.mappings.len());
        for mapping in &self.config.mappings {
            let source = match factory.build_source(&mapping.mapping_name).await {
                Ok(source) => source,
                Err(err) => {
                    self.tracer.event(
                        "evsnow.event_source_build_failed",
                        &[
                            ("mapping", AttrValue::Str(mapping.mapping_name.clone())),
                            ("error", AttrValue::Str(err.to_string())),
                        ],
                    );
                    continue;
                }
            };
            let ingest_client = match factory.build_ingest_client(&mapping.mapping_name).await {
                Ok(ingest_client) => ingest_client,
                Err(err) => {
                    self.tracer.event(
                        "evsnow.ingest_client_build_failed",
                        &[
                            ("mapping", AttrValue::Str(mapping.mapping_name.clone())),
                            ("error", AttrValue::Str(err.to_string())),
                        ],
                    );
                    continue;
                }
            };

            let started = MappingSupervisor::start(
                mapping.clone(),
                source,
                self.checkpoint_store.clone(),
                ingest_client,
                &self.config.retry,
                self.config.ack_timeout(),
                self.config.checkpoint_save_timeout(),
                self.tracer.clone(),
                self.process_suffix.clone(),
                cancel.clone(),
            )
            .await;

            match started {
                Ok(supervisor) => supervisors.push(supervisor),
                Err(err) => self.tracer.event(
                    "evsnow.mapping_start_failed",
                    &[
                        ("mapping", AttrValue::Str(mapping.mapping_name.clone())),
                        ("error", AttrValue::Str(err.to_string())),
                    ],
                ),
            }
        }

        let drain_deadline = self.config.drain_deadline();
        let mut forced_exit = false;

        {
            let join_fut = futures::future::join_all(supervisors.iter_mut().map(|s| s.join()));
            tokio::pin!(join_fut);

            tokio::select! {
                biased;
                _ = sigterm.recv() => {
                    self.tracer.event("evsnow.shutdown_signal", &[("signal", AttrValue::Str("SIGTERM".to_string()))]);
                    cancel.cancel();
                    forced_exit = drain_or_force(join_fut.as_mut(), &mut sigterm, &mut sigint, drain_deadline, &self.tracer).await;
                }
                _ = sigint.recv() => {
                    self.tracer.event("evsnow.shutdown_signal", &[("signal", AttrValue::Str("SIGINT".to_string()))]);
                    cancel.cancel();
                    forced_exit = drain_or_force(join_fut.as_mut(), &mut sigterm, &mut sigint, drain_deadline, &self.tracer).await;
                }
                results = &mut join_fut => {
                    for (supervisor, result) in supervisors.iter().zip(results.iter()) {
                        if let Err(err) = result {
                            self.tracer.event(
                                "evsnow.mapping_finished_with_error",
                                &[
                                    ("mapping", AttrValue::Str(supervisor.mapping_name().to_string())),
                                    ("error", AttrValue::Str(err.to_string())),
                                ],
                            );
                        }
                    }
                }
            }
        }

        let mut mapping_states = Vec::with_capacity(supervisors.len());
        for supervisor in &supervisors {
            mapping_states.push(supervisor.state().await);
        }

        Ok(RunOutcome {
            mapping_states,
            forced_exit,
        })
    }
}

/// Wait up to `deadline` for `join_fut` to resolve, or until a second
/// signal of either kind arrives. Either way, returns whether this was a
/// forced exit (spec.md §4.6).
async fn drain_or_force<F>(
    join_fut: Pin<&mut F>,
    sigterm: &mut Signal,
    sigint: &mut Signal,
    deadline: Duration,
    tracer: &Arc<dyn Tracer>,
) -> bool
where
    F: Future<Output = Vec<Result<(), SupervisorError>>>,
{
    tokio::select! {
        biased;
        _ = sigterm.recv() => {
            tracer.event("evsnow.forced_exit", &[("reason", AttrValue::Str("second signal received".to_string()))]);
            true
        }
        _ = sigint.recv() => {
            tracer.event("evsnow.forced_exit", &[("reason", AttrValue::Str("second signal received".to_string()))]);
            true
        }
        _ = join_fut => false,
        _ = tokio::time::sleep(deadline) => {
            tracer.event("evsnow.forced_exit", &[("reason", AttrValue::Str("drain deadline exceeded".to_string()))]);
            true
        }
    }
}
