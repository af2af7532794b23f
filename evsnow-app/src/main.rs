//! `evsnow-app`: the thin CLI/process wrapper around `evsnow-core`'s
//! `Orchestrator` (spec.md §1 explicitly carves configuration parsing,
//! the CLI front-end, key-pair credential loading, and observability
//! sinks out of the core's scope — this binary is where they live).
//! Shaped after the teacher's `#[tokio::main] async fn main() ->
//! miette::Result<()>` entry points in
//! `examples/beiju-mmoldb/mmoldb-ingest/src/main.rs`.

mod config;
mod credential;
mod error;
mod factory;
mod observability;
mod status;

use config::AppConfig;
use error::AppError;
use evsnow_core::Orchestrator;
use evsnow_snowflake::{get_pool, SnowflakeCheckpointStore};
use factory::AppMappingFactory;
use miette::IntoDiagnostic;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let config = AppConfig::load().map_err(AppError::Config).into_diagnostic()?;

    let logger_provider = observability::install(&config.observability);

    info!(mappings = config.engine.mappings.len(), "evsnow starting up");

    let process_suffix = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();

    let connection_profile = credential::load_connection_profile(&config.snowflake)
        .map_err(AppError::Credential)
        .into_diagnostic()?;

    let snowflake_pool = get_pool(connection_profile, config.snowflake.pool_size)
        .map_err(AppError::SnowflakePool)
        .into_diagnostic()?;

    let checkpoint_store = Arc::new(SnowflakeCheckpointStore::new(
        snowflake_pool.clone(),
        Duration::from_secs(config.snowflake.statement_timeout_secs),
    ));

    let azure_credential = credential::build_azure_credential(&config.azure)
        .map_err(AppError::Credential)
        .into_diagnostic()?;

    let factory = Arc::new(AppMappingFactory::new(
        config.engine.clone(),
        azure_credential,
        snowflake_pool,
        process_suffix.clone(),
    ));

    let tracer = Arc::new(observability::TracingTracer::new());

    let orchestrator = Orchestrator::new(config.engine.clone(), checkpoint_store, tracer, process_suffix);

    let outcome = orchestrator.run(factory).await.map_err(AppError::Orchestrator).into_diagnostic()?;

    status::print_report(&outcome);

    if let Some(provider) = logger_provider {
        let _ = provider.shutdown();
    }

    std::process::exit(outcome.exit_code());
}
