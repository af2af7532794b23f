use miette::Diagnostic;
use thiserror::Error;

/// Top-level failure taxonomy for the `evsnow-app` binary. Configuration
/// errors are raised here, at startup, by the external loader — never
/// inside the engine's steady-state loop (spec.md §7: "ConfigurationError
/// — raised at startup by the external loader, not during the loop").
#[derive(Debug, Error, Diagnostic)]
pub enum AppError {
    #[error("configuration error")]
    Config(#[source] figment::Error),

    #[error("credential error")]
    Credential(#[from] crate::credential::CredentialError),

    #[error("couldn't build the snowflake connection pool")]
    SnowflakePool(#[source] r2d2::Error),

    #[error(transparent)]
    Orchestrator(#[from] evsnow_core::error::OrchestratorError),
}
