//! The crate-local error type for everything that talks to the Snowflake
//! SQL REST API, translated at the edges into `evsnow_core`'s taxonomy
//! (spec.md §7), trimmed to the handful of variants this adapter
//! actually produces.

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SnowflakeError {
    #[error("http transport error")]
    Transport(#[source] reqwest::Error),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("statement execution failed: {code} {message}")]
    StatementFailed { code: String, message: String },

    #[error("statement timed out waiting for completion")]
    StatementTimeout,

    #[error("unexpected response shape: {0}")]
    UnexpectedResponse(String),

    #[error("connection pool error")]
    Pool(#[source] r2d2::Error),
}

impl SnowflakeError {
    /// Whether this failure is safe to retry against a fresh session
    /// (spec.md §4.2: network blips, throttling, and expired sessions are
    /// transient; schema/auth/missing-object errors are permanent).
    pub fn is_transient(&self) -> bool {
        match self {
            SnowflakeError::Transport(_) | SnowflakeError::Pool(_) => true,
            SnowflakeError::StatementTimeout => true,
            SnowflakeError::StatementFailed { code, .. } => {
                // Snowflake SQL state classes: 08xxx connection, 57xxx operator intervention.
                code.starts_with("08") || code.starts_with("57") || code == "000607"
            }
            SnowflakeError::Credential(_) | SnowflakeError::UnexpectedResponse(_) => false,
        }
    }
}

impl From<reqwest::Error> for SnowflakeError {
    fn from(err: reqwest::Error) -> Self {
        SnowflakeError::Transport(err)
    }
}
