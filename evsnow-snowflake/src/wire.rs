//! Async statement execution against Snowflake's SQL REST API
//! (`POST /api/v2/statements`, polled via
//! `GET /api/v2/statements/{handle}`). Adapted from a key-pair-JWT-signed
//! synchronous-looking request into the poll-until-done shape this engine
//! needs for a "durable ack" (spec.md §4.2).

use crate::credential::TokenProvider;
use crate::error::SnowflakeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Serialize, Debug, Clone)]
struct WireStatement {
    statement: String,
    timeout: u32,
    database: String,
    warehouse: String,
    role: Option<String>,
    bindings: HashMap<String, Binding>,
    async_exec: bool,
}

/// One SQL parameter binding. Snowflake's REST API takes `{"type": ..,
/// "value": ..}` objects keyed by 1-based position.
#[derive(Serialize, Debug, Clone)]
pub struct Binding {
    #[serde(rename = "type")]
    pub sf_type: &'static str,
    pub value: String,
}

impl Binding {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            sf_type: "TEXT",
            value: value.into(),
        }
    }

    pub fn fixed(value: i64) -> Self {
        Self {
            sf_type: "FIXED",
            value: value.to_string(),
        }
    }

    pub fn variant(value: &Value) -> Self {
        Self {
            sf_type: "TEXT",
            value: value.to_string(),
        }
    }
}

#[derive(Deserialize, Debug)]
struct WireStatementResponse {
    #[serde(rename = "statementHandle")]
    statement_handle: Option<String>,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize, Debug)]
struct WireStatementStatus {
    code: Option<String>,
    message: Option<String>,
    data: Option<Vec<Vec<Value>>>,
}

/// A thin, stateless executor bound to one account + session. Every
/// `MERGE`/checkpoint upsert and every ingest statement goes through
/// `execute_async` + `poll_until_done`, never a bare synchronous call,
/// because Snowflake's REST statements can legitimately take longer than
/// an HTTP client's default timeout for a large batch.
pub struct StatementClient {
    http: reqwest::Client,
    tokens: Arc<TokenProvider>,
    host: String,
    database: String,
    warehouse: String,
    role: Option<String>,
}

impl StatementClient {
    pub fn new(
        http: reqwest::Client,
        tokens: Arc<TokenProvider>,
        account: &str,
        database: String,
        warehouse: String,
        role: Option<String>,
    ) -> Self {
        Self {
            http,
            tokens,
            host: format!("https://{}.snowflakecomputing.com", account.to_ascii_lowercase()),
            database,
            warehouse,
            role,
        }
    }

    fn auth_headers(&self) -> Result<reqwest::header::HeaderMap, SnowflakeError> {
        use reqwest::header::*;
        let token = self.tokens.token()?;

        let mut headers = HeaderMap::with_capacity(4);
        headers.insert(CONTENT_TYPE, "application/json".parse().expect("static header value"));
        headers.insert(
            AUTHORIZATION,
            format!("Bearer {token}").parse().map_err(|_| SnowflakeError::Credential("invalid token".to_string()))?,
        );
        headers.insert(
            "X-Snowflake-Authorization-Token-Type",
            "KEYPAIR_JWT".parse().expect("static header value"),
        );
        headers.insert(ACCEPT, "application/json".parse().expect("static header value"));
        Ok(headers)
    }

    /// Submit `sql` for asynchronous execution, returning its statement
    /// handle without waiting for completion.
    pub async fn execute_async(&self, sql: &str, bindings: HashMap<String, Binding>) -> Result<String, SnowflakeError> {
        let wire = WireStatement {
            statement: sql.to_string(),
            timeout: 60,
            database: self.database.clone(),
            warehouse: self.warehouse.clone(),
            role: self.role.clone(),
            bindings,
            async_exec: true,
        };

        debug!(sql, "submitting snowflake statement");

        let request_id = uuid::Uuid::new_v4();
        let response = self
            .http
            .post(format!("{}/api/v2/statements?requestId={}", self.host, request_id))
            .headers(self.auth_headers()?)
            .json(&wire)
            .send()
            .await?;

        let status = response.status();
        let body: WireStatementResponse = response.json().await?;

        if !status.is_success() && status.as_u16() != 202 {
            return Err(SnowflakeError::StatementFailed {
                code: body.code.unwrap_or_default(),
                message: body.message.unwrap_or_default(),
            });
        }

        body.statement_handle
            .ok_or_else(|| SnowflakeError::UnexpectedResponse("missing statementHandle".to_string()))
    }

    /// Poll `GET /api/v2/statements/{handle}` until the statement reaches a
    /// terminal state or `deadline` elapses (spec.md §4.2
    /// `wait_for_durable`).
    pub async fn poll_until_done(&self, handle: &str, deadline: Duration) -> Result<(), SnowflakeError> {
        let started = tokio::time::Instant::now();
        let mut backoff = Duration::from_millis(200);

        loop {
            let response = self
                .http
                .get(format!("{}/api/v2/statements/{}", self.host, handle))
                .headers(self.auth_headers()?)
                .send()
                .await?;

            let status = response.status();

            if status.as_u16() == 202 {
                // Still executing.
            } else if status.is_success() {
                return Ok(());
            } else {
                let body: WireStatementStatus = response.json().await?;
                return Err(SnowflakeError::StatementFailed {
                    code: body.code.unwrap_or_default(),
                    message: body.message.unwrap_or_default(),
                });
            }

            if started.elapsed() >= deadline {
                return Err(SnowflakeError::StatementTimeout);
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(5));
        }
    }

    /// Execute `sql` and block until it completes, for callers (like
    /// `ensure_table`) that don't need the async-submit/poll split.
    pub async fn execute_and_wait(&self, sql: &str, bindings: HashMap<String, Binding>, deadline: Duration) -> Result<(), SnowflakeError> {
        let handle = self.execute_async(sql, bindings).await?;
        self.poll_until_done(&handle, deadline).await
    }

    /// Execute a `SELECT` and return its rows as arrays of JSON values, one
    /// per column, in column order. Used by [`crate::checkpoint`] to decode
    /// `INGESTION_STATUS` reads — the REST API hands result rows back on
    /// the same statement handle once it reaches a terminal state, so this
    /// folds submit + poll + row retrieval into one call.
    pub async fn query_rows(&self, sql: &str, bindings: HashMap<String, Binding>, deadline: Duration) -> Result<Vec<Vec<Value>>, SnowflakeError> {
        let handle = self.execute_async(sql, bindings).await?;
        let started = tokio::time::Instant::now();
        let mut backoff = Duration::from_millis(200);

        loop {
            let response = self
                .http
                .get(format!("{}/api/v2/statements/{}", self.host, handle))
                .headers(self.auth_headers()?)
                .send()
                .await?;

            let status = response.status();

            if status.as_u16() == 202 {
                if started.elapsed() >= deadline {
                    return Err(SnowflakeError::StatementTimeout);
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(5));
                continue;
            }

            let body: WireStatementStatus = response.json().await?;

            if !status.is_success() {
                return Err(SnowflakeError::StatementFailed {
                    code: body.code.unwrap_or_default(),
                    message: body.message.unwrap_or_default(),
                });
            }

            return Ok(body.data.unwrap_or_default());
        }
    }
}
