//! Connection pooling for the Snowflake SQL REST API: an `r2d2::Pool`
//! over a "connection" that is really a validated [`reqwest::Client`]
//! paired with the shared [`TokenProvider`], since the REST API has no
//! persistent socket to manage, only a bearer token with an expiry.

use crate::credential::{ConnectionProfile, TokenProvider};
use crate::error::SnowflakeError;
use crate::wire::StatementClient;
use r2d2::ManageConnection;
use std::sync::Arc;
use std::time::Duration;

pub type SnowflakePool = r2d2::Pool<SessionManager>;

/// One checked-out pool entry: an HTTP client plus everything needed to
/// build a [`StatementClient`] against a particular database/warehouse.
pub struct SnowflakeSession {
    pub http: reqwest::Client,
    pub tokens: Arc<TokenProvider>,
    pub profile: ConnectionProfile,
}

impl SnowflakeSession {
    pub fn statements(&self) -> StatementClient {
        StatementClient::new(
            self.http.clone(),
            self.tokens.clone(),
            &self.profile.account,
            self.profile.database.clone(),
            self.profile.warehouse.clone(),
            self.profile.role.clone(),
        )
    }
}

pub struct SessionManager {
    profile: ConnectionProfile,
    tokens: Arc<TokenProvider>,
}

impl SessionManager {
    pub fn new(profile: ConnectionProfile) -> Self {
        let tokens = Arc::new(TokenProvider::new(profile.clone()));
        Self { profile, tokens }
    }
}

impl ManageConnection for SessionManager {
    type Connection = SnowflakeSession;
    type Error = SnowflakeError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .map_err(SnowflakeError::from)?;

        Ok(SnowflakeSession {
            http,
            tokens: self.tokens.clone(),
            profile: self.profile.clone(),
        })
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.tokens.token().map(|_| ())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Builds a bounded pool of Snowflake sessions for one connection profile.
pub fn get_pool(profile: ConnectionProfile, max_size: u32) -> Result<SnowflakePool, r2d2::Error> {
    let manager = SessionManager::new(profile);
    r2d2::Pool::builder().max_size(max_size).build(manager)
}
