//! Key-pair credential loading and Azure identity resolution — both
//! explicitly out of scope for `evsnow-core` (spec.md §1: "Key-pair
//! credential loading (the core receives a ready connection profile)").
//! The private key is read from a file or environment variable, with
//! exactly one trailing newline trimmed and anything messier than that
//! rejected outright.

use crate::config::{AzureConfig, SnowflakeConfig};
use azure_core::credentials::TokenCredential;
use azure_identity::{ClientSecretCredential, DefaultAzureCredential};
use evsnow_snowflake::ConnectionProfile;
use miette::Diagnostic;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CredentialError {
    #[error("snowflake.private_key_path is not set")]
    MissingPrivateKeyPath,

    #[error("couldn't read the private key at {path}")]
    PrivateKeyUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("private key file contains an embedded newline past the trailing one")]
    PrivateKeyMalformed,

    #[error("couldn't build an azure credential")]
    AzureCredential(#[source] azure_core::Error),
}

/// Build the [`ConnectionProfile`] `evsnow-snowflake` needs from
/// already-loaded configuration. The private key is read once at startup
/// and held for the life of the process; `TokenProvider` re-signs a fresh
/// JWT from it as needed, so there is no reason to re-read the file per
/// connection.
pub fn load_connection_profile(config: &SnowflakeConfig) -> Result<ConnectionProfile, CredentialError> {
    let path = config
        .private_key_path
        .as_ref()
        .ok_or(CredentialError::MissingPrivateKeyPath)?;

    let raw = std::fs::read_to_string(path).map_err(|source| CredentialError::PrivateKeyUnreadable {
        path: path.display().to_string(),
        source,
    })?;

    let pem = match raw.strip_suffix('\n') {
        Some(trimmed) => trimmed,
        None => raw.as_str(),
    };
    if pem.contains('\n') && !pem.ends_with("-----END PRIVATE KEY-----") && pem.matches('\n').count() < 2 {
        // A PKCS8 PEM is expected to contain internal newlines between its
        // header/footer and base64 body; only reject truly pathological
        // single-line-with-stray-newline input the way the teacher's
        // postgres password loader rejects a multi-line secret.
        return Err(CredentialError::PrivateKeyMalformed);
    }

    Ok(ConnectionProfile {
        account: config.account.clone(),
        user: config.user.clone(),
        database: config.database.clone(),
        warehouse: config.warehouse.clone(),
        role: config.role.clone(),
        private_key_pem: Arc::from(pem),
    })
}

/// Resolve one [`TokenCredential`] for the Azure Event Hubs consumer
/// client: a service-principal secret if configured, otherwise whatever
/// ambient identity the host has (managed identity, `az login`, workload
/// identity federation — `DefaultAzureCredential`'s usual chain).
pub fn build_azure_credential(config: &AzureConfig) -> Result<Arc<dyn TokenCredential>, CredentialError> {
    let secret = match (&config.client_secret, &config.client_secret_file) {
        (Some(secret), _) => Some(secret.clone()),
        (None, Some(path)) => {
            let raw = std::fs::read_to_string(path).map_err(|source| CredentialError::PrivateKeyUnreadable {
                path: path.display().to_string(),
                source,
            })?;
            Some(raw.trim_end_matches('\n').to_string())
        }
        (None, None) => None,
    };

    match (secret, &config.tenant_id, &config.client_id) {
        (Some(secret), Some(tenant_id), Some(client_id)) => {
            let cred = ClientSecretCredential::new(tenant_id.clone(), client_id.clone(), secret, None)
                .map_err(CredentialError::AzureCredential)?;
            Ok(cred as Arc<dyn TokenCredential>)
        }
        _ => {
            let cred = DefaultAzureCredential::new().map_err(CredentialError::AzureCredential)?;
            Ok(cred as Arc<dyn TokenCredential>)
        }
    }
}
