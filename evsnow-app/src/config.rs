//! Configuration loading for the `evsnow-app` binary. `evsnow-core` never
//! reads a file or an environment variable itself (spec.md §6); this
//! module is the only place in the workspace that does, following the
//! teacher's `IngestConfig::figment()` / `postgres_url_from_environment()`
//! merge-then-extract shape in
//! `examples/beiju-mmoldb/mmoldb-ingest/src/config.rs` and
//! `examples/beiju-mmoldb/mmoldb-db/src/url.rs`.

use evsnow_core::EngineConfig;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Everything `evsnow-app` needs beyond what `evsnow-core` itself
/// consumes: how to authenticate to Snowflake and to Event Hubs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub snowflake: SnowflakeConfig,
    pub azure: AzureConfig,
    pub observability: ObservabilityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            snowflake: SnowflakeConfig::default(),
            azure: AzureConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AppConfig {
    /// `EVSNOW.toml` merged over built-in defaults, merged over
    /// `EVSNOW_`-prefixed environment variables — highest precedence last,
    /// matching the teacher's `Figment::from(Serialized::defaults(..))
    /// .merge(Toml::file(..)).merge(Env::prefixed(..))` chain.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file("EVSNOW.toml"))
            .merge(Env::prefixed("EVSNOW_").split("__"))
    }

    pub fn load() -> figment::Result<Self> {
        Self::figment().extract()
    }
}

/// Account/user/warehouse addressing plus where to find the key-pair
/// private key used to mint the SQL REST API's JWT (spec.md §1: "the core
/// receives a ready connection profile" — this is the out-of-scope loader
/// that builds one).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SnowflakeConfig {
    pub account: String,
    pub user: String,
    pub database: String,
    pub warehouse: String,
    pub role: Option<String>,
    pub private_key_path: Option<PathBuf>,
    pub pool_size: u32,
    pub statement_timeout_secs: u64,
}

impl Default for SnowflakeConfig {
    fn default() -> Self {
        Self {
            account: String::new(),
            user: String::new(),
            database: String::new(),
            warehouse: String::new(),
            role: None,
            private_key_path: None,
            pool_size: 4,
            statement_timeout_secs: 10,
        }
    }
}

/// Either a service-principal secret or "use whatever ambient identity
/// this host has" (managed identity, Azure CLI login, ...), deferred to
/// `azure_identity::DefaultAzureCredential` when no secret is configured.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AzureConfig {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub client_secret_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            service_name: "evsnow".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_extract_cleanly() {
        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .extract()
            .unwrap();
        assert_eq!(config.snowflake.pool_size, 4);
        assert!(config.engine.mappings.is_empty());
    }

    #[test]
    fn env_overrides_are_nested_with_double_underscore() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("EVSNOW_SNOWFLAKE__ACCOUNT", "myaccount");
            jail.set_env("EVSNOW_SNOWFLAKE__POOL_SIZE", "8");
            let config = AppConfig::load().unwrap();
            assert_eq!(config.snowflake.account, "myaccount");
            assert_eq!(config.snowflake.pool_size, 8);
            Ok(())
        });
    }
}
