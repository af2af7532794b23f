//! Configuration values the core consumes, never reads for itself
//! (spec.md §6: "all supplied by the external loader, never read from
//! environment by the core"). `evsnow-app` assembles these with `figment`
//! and hands the finished struct to [`crate::Orchestrator`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff curve and retry budget for the default [`crate::RetryPolicy`]
/// (spec.md §6: `retry.max_attempts`, `retry.base_delay`, `retry.max_delay`).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Where a [`crate::PartitionWorker`] should start reading when no
/// checkpoint exists yet for its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPositionConfig {
    Earliest,
    Latest,
}

impl Default for StartPositionConfig {
    fn default() -> Self {
        StartPositionConfig::Latest
    }
}

/// Per-mapping batching overrides layered on top of [`EngineConfig`]'s
/// mapping-wide defaults (spec.md §6: `batching_overrides`).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub max_batch_size: usize,
    pub max_wait_secs: u64,
    pub prefetch: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            max_wait_secs: 10,
            prefetch: 300,
        }
    }
}

impl BatchingConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

/// One `{source event hub} -> {target Snowflake table}` mapping (spec.md
/// §6). The core treats each as an independent [`crate::MappingSupervisor`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MappingConfig {
    pub mapping_name: String,
    pub source_namespace: String,
    pub source_hub: String,
    pub consumer_group: String,
    pub target_db: String,
    pub target_schema: String,
    pub target_table: String,
    pub pipe_name: String,
    #[serde(default)]
    pub start_position: StartPositionConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
}

/// The engine-wide configuration handed to [`crate::Orchestrator::new`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub drain_deadline_secs: u64,
    pub ack_timeout_secs: u64,
    pub checkpoint_save_timeout_secs: u64,
    pub retry: RetryConfig,
    pub mappings: Vec<MappingConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            drain_deadline_secs: 30,
            ack_timeout_secs: 45,
            checkpoint_save_timeout_secs: 10,
            retry: RetryConfig::default(),
            mappings: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn drain_deadline(&self) -> Duration {
        Duration::from_secs(self.drain_deadline_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn checkpoint_save_timeout(&self) -> Duration {
        Duration::from_secs(self.checkpoint_save_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.drain_deadline_secs, 30);
        assert!(cfg.mappings.is_empty());
    }

    #[test]
    fn mapping_config_round_trips_through_json() {
        let mapping = MappingConfig {
            mapping_name: "orders".to_string(),
            source_namespace: "ns".to_string(),
            source_hub: "orders-hub".to_string(),
            consumer_group: "$Default".to_string(),
            target_db: "DB".to_string(),
            target_schema: "PUBLIC".to_string(),
            target_table: "ORDERS".to_string(),
            pipe_name: "ORDERS_PIPE".to_string(),
            start_position: StartPositionConfig::Earliest,
            batching: BatchingConfig::default(),
        };
        let json = serde_json::to_string(&mapping).unwrap();
        let back: MappingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(mapping, back);
    }
}
