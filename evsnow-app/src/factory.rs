//! Builds the `EventSource` and `IngestClient` for each configured
//! mapping — the one seam `evsnow_core::Orchestrator` asks its caller to
//! fill in (spec.md §4.6's "external collaborator" boundary).

use azure_core::credentials::TokenCredential;
use evsnow_broker::{AzureEventHubSource, EventSource};
use evsnow_core::error::SupervisorError;
use evsnow_core::ports::IngestClient;
use evsnow_core::{EngineConfig, MappingFactory};
use evsnow_snowflake::{SnowflakeIngestClient, SnowflakePool};
use std::sync::Arc;

pub struct AppMappingFactory {
    engine: EngineConfig,
    azure_credential: Arc<dyn TokenCredential>,
    snowflake_pool: SnowflakePool,
    process_suffix: String,
}

impl AppMappingFactory {
    pub fn new(
        engine: EngineConfig,
        azure_credential: Arc<dyn TokenCredential>,
        snowflake_pool: SnowflakePool,
        process_suffix: String,
    ) -> Self {
        Self {
            engine,
            azure_credential,
            snowflake_pool,
            process_suffix,
        }
    }

    fn mapping(&self, mapping_name: &str) -> Option<&evsnow_core::MappingConfig> {
        self.engine.mappings.iter().find(|m| m.mapping_name == mapping_name)
    }
}

#[async_trait::async_trait]
impl MappingFactory for AppMappingFactory {
    async fn build_source(&self, mapping_name: &str) -> Result<Arc<dyn EventSource>, SupervisorError> {
        let mapping = self
            .mapping(mapping_name)
            .ok_or_else(|| SupervisorError::UnknownMapping(mapping_name.to_string()))?;

        let source = AzureEventHubSource::connect(
            &mapping.source_namespace,
            &mapping.source_hub,
            &mapping.consumer_group,
            self.azure_credential.clone(),
        )
        .await
        .map_err(SupervisorError::PartitionEnumeration)?;

        Ok(Arc::new(source))
    }

    async fn build_ingest_client(&self, mapping_name: &str) -> Result<Arc<dyn IngestClient>, SupervisorError> {
        let mapping = self
            .mapping(mapping_name)
            .ok_or_else(|| SupervisorError::UnknownMapping(mapping_name.to_string()))?;

        Ok(Arc::new(SnowflakeIngestClient::new(
            self.snowflake_pool.clone(),
            mapping.target_db.clone(),
            mapping.target_schema.clone(),
            mapping.target_table.clone(),
            mapping.pipe_name.clone(),
            self.process_suffix.clone(),
        )))
    }
}
