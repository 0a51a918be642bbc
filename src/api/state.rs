//! Shared application state for the HTTP API
//!
//! Everything is explicitly constructed and injected: storage, registry,
//! runner, broker, gate and completion provider are built once at startup
//! and handed to the router as one cloneable state value.

use crate::config::TraceryConfig;
use crate::error::Result;
use crate::gate::Gate;
use crate::pipeline::{modules, ModuleRegistry, PipelineRunner};
use crate::services::{provider_from_env, CompletionProvider};
use crate::storage::{ConnectionMode, LibsqlStorage, Storage};
use crate::stream::StreamBroker;
use std::sync::Arc;

/// Cloneable handle to every component the handlers need
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub registry: Arc<ModuleRegistry>,
    pub runner: Arc<PipelineRunner>,
    pub broker: Arc<StreamBroker>,
    pub gate: Arc<Gate>,
    pub provider: Arc<dyn CompletionProvider>,
}

impl AppState {
    /// Wire up the full component graph from configuration: storage with
    /// schema applied, built-in modules registered, gate seeded from the
    /// `[features]` table.
    pub async fn initialize(config: &TraceryConfig) -> Result<Self> {
        let mode = if config.database.path == ":memory:" {
            ConnectionMode::InMemory
        } else {
            ConnectionMode::Local(config.database.path.clone())
        };

        let storage: Arc<dyn Storage> = Arc::new(LibsqlStorage::connect(mode).await?);
        Self::assemble(storage, config, provider_from_env())
    }

    /// Assemble state around an existing storage backend (tests inject an
    /// in-memory store and a deterministic provider here)
    pub fn assemble(
        storage: Arc<dyn Storage>,
        config: &TraceryConfig,
        provider: Arc<dyn CompletionProvider>,
    ) -> Result<Self> {
        let registry = Arc::new(ModuleRegistry::new());
        modules::register_builtins(&registry)?;

        let gate = Arc::new(Gate::from_config(&config.features));
        let broker = Arc::new(StreamBroker::new(config.stream.queue_capacity));

        let runner = Arc::new(PipelineRunner::new(
            storage.clone(),
            registry.clone(),
            gate.clone(),
            broker.clone(),
            config.pipeline.batch_size,
        ));

        Ok(Self {
            storage,
            registry,
            runner,
            broker,
            gate,
            provider,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::FallbackProvider;
    use crate::storage::LibsqlStorage;

    #[tokio::test]
    async fn test_assemble_registers_builtin_modules() {
        let storage = Arc::new(LibsqlStorage::in_memory().await.unwrap());
        let state = AppState::assemble(
            storage,
            &TraceryConfig::default(),
            Arc::new(FallbackProvider::instant()),
        )
        .unwrap();

        assert_eq!(state.registry.descriptors().len(), 6);
        assert!(state.gate.is_enabled(crate::gate::FEATURE_LEARNING));
    }
}
