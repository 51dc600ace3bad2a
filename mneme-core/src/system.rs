//! Assembled subsystem
//!
//! [`MnemeSystem`] builds every component from a [`MnemeConfig`], starts the
//! background work (the archiver loop and the hot-tier idle sweep) and stops
//! it again on [`MnemeSystem::shutdown`], draining the archive queue.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archetype::ArchetypeRegistry;
use crate::archive::{ColdStore, ColdTierArchiver, InMemoryColdStore};
use crate::config::{ColdBackend, MnemeConfig};
use crate::coordinator::{AdapterCoordinator, InferenceRuntime};
use crate::error::{MnemeError, Result};
use crate::health::HealthReport;
use crate::memory::{
    ExtractiveSummarizer, HotTier, InMemoryWarmStore, SessionCloser, Summarizer, WarmStore,
    WarmTierManager,
};
use crate::pipeline::TurnPipeline;

/// Storage and collaborators a system can be started with
pub struct SystemParts {
    pub runtime: Arc<dyn InferenceRuntime>,
    pub warm_store: Arc<dyn WarmStore>,
    pub cold_store: Arc<dyn ColdStore>,
    pub summarizer: Arc<dyn Summarizer>,
}

impl SystemParts {
    /// In-process warm store, extractive summaries, cold store per `config`
    pub async fn from_config(config: &MnemeConfig, runtime: Arc<dyn InferenceRuntime>) -> Result<Self> {
        Ok(Self {
            runtime,
            warm_store: Arc::new(InMemoryWarmStore::new()),
            cold_store: cold_store(&config.cold.backend).await?,
            summarizer: Arc::new(ExtractiveSummarizer::new()),
        })
    }
}

async fn cold_store(backend: &ColdBackend) -> Result<Arc<dyn ColdStore>> {
    match backend {
        ColdBackend::Memory => Ok(Arc::new(InMemoryColdStore::new())),
        #[cfg(feature = "cold-surrealdb")]
        ColdBackend::Surreal {
            namespace,
            database,
        } => Ok(Arc::new(
            crate::archive::SurrealColdStore::in_memory(namespace, database).await?,
        )),
        #[cfg(not(feature = "cold-surrealdb"))]
        ColdBackend::Surreal { .. } => Err(MnemeError::Configuration(
            "cold.backend 'surreal' requires the cold-surrealdb feature".to_string(),
        )),
    }
}

/// A running registry, coordinator, memory tiers and pipeline
pub struct MnemeSystem {
    config: MnemeConfig,
    registry: ArchetypeRegistry,
    pipeline: TurnPipeline,
    cold: Arc<dyn ColdStore>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for MnemeSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MnemeSystem")
            .field("registry", &self.registry)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl MnemeSystem {
    /// Start with default stores for `config` and the given runtime
    pub async fn start(config: MnemeConfig, runtime: Arc<dyn InferenceRuntime>) -> Result<Self> {
        let parts = SystemParts::from_config(&config, runtime).await?;
        Self::start_with(config, parts).await
    }

    /// Start with explicit stores.
    ///
    /// Opens the registry (loading its snapshot before anything is served),
    /// then spawns the archiver and the idle sweeper. Must be called inside a
    /// tokio runtime.
    pub async fn start_with(config: MnemeConfig, parts: SystemParts) -> Result<Self> {
        config.validate()?;

        let registry = ArchetypeRegistry::open(config.registry.clone()).await?;
        let coordinator = AdapterCoordinator::new(
            registry.clone(),
            parts.runtime.clone(),
            config.coordinator.ceiling_bytes,
        );
        let hot = Arc::new(HotTier::new(config.hot.clone()));
        let warm = Arc::new(WarmTierManager::new(
            config.warm.clone(),
            parts.warm_store,
            parts.cold_store.clone(),
        ));
        let archiver = Arc::new(ColdTierArchiver::new(
            config.cold.clone(),
            parts.cold_store.clone(),
        ));
        let closer = SessionCloser::new(parts.summarizer, warm.clone(), archiver.clone());
        let pipeline = TurnPipeline::new(
            coordinator,
            parts.runtime,
            hot,
            warm,
            archiver.clone(),
            closer,
        );

        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(2);
        tasks.push(tokio::spawn(archiver.run(cancel.child_token())));
        tasks.push(tokio::spawn(sweep_loop(
            pipeline.clone(),
            config.hot.sweep_interval,
            cancel.child_token(),
        )));

        info!(
            chains = registry.memory_stats().chain_count,
            ceiling_bytes = config.coordinator.ceiling_bytes,
            "Mneme started"
        );

        Ok(Self {
            config,
            registry,
            pipeline,
            cold: parts.cold_store,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &MnemeConfig {
        &self.config
    }

    pub fn registry(&self) -> &ArchetypeRegistry {
        &self.registry
    }

    pub fn coordinator(&self) -> &AdapterCoordinator {
        self.pipeline.coordinator()
    }

    pub fn pipeline(&self) -> &TurnPipeline {
        &self.pipeline
    }

    pub fn archiver(&self) -> &Arc<ColdTierArchiver> {
        self.pipeline.archiver()
    }

    pub fn cold_store(&self) -> &Arc<dyn ColdStore> {
        &self.cold
    }

    /// Stats of every component
    pub fn health(&self) -> HealthReport {
        HealthReport::new(
            self.registry.stats(),
            self.registry.memory_stats(),
            self.coordinator().stats(),
            self.pipeline.hot().stats(),
            self.pipeline.warm().stats(),
            self.archiver().stats(),
            self.pipeline.stats(),
        )
    }

    /// Stop background work and drain the archive queue.
    ///
    /// # Errors
    ///
    /// [`MnemeError::StorageUnavailable`] when records are still queued after
    /// the final drain, so the caller knows they were not persisted.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let remaining = self.archiver().stats();
        let unwritten = remaining.queue_depth + remaining.pending_retry;
        if unwritten > 0 {
            return Err(MnemeError::StorageUnavailable(format!(
                "{} records were not archived before shutdown",
                unwritten
            )));
        }
        info!("Mneme stopped");
        Ok(())
    }
}

impl Drop for MnemeSystem {
    fn drop(&mut self) {
        // Background tasks hold clones of the components; stop them too
        self.cancel.cancel();
    }
}

async fn sweep_loop(pipeline: TurnPipeline, interval: std::time::Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let closed = pipeline.sweep_idle().await;
                if closed > 0 {
                    debug!(closed, "Closed idle sessions");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archetype::ArchetypeId;
    use crate::coordinator::StubRuntime;
    use crate::eval::{synthetic_adapters, synthetic_archetype};
    use crate::pipeline::TurnRequest;
    use crate::archetype::Task;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::Instant;

    fn config(dir: &TempDir) -> MnemeConfig {
        let mut config = MnemeConfig::default();
        config.registry.snapshot_path = dir.path().join("registry/chains.json");
        config.registry.adapter_root = dir.path().join("adapters");
        config.cold.flush_interval = Duration::from_millis(20);
        std::fs::create_dir_all(&config.registry.adapter_root).unwrap();
        config
    }

    #[tokio::test]
    async fn test_start_serve_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let system = MnemeSystem::start(config(&dir), Arc::new(StubRuntime::new()))
            .await
            .unwrap();

        let id = ArchetypeId::new("innkeeper").unwrap();
        system
            .registry()
            .register(synthetic_archetype(&id), synthetic_adapters(&id, 64).unwrap(), "gpu-0")
            .await
            .unwrap();

        for ordinal in 1..=3 {
            let request = TurnRequest::new("inn-1", "player-1", id.clone(), Task::Dialogue, ordinal, "a room please");
            system
                .pipeline()
                .respond(request, Instant::now() + Duration::from_secs(5))
                .await
                .unwrap();
        }
        assert!(system.health().is_healthy());

        let cold = system.cold_store().clone();
        system.shutdown().await.unwrap();
        assert_eq!(cold.load_turns("inn-1", 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_invalid_config_refused() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.coordinator.ceiling_bytes = 0;
        let err = MnemeSystem::start(config, Arc::new(StubRuntime::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, MnemeError::Configuration(_)));
    }
}
