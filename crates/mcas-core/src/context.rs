use std::sync::Arc;

use crate::config::{EngineConfig, StorageBackend};
use crate::models::{CoreResult, WorkerId};
use crate::orchestration::{Coordinator, HeartbeatHandle, TaskAllocator, spawn_heartbeat};
use crate::persistence::{EngineStore, JsonFileStore, MemoryStore};
use crate::registry::Registry;
use crate::sqlite::SqliteStore;
use crate::worker::{PoolWorker, Worker};

/// Workers every engine starts with.
pub fn default_roster() -> Vec<Arc<dyn Worker>> {
    vec![
        Arc::new(PoolWorker::coordinator("coordinator_001")),
        Arc::new(PoolWorker::executor("executor_001")),
        Arc::new(PoolWorker::executor("executor_002")),
        Arc::new(PoolWorker::analyzer("analyzer_001")),
    ]
}

/// Everything a running engine needs, built once from configuration and passed
/// to whoever drives it.
pub struct EngineContext {
    config: EngineConfig,
    registry: Arc<Registry>,
    coordinator: Arc<Coordinator>,
}

impl EngineContext {
    /// Opens the configured store, registers the default roster and overlays any
    /// persisted state.
    pub fn init(config: EngineConfig) -> CoreResult<Self> {
        Self::init_with_workers(config, default_roster())
    }

    pub fn init_with_workers(
        config: EngineConfig,
        workers: Vec<Arc<dyn Worker>>,
    ) -> CoreResult<Self> {
        config.validate()?;
        let store = open_store(&config)?;
        Self::init_with_store(config, store, workers)
    }

    pub fn init_with_store(
        config: EngineConfig,
        store: Arc<dyn EngineStore>,
        workers: Vec<Arc<dyn Worker>>,
    ) -> CoreResult<Self> {
        config.validate()?;
        // Registration persists a snapshot, so stored states go onto the workers first.
        let stored_states = store.list_worker_states()?;
        for worker in &workers {
            if let Some(stored) = stored_states.get(worker.id()) {
                if let Err(error) = worker.overlay_state(stored.clone()) {
                    tracing::warn!(
                        worker_id = %worker.id(),
                        message = %error.message,
                        "ignoring stored worker state"
                    );
                }
            }
        }

        let registry = Arc::new(Registry::new(store));
        for worker in workers {
            registry.register_worker(worker)?;
        }
        registry.load_persistent_data()?;

        if config.worker.auto_start {
            for worker in registry.workers()? {
                if let Err(error) = registry.start_worker(worker.id()) {
                    tracing::warn!(
                        worker_id = %worker.id(),
                        message = %error.message,
                        "worker did not auto-start"
                    );
                }
            }
        }

        let allocator = TaskAllocator::new(
            config.worker.load_threshold,
            config.allocation.type_mapping.clone(),
        )
        .with_strategy(config.allocation.strategy);
        let coordinator = Arc::new(Coordinator::new(Arc::clone(&registry), allocator));

        tracing::info!(
            backend = ?config.storage.backend,
            workers = registry.workers()?.len(),
            "engine initialized"
        );
        Ok(Self {
            config,
            registry,
            coordinator,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Replaces the coordinator's allocator, e.g. to install a custom rule.
    pub fn set_allocator(&mut self, allocator: TaskAllocator) {
        self.coordinator = Arc::new(Coordinator::new(Arc::clone(&self.registry), allocator));
    }

    pub fn spawn_heartbeat(&self) -> CoreResult<HeartbeatHandle> {
        spawn_heartbeat(
            Arc::clone(&self.registry),
            self.config.worker.heartbeat_interval(),
        )
    }

    /// Stops every worker and persists its final state.
    pub fn shutdown(&self) -> CoreResult<()> {
        let ids: Vec<WorkerId> = self
            .registry
            .workers()?
            .iter()
            .map(|worker| worker.id().clone())
            .collect();
        for worker_id in &ids {
            self.registry.stop_worker(worker_id)?;
        }
        tracing::info!(workers = ids.len(), "engine shut down");
        Ok(())
    }
}

fn open_store(config: &EngineConfig) -> CoreResult<Arc<dyn EngineStore>> {
    let store: Arc<dyn EngineStore> = match config.storage.backend {
        StorageBackend::Json => Arc::new(JsonFileStore::open(&config.storage.path)?),
        StorageBackend::Sqlite => {
            let store = SqliteStore::new(config.storage.database_path());
            store.migrate_to_latest()?;
            Arc::new(store)
        }
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}
