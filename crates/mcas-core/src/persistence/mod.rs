pub mod in_memory;
pub mod json_file;

pub use in_memory::MemoryStore;
pub use json_file::JsonFileStore;

use std::collections::BTreeMap;

use crate::models::{CoreError, TaskId, TaskRecord, TaskStatus, WorkerId, WorkerState};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

/// Upsert-by-id task collection. Implementations do not synchronize writers.
pub trait TaskStore: Send + Sync {
    fn save_task(&self, task: &TaskRecord) -> PersistenceResult<()>;

    fn get_task(&self, task_id: &TaskId) -> PersistenceResult<Option<TaskRecord>>;

    /// Tasks in insertion order, optionally restricted to one status.
    fn list_tasks(&self, status: Option<TaskStatus>) -> PersistenceResult<Vec<TaskRecord>>;

    /// Returns `false` when no task with that id was stored.
    fn delete_task(&self, task_id: &TaskId) -> PersistenceResult<bool>;
}

pub trait WorkerStateStore: Send + Sync {
    fn save_worker_state(&self, state: &WorkerState) -> PersistenceResult<()>;

    fn get_worker_state(&self, worker_id: &WorkerId) -> PersistenceResult<Option<WorkerState>>;

    fn list_worker_states(&self) -> PersistenceResult<BTreeMap<WorkerId, WorkerState>>;

    fn delete_worker_state(&self, worker_id: &WorkerId) -> PersistenceResult<bool>;
}

/// Both collections behind one handle, as the registry needs them.
pub trait EngineStore: TaskStore + WorkerStateStore {}

impl<T: TaskStore + WorkerStateStore> EngineStore for T {}
