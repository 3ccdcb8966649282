use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::models::{CoreError, TaskId, TaskRecord, TaskStatus, WorkerId, WorkerState};
use crate::persistence::{PersistenceResult, TaskStore, WorkerStateStore};

/// Volatile store with the same upsert semantics as the file-backed ones.
#[derive(Default)]
pub struct MemoryStore {
    tasks: Mutex<Vec<TaskRecord>>,
    worker_states: Mutex<BTreeMap<WorkerId, WorkerState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> PersistenceResult<MutexGuard<'_, Vec<TaskRecord>>> {
        self.tasks
            .lock()
            .map_err(|_| CoreError::poisoned("memory task store"))
    }

    fn worker_states(&self) -> PersistenceResult<MutexGuard<'_, BTreeMap<WorkerId, WorkerState>>> {
        self.worker_states
            .lock()
            .map_err(|_| CoreError::poisoned("memory worker state store"))
    }
}

impl TaskStore for MemoryStore {
    fn save_task(&self, task: &TaskRecord) -> PersistenceResult<()> {
        let mut tasks = self.tasks()?;
        match tasks
            .iter_mut()
            .find(|stored| stored.task_id == task.task_id)
        {
            Some(stored) => *stored = task.clone(),
            None => tasks.push(task.clone()),
        }
        Ok(())
    }

    fn get_task(&self, task_id: &TaskId) -> PersistenceResult<Option<TaskRecord>> {
        Ok(self
            .tasks()?
            .iter()
            .find(|task| &task.task_id == task_id)
            .cloned())
    }

    fn list_tasks(&self, status: Option<TaskStatus>) -> PersistenceResult<Vec<TaskRecord>> {
        Ok(self
            .tasks()?
            .iter()
            .filter(|task| status.is_none_or(|status| task.status == status))
            .cloned()
            .collect())
    }

    fn delete_task(&self, task_id: &TaskId) -> PersistenceResult<bool> {
        let mut tasks = self.tasks()?;
        let before = tasks.len();
        tasks.retain(|task| &task.task_id != task_id);
        Ok(tasks.len() != before)
    }
}

impl WorkerStateStore for MemoryStore {
    fn save_worker_state(&self, state: &WorkerState) -> PersistenceResult<()> {
        self.worker_states()?
            .insert(state.worker_id.clone(), state.clone());
        Ok(())
    }

    fn get_worker_state(&self, worker_id: &WorkerId) -> PersistenceResult<Option<WorkerState>> {
        Ok(self.worker_states()?.get(worker_id).cloned())
    }

    fn list_worker_states(&self) -> PersistenceResult<BTreeMap<WorkerId, WorkerState>> {
        Ok(self.worker_states()?.clone())
    }

    fn delete_worker_state(&self, worker_id: &WorkerId) -> PersistenceResult<bool> {
        Ok(self.worker_states()?.remove(worker_id).is_some())
    }
}
