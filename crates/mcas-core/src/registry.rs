use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use time::OffsetDateTime;

use crate::models::{
    CoreError, CoreErrorKind, CoreResult, TaskId, TaskRecord, TaskStatus, WorkerId, WorkerState,
};
use crate::persistence::EngineStore;
use crate::worker::{ExecutionOutcome, Worker};

/// Task collection partitioned by status, rebuilt in one pass after every write.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TaskLists {
    pub pending: Vec<TaskRecord>,
    pub running: Vec<TaskRecord>,
    pub completed: Vec<TaskRecord>,
    pub failed: Vec<TaskRecord>,
}

impl TaskLists {
    pub fn partition(tasks: &[TaskRecord]) -> Self {
        let mut lists = Self::default();
        for task in tasks {
            let bucket = match task.status {
                TaskStatus::Pending => &mut lists.pending,
                TaskStatus::Running => &mut lists.running,
                TaskStatus::Completed => &mut lists.completed,
                TaskStatus::Failed => &mut lists.failed,
            };
            bucket.push(task.clone());
        }
        lists
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.running.len() + self.completed.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Live worker handles plus the canonical task collection, mirrored to a store.
///
/// All state sits behind one mutex that is also held across store writes, so the
/// store never sees concurrent read-modify-write cycles. Every write persists
/// first and only then touches memory: a failed store call leaves the in-memory
/// view and the partitioned lists exactly as they were.
pub struct Registry {
    store: Arc<dyn EngineStore>,
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    workers: BTreeMap<WorkerId, Arc<dyn Worker>>,
    tasks: Vec<TaskRecord>,
    lists: TaskLists,
    updated_at: Option<OffsetDateTime>,
}

impl RegistryState {
    fn position(&self, task_id: &TaskId) -> Option<usize> {
        self.tasks.iter().position(|task| &task.task_id == task_id)
    }

    fn task(&self, task_id: &TaskId) -> CoreResult<&TaskRecord> {
        self.tasks
            .iter()
            .find(|task| &task.task_id == task_id)
            .ok_or_else(|| CoreError::task_not_found(task_id))
    }

    fn worker(&self, worker_id: &WorkerId) -> CoreResult<Arc<dyn Worker>> {
        self.workers
            .get(worker_id)
            .cloned()
            .ok_or_else(|| CoreError::worker_not_found(worker_id))
    }

    fn upsert_task(&mut self, task: TaskRecord) {
        match self.position(&task.task_id) {
            Some(index) => self.tasks[index] = task,
            None => self.tasks.push(task),
        }
        self.refresh();
    }

    fn refresh(&mut self) {
        self.lists = TaskLists::partition(&self.tasks);
        self.touch();
    }

    fn touch(&mut self) {
        let now = OffsetDateTime::now_utc();
        self.updated_at = Some(match self.updated_at {
            Some(previous) if previous > now => previous,
            _ => now,
        });
    }
}

impl Registry {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self {
            store,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.store
    }

    fn lock_state(&self) -> CoreResult<MutexGuard<'_, RegistryState>> {
        self.state
            .lock()
            .map_err(|_| CoreError::poisoned("registry state"))
    }

    /// Persists the worker's initial snapshot, then makes it live. Registering an
    /// id again replaces the previous handle.
    pub fn register_worker(&self, worker: Arc<dyn Worker>) -> CoreResult<()> {
        let snapshot = worker.state()?;
        let mut state = self.lock_state()?;
        self.store
            .save_worker_state(&snapshot)
            .map_err(|error| log_store_failure(error, "register worker"))?;

        let replaced = state
            .workers
            .insert(snapshot.worker_id.clone(), worker)
            .is_some();
        state.touch();
        tracing::info!(
            worker_id = %snapshot.worker_id,
            worker_type = %snapshot.worker_type,
            replaced,
            "worker registered"
        );
        Ok(())
    }

    pub fn deregister_worker(&self, worker_id: &WorkerId) -> CoreResult<()> {
        let mut state = self.lock_state()?;
        if !state.workers.contains_key(worker_id) {
            tracing::warn!(worker_id = %worker_id, "cannot deregister unknown worker");
            return Err(CoreError::worker_not_found(worker_id));
        }
        self.store
            .delete_worker_state(worker_id)
            .map_err(|error| log_store_failure(error, "deregister worker"))?;

        state.workers.remove(worker_id);
        state.touch();
        tracing::info!(worker_id = %worker_id, "worker deregistered");
        Ok(())
    }

    /// Writes the worker's self-reported state to the store. Returns `false` when
    /// the id is not registered.
    pub fn sync_worker_state(&self, worker_id: &WorkerId) -> CoreResult<bool> {
        let mut state = self.lock_state()?;
        let Some(worker) = state.workers.get(worker_id).cloned() else {
            tracing::debug!(worker_id = %worker_id, "skipping sync of unregistered worker");
            return Ok(false);
        };
        let snapshot = worker.state()?;
        self.store
            .save_worker_state(&snapshot)
            .map_err(|error| log_store_failure(error, "sync worker state"))?;
        state.touch();
        Ok(true)
    }

    /// Syncs every registered worker; returns how many were written.
    ///
    /// A failed write does not stop the round. When any worker fails, the
    /// others are still written and the error names every id that was not.
    pub fn sync_all_workers(&self) -> CoreResult<usize> {
        let mut state = self.lock_state()?;
        let mut synced = 0;
        let mut failed = Vec::new();
        for (worker_id, worker) in &state.workers {
            let written = worker
                .state()
                .and_then(|snapshot| self.store.save_worker_state(&snapshot));
            match written {
                Ok(()) => synced += 1,
                Err(error) => {
                    tracing::error!(
                        worker_id = %worker_id,
                        kind = ?error.kind,
                        message = %error.message,
                        "worker state sync failed"
                    );
                    failed.push(worker_id.to_string());
                }
            }
        }
        if synced > 0 {
            state.touch();
        }
        if !failed.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::StorageFailure,
                format!(
                    "synced {synced} worker(s); failed to sync: {}",
                    failed.join(", ")
                ),
            ));
        }
        Ok(synced)
    }

    pub fn add_task(&self, task: TaskRecord) -> CoreResult<()> {
        if task.status != TaskStatus::Pending {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!(
                    "task '{}' must be pending when added, found '{}'",
                    task.task_id, task.status
                ),
            )
            .with_task(&task.task_id));
        }
        let mut state = self.lock_state()?;
        if state.position(&task.task_id).is_some() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("task '{}' already exists", task.task_id),
            )
            .with_task(&task.task_id));
        }
        self.store
            .save_task(&task)
            .map_err(|error| log_store_failure(error, "add task"))?;

        tracing::info!(task_id = %task.task_id, task_type = %task.task_type, "task added");
        state.upsert_task(task);
        Ok(())
    }

    pub fn remove_task(&self, task_id: &TaskId) -> CoreResult<()> {
        let mut state = self.lock_state()?;
        let Some(index) = state.position(task_id) else {
            tracing::warn!(task_id = %task_id, "cannot remove unknown task");
            return Err(CoreError::task_not_found(task_id));
        };
        self.store
            .delete_task(task_id)
            .map_err(|error| log_store_failure(error, "remove task"))?;

        state.tasks.remove(index);
        state.refresh();
        tracing::info!(task_id = %task_id, "task removed");
        Ok(())
    }

    /// Administrative alias of [`Registry::remove_task`].
    pub fn delete_task(&self, task_id: &TaskId) -> CoreResult<()> {
        self.remove_task(task_id)
    }

    /// Applies a forward-only status change. Asking for the current status is a
    /// successful no-op that writes nothing.
    pub fn update_task_status(
        &self,
        task_id: &TaskId,
        next: TaskStatus,
    ) -> CoreResult<TaskRecord> {
        let mut state = self.lock_state()?;
        let mut task = state
            .task(task_id)
            .inspect_err(|_| tracing::warn!(task_id = %task_id, "cannot update unknown task"))?
            .clone();
        if !task.apply_status(next, OffsetDateTime::now_utc())? {
            return Ok(task);
        }
        self.store
            .save_task(&task)
            .map_err(|error| log_store_failure(error, "update task status"))?;

        tracing::info!(task_id = %task_id, status = %next, "task status updated");
        state.upsert_task(task.clone());
        Ok(task)
    }

    /// Persists a binding produced by the allocator. The stored task must still be
    /// pending and the incoming one running and bound.
    pub fn record_allocation(&self, task: &TaskRecord) -> CoreResult<()> {
        let Some(worker_id) = task.bound_worker_id.as_ref() else {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("task '{}' is not bound to a worker", task.task_id),
            )
            .with_task(&task.task_id));
        };
        let mut state = self.lock_state()?;
        let current = state.task(&task.task_id)?.status;
        if current != TaskStatus::Pending || task.status != TaskStatus::Running {
            return Err(CoreError::new(
                CoreErrorKind::InvalidTransition,
                format!(
                    "task '{}' cannot be allocated from '{}' to '{}'",
                    task.task_id, current, task.status
                ),
            )
            .with_task(&task.task_id));
        }
        self.store
            .save_task(task)
            .map_err(|error| log_store_failure(error, "record allocation"))?;

        tracing::info!(task_id = %task.task_id, worker_id = %worker_id, "task allocated");
        state.upsert_task(task.clone());
        Ok(())
    }

    /// Moves a running task to completed or failed according to the outcome.
    pub fn finish_task(
        &self,
        task_id: &TaskId,
        outcome: &ExecutionOutcome,
    ) -> CoreResult<TaskRecord> {
        let mut state = self.lock_state()?;
        let mut task = state.task(task_id)?.clone();
        let now = OffsetDateTime::now_utc();
        match outcome {
            ExecutionOutcome::Succeeded(_) => task.complete(now)?,
            ExecutionOutcome::Failed(message) => task.fail(message.clone(), now)?,
        }
        self.store
            .save_task(&task)
            .map_err(|error| log_store_failure(error, "finish task"))?;

        tracing::info!(task_id = %task_id, status = %task.status, "task finished");
        state.upsert_task(task.clone());
        Ok(task)
    }

    /// Replaces the in-memory tasks with the stored collection and overlays stored
    /// worker states onto registered workers. Stored states for unregistered ids
    /// stay in the store untouched.
    pub fn load_persistent_data(&self) -> CoreResult<()> {
        let mut state = self.lock_state()?;
        let tasks = self
            .store
            .list_tasks(None)
            .map_err(|error| log_store_failure(error, "load tasks"))?;
        let stored_states = self
            .store
            .list_worker_states()
            .map_err(|error| log_store_failure(error, "load worker states"))?;

        let mut overlaid = 0;
        for (worker_id, stored) in stored_states {
            let Some(worker) = state.workers.get(&worker_id) else {
                continue;
            };
            match worker.overlay_state(stored) {
                Ok(()) => overlaid += 1,
                Err(error) => tracing::warn!(
                    worker_id = %worker_id,
                    message = %error.message,
                    "ignoring stored worker state"
                ),
            }
        }

        state.tasks = tasks;
        state.refresh();
        tracing::info!(
            tasks = state.tasks.len(),
            workers_overlaid = overlaid,
            "persistent data loaded"
        );
        Ok(())
    }

    pub fn get_worker(&self, worker_id: &WorkerId) -> CoreResult<Option<Arc<dyn Worker>>> {
        Ok(self.lock_state()?.workers.get(worker_id).cloned())
    }

    pub fn get_task(&self, task_id: &TaskId) -> CoreResult<Option<TaskRecord>> {
        let state = self.lock_state()?;
        Ok(state.task(task_id).ok().cloned())
    }

    pub fn workers(&self) -> CoreResult<Vec<Arc<dyn Worker>>> {
        Ok(self.lock_state()?.workers.values().cloned().collect())
    }

    /// Current self-reported state of every registered worker, keyed by id.
    pub fn worker_snapshot(&self) -> CoreResult<BTreeMap<WorkerId, WorkerState>> {
        let state = self.lock_state()?;
        state
            .workers
            .iter()
            .map(|(worker_id, worker)| Ok((worker_id.clone(), worker.state()?)))
            .collect()
    }

    pub fn tasks(&self) -> CoreResult<Vec<TaskRecord>> {
        Ok(self.lock_state()?.tasks.clone())
    }

    pub fn task_lists(&self) -> CoreResult<TaskLists> {
        Ok(self.lock_state()?.lists.clone())
    }

    pub fn pending_tasks(&self) -> CoreResult<Vec<TaskRecord>> {
        Ok(self.lock_state()?.lists.pending.clone())
    }

    pub fn running_tasks(&self) -> CoreResult<Vec<TaskRecord>> {
        Ok(self.lock_state()?.lists.running.clone())
    }

    pub fn completed_tasks(&self) -> CoreResult<Vec<TaskRecord>> {
        Ok(self.lock_state()?.lists.completed.clone())
    }

    pub fn failed_tasks(&self) -> CoreResult<Vec<TaskRecord>> {
        Ok(self.lock_state()?.lists.failed.clone())
    }

    pub fn updated_at(&self) -> CoreResult<Option<OffsetDateTime>> {
        Ok(self.lock_state()?.updated_at)
    }

    pub fn start_worker(&self, worker_id: &WorkerId) -> CoreResult<()> {
        self.administer(worker_id, "start", |worker| worker.start())
    }

    pub fn stop_worker(&self, worker_id: &WorkerId) -> CoreResult<()> {
        self.administer(worker_id, "stop", |worker| worker.stop())
    }

    pub fn restart_worker(&self, worker_id: &WorkerId) -> CoreResult<()> {
        self.administer(worker_id, "restart", |worker| worker.restart())
    }

    fn administer(
        &self,
        worker_id: &WorkerId,
        action: &str,
        apply: impl FnOnce(&dyn Worker) -> CoreResult<()>,
    ) -> CoreResult<()> {
        let worker = self.lock_state()?.worker(worker_id).inspect_err(|_| {
            tracing::warn!(worker_id = %worker_id, action, "unknown worker");
        })?;
        apply(worker.as_ref())?;
        self.sync_worker_state(worker_id)?;
        Ok(())
    }
}

fn log_store_failure(error: CoreError, operation: &str) -> CoreError {
    tracing::error!(
        operation,
        kind = ?error.kind,
        message = %error.message,
        "store write failed"
    );
    error
}
