use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::models::{
    CoreError, CoreErrorKind, TaskId, TaskRecord, TaskStatus, WorkerId, WorkerState, WorkerStatus,
    WorkerType,
};
use crate::persistence::{PersistenceResult, TaskStore, WorkerStateStore};

const TASKS_FILE: &str = "tasks.json";
const WORKER_STATES_FILE: &str = "agent_states.json";

/// Two JSON documents in one directory: an ordered task array and a worker-state
/// object keyed by worker id. Every write rewrites the whole document through a
/// temp file and a rename, so a crash leaves either the old or the new version.
pub struct JsonFileStore {
    storage_dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct StoredWorkerState {
    agent_type: WorkerType,
    status: WorkerStatus,
    load: f64,
    #[serde(default)]
    error_msg: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    updated_at: OffsetDateTime,
}

type StoredWorkerStates = BTreeMap<WorkerId, StoredWorkerState>;

impl JsonFileStore {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
        }
    }

    /// Creates the directory and both documents (empty) when they do not exist yet.
    pub fn open(storage_dir: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let store = Self::new(storage_dir);
        fs::create_dir_all(&store.storage_dir)
            .map_err(|error| storage_error("open", &store.storage_dir, error))?;

        if !store.tasks_path().exists() {
            store.write_document("open", &store.tasks_path(), &Vec::<TaskRecord>::new())?;
            tracing::info!(path = %store.tasks_path().display(), "created empty task collection");
        }
        if !store.worker_states_path().exists() {
            store.write_document(
                "open",
                &store.worker_states_path(),
                &StoredWorkerStates::new(),
            )?;
            tracing::info!(
                path = %store.worker_states_path().display(),
                "created empty worker state collection"
            );
        }
        Ok(store)
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.storage_dir.join(TASKS_FILE)
    }

    pub fn worker_states_path(&self) -> PathBuf {
        self.storage_dir.join(WORKER_STATES_FILE)
    }

    fn read_tasks(&self, operation: &str) -> PersistenceResult<Vec<TaskRecord>> {
        let tasks: Vec<TaskRecord> = self
            .read_document(operation, &self.tasks_path())?
            .unwrap_or_default();
        for task in &tasks {
            task.check_invariants()?;
        }
        Ok(tasks)
    }

    fn read_worker_states(&self, operation: &str) -> PersistenceResult<StoredWorkerStates> {
        Ok(self
            .read_document(operation, &self.worker_states_path())?
            .unwrap_or_default())
    }

    fn read_document<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &Path,
    ) -> PersistenceResult<Option<T>> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(storage_error(operation, path, error)),
        };

        serde_json::from_str(&raw).map(Some).map_err(|error| {
            CoreError::new(
                CoreErrorKind::ParseFailure,
                format!(
                    "json store '{operation}' could not decode '{}': {error}",
                    path.display()
                ),
            )
        })
    }

    fn write_document<T: Serialize>(
        &self,
        operation: &str,
        path: &Path,
        document: &T,
    ) -> PersistenceResult<()> {
        let encoded = serde_json::to_vec_pretty(document).map_err(|error| {
            CoreError::new(
                CoreErrorKind::StorageFailure,
                format!("json store '{operation}' could not encode document: {error}"),
            )
        })?;

        let staging = path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&staging)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
            fs::rename(&staging, path)
        };
        write().map_err(|error| storage_error(operation, path, error))
    }
}

impl TaskStore for JsonFileStore {
    fn save_task(&self, task: &TaskRecord) -> PersistenceResult<()> {
        let mut tasks = self.read_tasks("save_task")?;
        match tasks
            .iter_mut()
            .find(|stored| stored.task_id == task.task_id)
        {
            Some(stored) => *stored = task.clone(),
            None => tasks.push(task.clone()),
        }
        self.write_document("save_task", &self.tasks_path(), &tasks)?;
        tracing::debug!(task_id = %task.task_id, status = %task.status, "task saved");
        Ok(())
    }

    fn get_task(&self, task_id: &TaskId) -> PersistenceResult<Option<TaskRecord>> {
        Ok(self
            .read_tasks("get_task")?
            .into_iter()
            .find(|task| &task.task_id == task_id))
    }

    fn list_tasks(&self, status: Option<TaskStatus>) -> PersistenceResult<Vec<TaskRecord>> {
        let mut tasks = self.read_tasks("list_tasks")?;
        if let Some(status) = status {
            tasks.retain(|task| task.status == status);
        }
        Ok(tasks)
    }

    fn delete_task(&self, task_id: &TaskId) -> PersistenceResult<bool> {
        let mut tasks = self.read_tasks("delete_task")?;
        let before = tasks.len();
        tasks.retain(|task| &task.task_id != task_id);
        if tasks.len() == before {
            return Ok(false);
        }
        self.write_document("delete_task", &self.tasks_path(), &tasks)?;
        tracing::debug!(task_id = %task_id, "task deleted");
        Ok(true)
    }
}

impl WorkerStateStore for JsonFileStore {
    fn save_worker_state(&self, state: &WorkerState) -> PersistenceResult<()> {
        let mut states = self.read_worker_states("save_worker_state")?;
        states.insert(
            state.worker_id.clone(),
            StoredWorkerState {
                agent_type: state.worker_type,
                status: state.status,
                load: state.load,
                error_msg: state.error_msg.clone(),
                updated_at: state.updated_at,
            },
        );
        self.write_document("save_worker_state", &self.worker_states_path(), &states)?;
        tracing::debug!(worker_id = %state.worker_id, status = %state.status, "worker state saved");
        Ok(())
    }

    fn get_worker_state(&self, worker_id: &WorkerId) -> PersistenceResult<Option<WorkerState>> {
        let states = self.read_worker_states("get_worker_state")?;
        states
            .get(worker_id)
            .map(|stored| restore(worker_id.clone(), stored))
            .transpose()
    }

    fn list_worker_states(&self) -> PersistenceResult<BTreeMap<WorkerId, WorkerState>> {
        self.read_worker_states("list_worker_states")?
            .iter()
            .map(|(worker_id, stored)| Ok((worker_id.clone(), restore(worker_id.clone(), stored)?)))
            .collect()
    }

    fn delete_worker_state(&self, worker_id: &WorkerId) -> PersistenceResult<bool> {
        let mut states = self.read_worker_states("delete_worker_state")?;
        if states.remove(worker_id).is_none() {
            return Ok(false);
        }
        self.write_document("delete_worker_state", &self.worker_states_path(), &states)?;
        tracing::debug!(worker_id = %worker_id, "worker state deleted");
        Ok(true)
    }
}

fn restore(worker_id: WorkerId, stored: &StoredWorkerState) -> PersistenceResult<WorkerState> {
    let state = WorkerState {
        worker_id,
        worker_type: stored.agent_type,
        status: stored.status,
        load: stored.load,
        error_msg: stored.error_msg.clone(),
        updated_at: stored.updated_at,
    };
    state.check_invariants().map_err(|error| CoreError {
        kind: CoreErrorKind::ParseFailure,
        ..error
    })?;
    Ok(state)
}

fn storage_error(operation: &str, path: &Path, error: std::io::Error) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!(
            "json store '{operation}' failed on '{}': {error}",
            path.display()
        ),
    )
}
