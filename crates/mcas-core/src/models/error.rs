use crate::models::{TaskId, WorkerId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    InvalidInput,
    NotFound,
    InvalidTransition,
    AllocationFailure,
    ExecutionFailure,
    StorageFailure,
    ParseFailure,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub task: Option<TaskId>,
    pub worker: Option<WorkerId>,
    pub kind: CoreErrorKind,
    pub message: String,
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: None,
            worker: None,
            kind,
            message: message.into(),
        }
    }

    pub fn with_task(mut self, task: &TaskId) -> Self {
        self.task = Some(task.clone());
        self
    }

    pub fn with_worker(mut self, worker: &WorkerId) -> Self {
        self.worker = Some(worker.clone());
        self
    }

    pub fn task_not_found(task: &TaskId) -> Self {
        Self::new(CoreErrorKind::NotFound, format!("unknown task id '{task}'")).with_task(task)
    }

    pub fn worker_not_found(worker: &WorkerId) -> Self {
        Self::new(
            CoreErrorKind::NotFound,
            format!("unknown worker id '{worker}'"),
        )
        .with_worker(worker)
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        Self::new(CoreErrorKind::Internal, format!("{what} mutex poisoned"))
    }
}
