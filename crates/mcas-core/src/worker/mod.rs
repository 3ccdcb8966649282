pub mod handlers;

pub use handlers::{AnalyzerHandler, ExecutorHandler, NotificationHandler};

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use time::OffsetDateTime;

use crate::models::{
    CoreError, CoreErrorKind, CoreResult, TaskRecord, WorkerId, WorkerState, WorkerStatus,
    WorkerType,
};

/// Result a task body hands back on success.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskOutput {
    pub message: String,
    pub data: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionOutcome {
    Succeeded(TaskOutput),
    Failed(String),
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Succeeded(_))
    }
}

/// The body of a worker role: what actually happens when a task runs.
pub trait TaskHandler: Send + Sync {
    fn worker_type(&self) -> WorkerType;

    /// Load the worker reports while this handler is running a task.
    fn busy_load(&self) -> f64;

    fn handle(&self, task: &TaskRecord) -> CoreResult<TaskOutput>;
}

/// A unit that reports its own state, receives tasks and executes them.
pub trait Worker: Send + Sync {
    fn id(&self) -> &WorkerId;

    fn worker_type(&self) -> WorkerType;

    fn state(&self) -> CoreResult<WorkerState>;

    /// stopped -> idle. Starting an idle worker is a no-op; error needs a restart.
    fn start(&self) -> CoreResult<()>;

    /// Any state -> stopped, load reset to zero.
    fn stop(&self) -> CoreResult<()>;

    fn restart(&self) -> CoreResult<()> {
        self.stop()?;
        self.start()
    }

    /// Accepts a task assignment ahead of execution.
    fn receive(&self, task: &TaskRecord) -> CoreResult<()>;

    /// Runs the task. Failures, panics included, come back as `ExecutionOutcome::Failed`
    /// and leave the worker in `error`.
    fn execute(&self, task: &TaskRecord) -> ExecutionOutcome;

    /// Replaces the live state with a persisted snapshot of the same worker.
    fn overlay_state(&self, stored: WorkerState) -> CoreResult<()>;
}

pub struct PoolWorker {
    id: WorkerId,
    handler: Box<dyn TaskHandler>,
    state: Mutex<WorkerState>,
}

impl PoolWorker {
    pub fn new(id: impl Into<String>, handler: Box<dyn TaskHandler>) -> Self {
        let id = WorkerId(id.into());
        let state = WorkerState::new(id.clone(), handler.worker_type(), OffsetDateTime::now_utc());
        Self {
            id,
            handler,
            state: Mutex::new(state),
        }
    }

    pub fn executor(id: impl Into<String>) -> Self {
        Self::new(id, Box::new(ExecutorHandler))
    }

    pub fn analyzer(id: impl Into<String>) -> Self {
        Self::new(id, Box::new(AnalyzerHandler))
    }

    pub fn coordinator(id: impl Into<String>) -> Self {
        Self::new(id, Box::new(NotificationHandler))
    }

    fn lock_state(&self) -> CoreResult<MutexGuard<'_, WorkerState>> {
        self.state
            .lock()
            .map_err(|_| CoreError::poisoned("worker state").with_worker(&self.id))
    }

    fn settle(&self, next: WorkerStatus, error_msg: Option<String>) {
        let settled = self.lock_state().and_then(|mut state| {
            // A stop issued while the task was running wins over the result.
            if state.status != WorkerStatus::Running {
                return Ok(());
            }
            state.transition(next, 0.0, error_msg, OffsetDateTime::now_utc())
        });
        if let Err(error) = settled {
            tracing::error!(
                worker_id = %self.id,
                kind = ?error.kind,
                message = %error.message,
                "failed to settle worker state after execution"
            );
        }
    }
}

impl Worker for PoolWorker {
    fn id(&self) -> &WorkerId {
        &self.id
    }

    fn worker_type(&self) -> WorkerType {
        self.handler.worker_type()
    }

    fn state(&self) -> CoreResult<WorkerState> {
        Ok(self.lock_state()?.clone())
    }

    fn start(&self) -> CoreResult<()> {
        let mut state = self.lock_state()?;
        if state.status == WorkerStatus::Idle {
            return Ok(());
        }
        state.transition(WorkerStatus::Idle, 0.0, None, OffsetDateTime::now_utc())?;
        tracing::info!(worker_id = %self.id, "worker started");
        Ok(())
    }

    fn stop(&self) -> CoreResult<()> {
        let mut state = self.lock_state()?;
        state.transition(WorkerStatus::Stopped, 0.0, None, OffsetDateTime::now_utc())?;
        tracing::info!(worker_id = %self.id, "worker stopped");
        Ok(())
    }

    fn receive(&self, task: &TaskRecord) -> CoreResult<()> {
        let status = self.lock_state()?.status;
        if !status.accepts_tasks() {
            return Err(CoreError::new(
                CoreErrorKind::ExecutionFailure,
                format!("worker '{}' is {status} and does not accept tasks", self.id),
            )
            .with_worker(&self.id)
            .with_task(&task.task_id));
        }
        tracing::info!(
            worker_id = %self.id,
            task_id = %task.task_id,
            task_type = %task.task_type,
            "task assignment received"
        );
        Ok(())
    }

    fn execute(&self, task: &TaskRecord) -> ExecutionOutcome {
        let busy_load = self.handler.busy_load();
        let started = self.lock_state().and_then(|mut state| {
            if !state.status.accepts_tasks() {
                return Err(CoreError::new(
                    CoreErrorKind::ExecutionFailure,
                    format!("worker '{}' is {} and cannot execute tasks", self.id, state.status),
                ));
            }
            state.transition(
                WorkerStatus::Running,
                busy_load,
                None,
                OffsetDateTime::now_utc(),
            )
        });
        if let Err(error) = started {
            tracing::warn!(
                worker_id = %self.id,
                task_id = %task.task_id,
                message = %error.message,
                "execution refused"
            );
            return ExecutionOutcome::Failed(error.message);
        }

        tracing::info!(worker_id = %self.id, task_id = %task.task_id, "task execution started");
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(task)))
            .unwrap_or_else(|payload| {
                Err(CoreError::new(
                    CoreErrorKind::ExecutionFailure,
                    format!("task handler panicked: {}", panic_message(payload.as_ref())),
                ))
            });

        match result {
            Ok(output) => {
                self.settle(WorkerStatus::Idle, None);
                tracing::info!(
                    worker_id = %self.id,
                    task_id = %task.task_id,
                    message = %output.message,
                    "task execution finished"
                );
                ExecutionOutcome::Succeeded(output)
            }
            Err(error) => {
                self.settle(WorkerStatus::Error, Some(error.message.clone()));
                tracing::error!(
                    worker_id = %self.id,
                    task_id = %task.task_id,
                    message = %error.message,
                    "task execution failed"
                );
                ExecutionOutcome::Failed(error.message)
            }
        }
    }

    fn overlay_state(&self, stored: WorkerState) -> CoreResult<()> {
        if stored.worker_id != self.id || stored.worker_type != self.worker_type() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!(
                    "stored state for '{}' ({}) does not describe worker '{}' ({})",
                    stored.worker_id,
                    stored.worker_type,
                    self.id,
                    self.worker_type()
                ),
            )
            .with_worker(&self.id));
        }
        stored.check_invariants()?;

        let mut state = self.lock_state()?;
        let floor = state.updated_at;
        *state = stored;
        state.touch(floor);
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
