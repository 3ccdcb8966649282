use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

use crate::models::{CoreError, CoreErrorKind, NewTask, TaskId, TaskRecord};
use crate::orchestration::{OrchestrationResult, TaskAllocator};
use crate::registry::Registry;
use crate::worker::{ExecutionOutcome, TaskOutput};

/// A task after dispatch, with the worker's output when it succeeded.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Dispatched {
    pub task: TaskRecord,
    pub output: Option<TaskOutput>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RetrySummary {
    pub dispatched: Vec<Dispatched>,
    pub still_pending: Vec<TaskId>,
}

/// Drives a task from creation through allocation to execution.
///
/// Calls are synchronous and run the worker on the calling thread; the registry
/// lock is never held while a worker executes.
pub struct Coordinator {
    registry: Arc<Registry>,
    allocator: TaskAllocator,
}

impl Coordinator {
    pub fn new(registry: Arc<Registry>, allocator: TaskAllocator) -> Self {
        Self {
            registry,
            allocator,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn allocator(&self) -> &TaskAllocator {
        &self.allocator
    }

    pub fn create_task(&self, new_task: NewTask) -> OrchestrationResult<TaskRecord> {
        let record = new_task.into_record(OffsetDateTime::now_utc())?;
        self.registry.add_task(record.clone())?;
        Ok(record)
    }

    /// Binds a pending task to a worker and records the binding. An allocation
    /// failure leaves the task pending.
    pub fn allocate(&self, task_id: &TaskId) -> OrchestrationResult<TaskRecord> {
        let mut task = self
            .registry
            .get_task(task_id)?
            .ok_or_else(|| CoreError::task_not_found(task_id))?;
        let snapshot = self.registry.worker_snapshot()?;
        self.allocator.allocate(&snapshot, &mut task)?;
        self.registry.record_allocation(&task)?;
        Ok(task)
    }

    /// Hands an allocated task to its worker and records the terminal status.
    /// Execution failures end in a failed task, not an error.
    pub fn dispatch(&self, task: &TaskRecord) -> OrchestrationResult<Dispatched> {
        let Some(worker_id) = task.bound_worker_id.as_ref() else {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("task '{}' has not been allocated", task.task_id),
            )
            .with_task(&task.task_id));
        };

        let outcome = match self.registry.get_worker(worker_id)? {
            Some(worker) => match worker.receive(task) {
                Ok(()) => {
                    let outcome = worker.execute(task);
                    if let Err(error) = self.registry.sync_worker_state(worker_id) {
                        tracing::error!(
                            worker_id = %worker_id,
                            kind = ?error.kind,
                            message = %error.message,
                            "failed to sync worker state after execution"
                        );
                    }
                    outcome
                }
                Err(error) => ExecutionOutcome::Failed(error.message),
            },
            None => ExecutionOutcome::Failed(format!("worker '{worker_id}' is not registered")),
        };

        let finished = self.registry.finish_task(&task.task_id, &outcome)?;
        let output = match outcome {
            ExecutionOutcome::Succeeded(output) => Some(output),
            ExecutionOutcome::Failed(_) => None,
        };
        Ok(Dispatched {
            task: finished,
            output,
        })
    }

    /// Create, allocate and dispatch in one call.
    pub fn submit(&self, new_task: NewTask) -> OrchestrationResult<Dispatched> {
        let created = self.create_task(new_task)?;
        let allocated = self.allocate(&created.task_id)?;
        self.dispatch(&allocated)
    }

    /// Re-attempts every pending task in insertion order. Tasks that still cannot
    /// be allocated stay pending and are reported back.
    pub fn retry_pending(&self) -> OrchestrationResult<RetrySummary> {
        let mut summary = RetrySummary::default();
        for pending in self.registry.pending_tasks()? {
            match self.allocate(&pending.task_id) {
                Ok(allocated) => summary.dispatched.push(self.dispatch(&allocated)?),
                Err(error) if error.kind == CoreErrorKind::AllocationFailure => {
                    summary.still_pending.push(pending.task_id);
                }
                Err(error) => return Err(error),
            }
        }
        tracing::info!(
            dispatched = summary.dispatched.len(),
            still_pending = summary.still_pending.len(),
            "pending tasks retried"
        );
        Ok(summary)
    }

    /// Runs [`Coordinator::submit`] on the blocking pool. There is no timeout: a
    /// handler that never returns keeps its worker running.
    pub fn spawn_submit(
        self: &Arc<Self>,
        new_task: NewTask,
    ) -> JoinHandle<OrchestrationResult<Dispatched>> {
        let coordinator = Arc::clone(self);
        tokio::task::spawn_blocking(move || coordinator.submit(new_task))
    }
}
