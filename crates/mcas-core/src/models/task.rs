use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::models::{CoreError, CoreErrorKind, CoreResult, WorkerId};

/// Opaque task payload; only the executing worker interprets it.
pub type TaskParams = serde_json::Map<String, serde_json::Value>;

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Forward-only lifecycle: pending -> running -> {completed, failed}.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == raw)
            .ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("unknown task status '{raw}'"),
                )
            })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub params: TaskParams,
    pub status: TaskStatus,
    #[serde(rename = "executor_agent_id", default)]
    pub bound_worker_id: Option<WorkerId>,
    #[serde(with = "time::serde::rfc3339")]
    pub create_time: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub error_msg: Option<String>,
}

impl TaskRecord {
    /// Binds the task to a worker; only a pending task can be bound.
    pub fn bind(&mut self, worker: &WorkerId, at: OffsetDateTime) -> CoreResult<()> {
        self.ensure_transition(TaskStatus::Running)?;
        self.bound_worker_id = Some(worker.clone());
        self.status = TaskStatus::Running;
        self.start_time = Some(at);
        Ok(())
    }

    pub fn complete(&mut self, at: OffsetDateTime) -> CoreResult<()> {
        self.ensure_transition(TaskStatus::Completed)?;
        self.status = TaskStatus::Completed;
        self.end_time = Some(at);
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>, at: OffsetDateTime) -> CoreResult<()> {
        self.ensure_transition(TaskStatus::Failed)?;
        self.status = TaskStatus::Failed;
        self.error_msg = Some(message.into());
        self.end_time = Some(at);
        Ok(())
    }

    /// Moves the task to `next`. Returns `false` when the task already has that status.
    pub fn apply_status(&mut self, next: TaskStatus, at: OffsetDateTime) -> CoreResult<bool> {
        if self.status == next {
            return Ok(false);
        }
        self.ensure_transition(next)?;

        self.status = next;
        match next {
            TaskStatus::Running => {
                self.start_time.get_or_insert(at);
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                self.start_time.get_or_insert(at);
                self.end_time = Some(at);
            }
            TaskStatus::Pending => {}
        }
        Ok(true)
    }

    /// Checks the cross-field invariants a decoded record must satisfy.
    pub fn check_invariants(&self) -> CoreResult<()> {
        let violation = if self.end_time.is_some() != self.status.is_terminal() {
            Some("end_time must be set exactly when the task is terminal")
        } else if self.bound_worker_id.is_some() && self.status == TaskStatus::Pending {
            Some("a pending task cannot be bound to a worker")
        } else if self.error_msg.is_some() && self.status != TaskStatus::Failed {
            Some("error_msg is only allowed on failed tasks")
        } else {
            None
        };

        match violation {
            Some(message) => Err(CoreError::new(
                CoreErrorKind::ParseFailure,
                format!("task '{}': {message}", self.task_id),
            )
            .with_task(&self.task_id)),
            None => Ok(()),
        }
    }

    fn ensure_transition(&self, next: TaskStatus) -> CoreResult<()> {
        if self.status.can_transition_to(next) {
            return Ok(());
        }
        Err(CoreError::new(
            CoreErrorKind::InvalidTransition,
            format!(
                "task '{}' cannot transition from '{}' to '{}'",
                self.task_id, self.status, next
            ),
        )
        .with_task(&self.task_id))
    }
}

/// Caller input for task creation, validated before anything is stored.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub task_id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub params: TaskParams,
}

impl NewTask {
    pub fn new(name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            task_id: None,
            name: name.into(),
            task_type: task_type.into(),
            params: TaskParams::new(),
        }
    }

    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_param(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn into_record(self, now: OffsetDateTime) -> CoreResult<TaskRecord> {
        let task_id = match self.task_id {
            Some(raw) if raw.trim().is_empty() => {
                return Err(invalid_input("task id must not be blank"));
            }
            Some(raw) => TaskId(raw),
            None => TaskId::generate(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid_input("task name must not be blank").with_task(&task_id));
        }
        if self.task_type.trim().is_empty() {
            return Err(invalid_input("task type must not be blank").with_task(&task_id));
        }

        Ok(TaskRecord {
            task_id,
            name: self.name,
            task_type: self.task_type,
            params: self.params,
            status: TaskStatus::Pending,
            bound_worker_id: None,
            create_time: now,
            start_time: None,
            end_time: None,
            error_msg: None,
        })
    }
}

fn invalid_input(message: &str) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidInput, message)
}
