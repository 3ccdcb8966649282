use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::models::{CoreError, CoreErrorKind, CoreResult};

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    Coordinator,
    Executor,
    Analyzer,
    Monitor,
}

impl WorkerType {
    pub const ALL: [WorkerType; 4] = [
        WorkerType::Coordinator,
        WorkerType::Executor,
        WorkerType::Analyzer,
        WorkerType::Monitor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerType::Coordinator => "coordinator",
            WorkerType::Executor => "executor",
            WorkerType::Analyzer => "analyzer",
            WorkerType::Monitor => "monitor",
        }
    }
}

impl Display for WorkerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerType {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        WorkerType::ALL
            .into_iter()
            .find(|worker_type| worker_type.as_str() == raw)
            .ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("unknown worker type '{raw}'"),
                )
            })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Running,
    Error,
    Stopped,
}

impl WorkerStatus {
    pub const ALL: [WorkerStatus; 4] = [
        WorkerStatus::Idle,
        WorkerStatus::Running,
        WorkerStatus::Error,
        WorkerStatus::Stopped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Running => "running",
            WorkerStatus::Error => "error",
            WorkerStatus::Stopped => "stopped",
        }
    }

    /// Idle and running workers can take new tasks.
    pub fn accepts_tasks(self) -> bool {
        matches!(self, WorkerStatus::Idle | WorkerStatus::Running)
    }

    /// Error only leaves through stop; stopped only leaves through start.
    pub fn can_transition_to(self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;
        match (self, next) {
            (_, Stopped) => true,
            (Idle, Running) | (Running, Running) => true,
            (Running, Idle) | (Running, Error) => true,
            (Stopped, Idle) => true,
            _ => false,
        }
    }
}

impl Display for WorkerStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        WorkerStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == raw)
            .ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("unknown worker status '{raw}'"),
                )
            })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub worker_id: WorkerId,
    pub worker_type: WorkerType,
    pub status: WorkerStatus,
    pub load: f64,
    #[serde(default)]
    pub error_msg: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl WorkerState {
    pub fn new(worker_id: WorkerId, worker_type: WorkerType, now: OffsetDateTime) -> Self {
        Self {
            worker_id,
            worker_type,
            status: WorkerStatus::Idle,
            load: 0.0,
            error_msg: None,
            updated_at: now,
        }
    }

    /// Applies a status change through the transition table and bumps `updated_at`.
    ///
    /// `error_msg` is kept only for the error status, and a stopped worker always
    /// reports zero load.
    pub fn transition(
        &mut self,
        next: WorkerStatus,
        load: f64,
        error_msg: Option<String>,
        now: OffsetDateTime,
    ) -> CoreResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::new(
                CoreErrorKind::InvalidTransition,
                format!(
                    "worker '{}' cannot transition from '{}' to '{}'",
                    self.worker_id, self.status, next
                ),
            )
            .with_worker(&self.worker_id));
        }
        let load = checked_load(&self.worker_id, load)?;

        self.status = next;
        self.load = if next == WorkerStatus::Stopped { 0.0 } else { load };
        self.error_msg = if next == WorkerStatus::Error {
            error_msg
        } else {
            None
        };
        self.touch(now);
        Ok(())
    }

    /// Monotonic bump: a clock that steps backwards never rewinds `updated_at`.
    pub fn touch(&mut self, now: OffsetDateTime) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    pub fn check_invariants(&self) -> CoreResult<()> {
        checked_load(&self.worker_id, self.load)?;
        if self.status == WorkerStatus::Stopped && self.load != 0.0 {
            return Err(CoreError::new(
                CoreErrorKind::ParseFailure,
                format!("stopped worker '{}' reports non-zero load", self.worker_id),
            )
            .with_worker(&self.worker_id));
        }
        if self.error_msg.is_some() && self.status != WorkerStatus::Error {
            return Err(CoreError::new(
                CoreErrorKind::ParseFailure,
                format!(
                    "worker '{}' carries an error message while '{}'",
                    self.worker_id, self.status
                ),
            )
            .with_worker(&self.worker_id));
        }
        Ok(())
    }
}

fn checked_load(worker: &WorkerId, load: f64) -> CoreResult<f64> {
    if (0.0..=1.0).contains(&load) {
        Ok(load)
    } else {
        Err(CoreError::new(
            CoreErrorKind::InvalidInput,
            format!("worker '{worker}' load {load} is outside [0.0, 1.0]"),
        )
        .with_worker(worker))
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn idle(id: &str) -> WorkerState {
        WorkerState::new(
            WorkerId::from(id),
            WorkerType::Executor,
            datetime!(2025-03-01 08:00:00 UTC),
        )
    }

    #[test]
    fn error_only_recovers_through_stop() {
        let mut state = idle("executor_001");
        let now = datetime!(2025-03-01 08:00:01 UTC);
        state.transition(WorkerStatus::Running, 0.8, None, now).unwrap();
        state
            .transition(WorkerStatus::Error, 0.0, Some("boom".into()), now)
            .unwrap();

        let error = state.transition(WorkerStatus::Idle, 0.0, None, now).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidTransition);

        state.transition(WorkerStatus::Stopped, 0.0, None, now).unwrap();
        state.transition(WorkerStatus::Idle, 0.0, None, now).unwrap();
        assert_eq!(state.status, WorkerStatus::Idle);
        assert_eq!(state.error_msg, None);
    }

    #[test]
    fn stop_forces_zero_load() {
        let mut state = idle("executor_002");
        let now = datetime!(2025-03-01 08:00:01 UTC);
        state.transition(WorkerStatus::Running, 0.8, None, now).unwrap();
        state.transition(WorkerStatus::Stopped, 0.8, None, now).unwrap();
        assert_eq!(state.load, 0.0);
        state.check_invariants().unwrap();
    }

    #[test]
    fn error_message_requires_error_status() {
        let mut state = idle("executor_001");
        state.error_msg = Some("stale failure".into());
        let error = state.check_invariants().unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::ParseFailure);

        state.status = WorkerStatus::Error;
        state.check_invariants().unwrap();
    }

    #[test]
    fn updated_at_never_moves_backwards() {
        let mut state = idle("analyzer_001");
        state.touch(datetime!(2025-03-01 09:00:00 UTC));
        state.touch(datetime!(2025-03-01 07:00:00 UTC));
        assert_eq!(state.updated_at, datetime!(2025-03-01 09:00:00 UTC));
    }

    #[test]
    fn out_of_range_load_is_rejected() {
        let mut state = idle("executor_003");
        let error = state
            .transition(
                WorkerStatus::Running,
                1.5,
                None,
                datetime!(2025-03-01 08:00:01 UTC),
            )
            .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidInput);
        assert_eq!(state.status, WorkerStatus::Idle);
    }
}
