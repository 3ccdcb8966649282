use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::models::{
    CoreError, CoreErrorKind, TaskRecord, TaskStatus, WorkerId, WorkerState, WorkerStatus,
    WorkerType,
};
use crate::orchestration::{AllocationStrategy, OrchestrationResult};

pub const DEFAULT_LOAD_THRESHOLD: f64 = 0.8;

const DEFAULT_MAPPING_KEY: &str = "default";

/// Task type to the worker types allowed to run it. The `default` entry covers
/// every type without an entry of its own.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeMapping(BTreeMap<String, Vec<WorkerType>>);

impl Default for TypeMapping {
    fn default() -> Self {
        Self::from_entries([
            ("data_process", vec![WorkerType::Executor]),
            ("analysis", vec![WorkerType::Analyzer]),
            ("monitor", vec![WorkerType::Monitor]),
            ("notification", vec![WorkerType::Coordinator]),
            (DEFAULT_MAPPING_KEY, vec![WorkerType::Executor]),
        ])
    }
}

impl TypeMapping {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = (&'a str, Vec<WorkerType>)>) -> Self {
        Self(
            entries
                .into_iter()
                .map(|(task_type, worker_types)| (task_type.to_string(), worker_types))
                .collect(),
        )
    }

    pub fn insert(&mut self, task_type: impl Into<String>, worker_types: Vec<WorkerType>) {
        self.0.insert(task_type.into(), worker_types);
    }

    /// Worker types for `task_type`, falling back to the `default` entry.
    pub fn worker_types_for(&self, task_type: &str) -> &[WorkerType] {
        self.0
            .get(task_type)
            .or_else(|| self.0.get(DEFAULT_MAPPING_KEY))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Caller-supplied selection over the eligible workers.
///
/// Returning `None` defers to the lowest-load choice. Returning an id that is not
/// in `eligible` fails the allocation.
pub trait SelectionRule: Send + Sync {
    fn select(
        &self,
        eligible: &BTreeMap<WorkerId, WorkerState>,
        task: &TaskRecord,
    ) -> Option<WorkerId>;
}

pub struct LowestLoadRule;

impl SelectionRule for LowestLoadRule {
    fn select(
        &self,
        eligible: &BTreeMap<WorkerId, WorkerState>,
        _task: &TaskRecord,
    ) -> Option<WorkerId> {
        eligible
            .values()
            .min_by(|left, right| left.load.total_cmp(&right.load))
            .map(|state| state.worker_id.clone())
    }
}

/// Binds pending tasks to workers. Works on a snapshot of worker states and
/// never mutates them.
#[derive(Clone)]
pub struct TaskAllocator {
    load_threshold: f64,
    type_mapping: TypeMapping,
    strategy: AllocationStrategy,
    rule: Option<Arc<dyn SelectionRule>>,
}

impl Default for TaskAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_LOAD_THRESHOLD, TypeMapping::default())
    }
}

impl TaskAllocator {
    pub fn new(load_threshold: f64, type_mapping: TypeMapping) -> Self {
        Self {
            load_threshold,
            type_mapping,
            strategy: AllocationStrategy::Greedy,
            rule: None,
        }
    }

    pub fn with_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Installs a custom rule and switches to the custom strategy.
    pub fn with_rule(mut self, rule: Arc<dyn SelectionRule>) -> Self {
        self.strategy = AllocationStrategy::Custom;
        self.rule = Some(rule);
        self
    }

    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    pub fn load_threshold(&self) -> f64 {
        self.load_threshold
    }

    pub fn type_mapping(&self) -> &TypeMapping {
        &self.type_mapping
    }

    /// Picks a worker for `task` with the configured strategy and binds the task
    /// to it. On failure the task is left untouched.
    pub fn allocate(
        &self,
        snapshot: &BTreeMap<WorkerId, WorkerState>,
        task: &mut TaskRecord,
    ) -> OrchestrationResult<WorkerId> {
        let worker_id = match self.strategy {
            AllocationStrategy::Greedy => self.greedy(snapshot, task),
            AllocationStrategy::TypeMatching => self.type_matching(snapshot, task),
            AllocationStrategy::Custom => self.custom(snapshot, task),
        }?;
        task.bind(&worker_id, OffsetDateTime::now_utc())?;
        tracing::info!(
            task_id = %task.task_id,
            task_type = %task.task_type,
            worker_id = %worker_id,
            strategy = ?self.strategy,
            "task bound to worker"
        );
        Ok(worker_id)
    }

    /// Lowest load among eligible workers, idle before running on a tie.
    pub fn greedy(
        &self,
        snapshot: &BTreeMap<WorkerId, WorkerState>,
        task: &TaskRecord,
    ) -> OrchestrationResult<WorkerId> {
        ensure_allocatable(snapshot, task)?;
        let candidates = self.eligible(snapshot, task);
        candidates
            .values()
            .min_by(|left, right| greedy_order(left, right))
            .map(|state| state.worker_id.clone())
            .ok_or_else(|| no_eligible_worker(task))
    }

    /// Lowest load among live workers of a mapped type, ignoring the threshold.
    /// Falls back to [`TaskAllocator::greedy`] when no such worker exists.
    pub fn type_matching(
        &self,
        snapshot: &BTreeMap<WorkerId, WorkerState>,
        task: &TaskRecord,
    ) -> OrchestrationResult<WorkerId> {
        ensure_allocatable(snapshot, task)?;
        let mapped = self.type_mapping.worker_types_for(&task.task_type);
        let matched = snapshot
            .values()
            .filter(|state| state.status.accepts_tasks() && mapped.contains(&state.worker_type))
            .min_by(|left, right| left.load.total_cmp(&right.load));

        match matched {
            Some(state) => Ok(state.worker_id.clone()),
            None => {
                tracing::debug!(task_id = %task.task_id, "no type match, falling back to greedy");
                self.greedy(snapshot, task)
            }
        }
    }

    pub fn custom(
        &self,
        snapshot: &BTreeMap<WorkerId, WorkerState>,
        task: &TaskRecord,
    ) -> OrchestrationResult<WorkerId> {
        ensure_allocatable(snapshot, task)?;
        let candidates = self.eligible(snapshot, task);
        if candidates.is_empty() {
            return Err(no_eligible_worker(task));
        }

        let chosen = self
            .rule
            .as_ref()
            .and_then(|rule| rule.select(&candidates, task))
            .or_else(|| LowestLoadRule.select(&candidates, task))
            .ok_or_else(|| no_eligible_worker(task))?;

        if !candidates.contains_key(&chosen) {
            return Err(CoreError::new(
                CoreErrorKind::AllocationFailure,
                format!(
                    "selection rule chose worker '{chosen}', which is not eligible for task '{}'",
                    task.task_id
                ),
            )
            .with_task(&task.task_id)
            .with_worker(&chosen));
        }
        Ok(chosen)
    }

    /// Live workers of a mapped type below the load threshold. When none qualify,
    /// every live worker regardless of type and load.
    pub fn eligible(
        &self,
        snapshot: &BTreeMap<WorkerId, WorkerState>,
        task: &TaskRecord,
    ) -> BTreeMap<WorkerId, WorkerState> {
        let mapped = self.type_mapping.worker_types_for(&task.task_type);
        let eligible = live_workers(snapshot, |state| {
            state.load < self.load_threshold && mapped.contains(&state.worker_type)
        });
        if !eligible.is_empty() {
            return eligible;
        }

        tracing::warn!(
            task_id = %task.task_id,
            task_type = %task.task_type,
            "no eligible worker, falling back to any live worker"
        );
        live_workers(snapshot, |_| true)
    }
}

fn live_workers(
    snapshot: &BTreeMap<WorkerId, WorkerState>,
    predicate: impl Fn(&WorkerState) -> bool,
) -> BTreeMap<WorkerId, WorkerState> {
    snapshot
        .iter()
        .filter(|(_, state)| state.status.accepts_tasks() && predicate(state))
        .map(|(worker_id, state)| (worker_id.clone(), state.clone()))
        .collect()
}

fn greedy_order(left: &WorkerState, right: &WorkerState) -> Ordering {
    let busy = |state: &WorkerState| state.status != WorkerStatus::Idle;
    left.load
        .total_cmp(&right.load)
        .then_with(|| busy(left).cmp(&busy(right)))
}

fn ensure_allocatable(
    snapshot: &BTreeMap<WorkerId, WorkerState>,
    task: &TaskRecord,
) -> OrchestrationResult<()> {
    if task.status != TaskStatus::Pending {
        return Err(CoreError::new(
            CoreErrorKind::InvalidTransition,
            format!(
                "task '{}' is '{}' and cannot be allocated",
                task.task_id, task.status
            ),
        )
        .with_task(&task.task_id));
    }
    if snapshot.is_empty() {
        tracing::warn!(task_id = %task.task_id, "allocation failed: no worker registered");
        return Err(CoreError::new(
            CoreErrorKind::AllocationFailure,
            "no worker registered",
        )
        .with_task(&task.task_id));
    }
    Ok(())
}

fn no_eligible_worker(task: &TaskRecord) -> CoreError {
    tracing::warn!(task_id = %task.task_id, "allocation failed: no eligible worker");
    CoreError::new(
        CoreErrorKind::AllocationFailure,
        "no eligible/available worker",
    )
    .with_task(&task.task_id)
}
