pub mod allocator;
pub mod coordinator;
pub mod heartbeat;

pub use allocator::{
    DEFAULT_LOAD_THRESHOLD, LowestLoadRule, SelectionRule, TaskAllocator, TypeMapping,
};
pub use coordinator::{Coordinator, Dispatched, RetrySummary};
pub use heartbeat::{HeartbeatHandle, spawn_heartbeat};

use serde::{Deserialize, Serialize};

use crate::models::CoreError;

pub type OrchestrationResult<T> = Result<T, CoreError>;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    #[default]
    Greedy,
    TypeMatching,
    Custom,
}
