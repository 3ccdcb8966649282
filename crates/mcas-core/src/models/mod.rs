pub mod error;
pub mod task;
pub mod worker;

pub use error::{CoreError, CoreErrorKind, CoreResult};
pub use task::{NewTask, TaskId, TaskParams, TaskRecord, TaskStatus};
pub use worker::{WorkerId, WorkerState, WorkerStatus, WorkerType};
