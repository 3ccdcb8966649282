//! Built-in task bodies for the default worker roles. They stand in for real
//! business logic and only shape a result from the task parameters.

use serde_json::json;

use crate::models::{CoreError, CoreErrorKind, CoreResult, TaskRecord, WorkerType};
use crate::worker::{TaskHandler, TaskOutput};

const EXECUTOR_BUSY_LOAD: f64 = 0.8;
const ANALYZER_BUSY_LOAD: f64 = 0.7;
const COORDINATOR_BUSY_LOAD: f64 = 0.5;

/// Data processing and metric computation.
pub struct ExecutorHandler;

impl TaskHandler for ExecutorHandler {
    fn worker_type(&self) -> WorkerType {
        WorkerType::Executor
    }

    fn busy_load(&self) -> f64 {
        EXECUTOR_BUSY_LOAD
    }

    fn handle(&self, task: &TaskRecord) -> CoreResult<TaskOutput> {
        match task.task_type.as_str() {
            "data_process" => {
                let file_path = string_param(task, "file_path").unwrap_or_default();
                tracing::debug!(task_id = %task.task_id, file_path, "processing data file");
                Ok(TaskOutput {
                    message: format!("data processing finished: {file_path}"),
                    data: json!({ "file_path": file_path, "processed_rows": 1000 }),
                })
            }
            "analysis" => {
                let metric = string_param(task, "metric").unwrap_or("sum");
                tracing::debug!(task_id = %task.task_id, metric, "computing metric");
                Ok(TaskOutput {
                    message: format!("data analysis finished, metric: {metric}"),
                    data: json!({ "metric": metric, "result": 9527 }),
                })
            }
            other => Err(unsupported(task, other, WorkerType::Executor)),
        }
    }
}

/// Report generation. Accepts any task type and reads `report_type`.
pub struct AnalyzerHandler;

impl TaskHandler for AnalyzerHandler {
    fn worker_type(&self) -> WorkerType {
        WorkerType::Analyzer
    }

    fn busy_load(&self) -> f64 {
        ANALYZER_BUSY_LOAD
    }

    fn handle(&self, task: &TaskRecord) -> CoreResult<TaskOutput> {
        let report_type = string_param(task, "report_type").unwrap_or("summary");
        let report_path = format!("./reports/{}_{report_type}.pdf", task.task_id);
        Ok(TaskOutput {
            message: format!("analysis report generated: {report_type}"),
            data: json!({ "report_type": report_type, "report_path": report_path }),
        })
    }
}

/// Coordinator-role body: delivers notification tasks as log events.
pub struct NotificationHandler;

impl TaskHandler for NotificationHandler {
    fn worker_type(&self) -> WorkerType {
        WorkerType::Coordinator
    }

    fn busy_load(&self) -> f64 {
        COORDINATOR_BUSY_LOAD
    }

    fn handle(&self, task: &TaskRecord) -> CoreResult<TaskOutput> {
        if task.task_type != "notification" {
            return Err(unsupported(task, &task.task_type, WorkerType::Coordinator));
        }
        let recipient = string_param(task, "recipient").unwrap_or("all");
        let message = string_param(task, "message").unwrap_or(task.name.as_str());
        tracing::info!(task_id = %task.task_id, recipient, message, "notification sent");
        Ok(TaskOutput {
            message: format!("notification delivered to {recipient}"),
            data: json!({ "recipient": recipient, "message": message }),
        })
    }
}

fn string_param<'a>(task: &'a TaskRecord, key: &str) -> Option<&'a str> {
    task.params.get(key).and_then(serde_json::Value::as_str)
}

fn unsupported(task: &TaskRecord, task_type: &str, role: WorkerType) -> CoreError {
    CoreError::new(
        CoreErrorKind::ExecutionFailure,
        format!("{role} worker does not support task type '{task_type}'"),
    )
    .with_task(&task.task_id)
}
