use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use mcas_core::config::EngineConfig;
use mcas_core::context::EngineContext;
use mcas_core::logging::init_tracing;
use mcas_core::models::{
    CoreError, CoreErrorKind, CoreResult, NewTask, TaskId, TaskStatus, WorkerId,
};
use serde::Serialize;

const DEFAULT_CONFIG_PATH: &str = "./mcas.json";
const CONFIG_ENV: &str = "MCAS_CONFIG";

const USAGE: &str = "\
usage: mcas [--config <path>] <command>

commands:
  workers                              list workers and their state
  tasks [pending|running|completed|failed]
                                       list tasks, optionally by status
  submit <name> <type> [key=value...]  create, allocate and run a task
  start|stop|restart <worker_id>       control a worker
  delete-task <task_id>                remove a task
  retry                                re-attempt every pending task
  heartbeat <ticks>                    sync worker states <ticks> times";

#[derive(Debug, PartialEq)]
enum Command {
    Workers,
    Tasks(Option<TaskStatus>),
    Submit(NewTask),
    Start(WorkerId),
    Stop(WorkerId),
    Restart(WorkerId),
    DeleteTask(TaskId),
    Retry,
    Heartbeat(u64),
}

#[derive(Debug, PartialEq)]
struct Invocation {
    config_path: PathBuf,
    command: Command,
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = match parse_args(&args) {
        Ok(invocation) => invocation,
        Err(error) => {
            eprintln!("{}\n\n{USAGE}", error.message);
            return ExitCode::from(2);
        }
    };

    match run(invocation) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(kind = ?error.kind, message = %error.message, "command failed");
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run(invocation: Invocation) -> CoreResult<()> {
    let config = EngineConfig::load(&invocation.config_path)?;
    let _logging = init_tracing(&config.log)?;
    let context = EngineContext::init(config)?;
    let registry = context.registry();

    match invocation.command {
        Command::Workers => print_json(&registry.worker_snapshot()?),
        Command::Tasks(None) => print_json(&registry.task_lists()?),
        Command::Tasks(Some(status)) => {
            let tasks = match status {
                TaskStatus::Pending => registry.pending_tasks()?,
                TaskStatus::Running => registry.running_tasks()?,
                TaskStatus::Completed => registry.completed_tasks()?,
                TaskStatus::Failed => registry.failed_tasks()?,
            };
            print_json(&tasks)
        }
        Command::Submit(new_task) => print_json(&context.coordinator().submit(new_task)?),
        Command::Start(worker_id) => {
            registry.start_worker(&worker_id)?;
            print_json(&registry.get_worker(&worker_id)?.map(|w| w.state()).transpose()?)
        }
        Command::Stop(worker_id) => {
            registry.stop_worker(&worker_id)?;
            print_json(&registry.get_worker(&worker_id)?.map(|w| w.state()).transpose()?)
        }
        Command::Restart(worker_id) => {
            registry.restart_worker(&worker_id)?;
            print_json(&registry.get_worker(&worker_id)?.map(|w| w.state()).transpose()?)
        }
        Command::DeleteTask(task_id) => {
            registry.delete_task(&task_id)?;
            print_json(&serde_json::json!({ "deleted": task_id }))
        }
        Command::Retry => print_json(&context.coordinator().retry_pending()?),
        Command::Heartbeat(ticks) => run_heartbeat(&context, ticks),
    }
}

fn run_heartbeat(context: &EngineContext, ticks: u64) -> CoreResult<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("failed to create tokio runtime: {error}"),
            )
        })?;

    let poll = context
        .config()
        .worker
        .heartbeat_interval()
        .min(Duration::from_millis(200));
    let beats = runtime.block_on(async {
        let handle = context.spawn_heartbeat()?;
        while handle.beats() < ticks {
            if let Some(error) = handle.last_error() {
                handle.stop().await?;
                return Err(error);
            }
            tokio::time::sleep(poll).await;
        }
        handle.stop().await
    })?;
    print_json(&serde_json::json!({ "beats": beats }))
}

fn print_json(value: &impl Serialize) -> CoreResult<()> {
    let rendered = serde_json::to_string_pretty(value).map_err(|error| {
        CoreError::new(
            CoreErrorKind::Internal,
            format!("failed to render output: {error}"),
        )
    })?;
    println!("{rendered}");
    Ok(())
}

fn parse_args(args: &[String]) -> CoreResult<Invocation> {
    let mut rest = args;
    let mut config_path = std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if let [flag, path, tail @ ..] = rest {
        if flag == "--config" {
            config_path = PathBuf::from(path);
            rest = tail;
        }
    }

    let command = match rest {
        [command] if command == "workers" => Command::Workers,
        [command] if command == "tasks" => Command::Tasks(None),
        [command, status] if command == "tasks" => Command::Tasks(Some(status.parse()?)),
        [command, name, task_type, params @ ..] if command == "submit" => {
            let mut new_task = NewTask::new(name.as_str(), task_type.as_str());
            for param in params {
                let (key, value) = parse_param(param)?;
                new_task = new_task.with_param(key, value);
            }
            Command::Submit(new_task)
        }
        [command, id] if command == "start" => Command::Start(WorkerId(id.clone())),
        [command, id] if command == "stop" => Command::Stop(WorkerId(id.clone())),
        [command, id] if command == "restart" => Command::Restart(WorkerId(id.clone())),
        [command, id] if command == "delete-task" => Command::DeleteTask(TaskId(id.clone())),
        [command] if command == "retry" => Command::Retry,
        [command, ticks] if command == "heartbeat" => {
            let ticks = ticks.parse::<u64>().map_err(|_| {
                usage_error(format!("heartbeat ticks must be a positive integer, got '{ticks}'"))
            })?;
            Command::Heartbeat(ticks)
        }
        [] => return Err(usage_error("missing command")),
        [command, ..] => return Err(usage_error(format!("unrecognized command '{command}'"))),
    };

    Ok(Invocation {
        config_path,
        command,
    })
}

/// `key=value`, where a value that parses as JSON is kept typed.
fn parse_param(raw: &str) -> CoreResult<(String, serde_json::Value)> {
    let Some((key, value)) = raw.split_once('=').filter(|(key, _)| !key.is_empty()) else {
        return Err(usage_error(format!("expected key=value, got '{raw}'")));
    };
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn usage_error(message: impl Into<String>) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidInput, message)
}
