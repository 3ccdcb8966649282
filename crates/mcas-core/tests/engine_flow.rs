use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mcas_core::config::{EngineConfig, StorageBackend};
use mcas_core::context::EngineContext;
use mcas_core::models::{CoreErrorKind, NewTask, TaskId, TaskStatus, WorkerId, WorkerStatus};
use mcas_core::orchestration::{Coordinator, TaskAllocator, spawn_heartbeat};
use mcas_core::persistence::{JsonFileStore, MemoryStore, WorkerStateStore};
use mcas_core::registry::Registry;
use mcas_core::worker::{PoolWorker, Worker};

fn test_storage_dir(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("mcas-{test_name}-{nanos}"))
}

fn json_config(test_name: &str) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.storage.path = test_storage_dir(test_name);
    config
}

fn memory_context() -> EngineContext {
    let mut config = EngineConfig::default();
    config.storage.backend = StorageBackend::Memory;
    EngineContext::init(config).unwrap()
}

fn worker_status(context: &EngineContext, id: &str) -> WorkerStatus {
    context
        .registry()
        .get_worker(&WorkerId::from(id))
        .unwrap()
        .unwrap()
        .state()
        .unwrap()
        .status
}

#[test]
fn init_registers_default_roster() {
    let context = memory_context();
    let ids: Vec<String> = context
        .registry()
        .worker_snapshot()
        .unwrap()
        .into_keys()
        .map(|id| id.0)
        .collect();

    assert_eq!(
        ids,
        vec!["analyzer_001", "coordinator_001", "executor_001", "executor_002"]
    );
}

#[test]
fn submitted_data_process_task_completes_on_an_executor() {
    let context = memory_context();

    let dispatched = context
        .coordinator()
        .submit(
            NewTask::new("ingest", "data_process")
                .with_id("t1")
                .with_param("file_path", "/data/in.csv"),
        )
        .unwrap();

    let task = &dispatched.task;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.bound_worker_id, Some(WorkerId::from("executor_001")));
    assert!(task.start_time.is_some() && task.end_time.is_some());
    assert_eq!(
        dispatched.output.as_ref().unwrap().data["processed_rows"],
        1000
    );
    assert_eq!(worker_status(&context, "executor_001"), WorkerStatus::Idle);
    assert_eq!(context.registry().completed_tasks().unwrap().len(), 1);
}

#[test]
fn notification_routes_to_coordinator_worker() {
    let context = memory_context();

    let dispatched = context
        .coordinator()
        .submit(NewTask::new("deploy finished", "notification").with_param("recipient", "ops"))
        .unwrap();

    assert_eq!(
        dispatched.task.bound_worker_id,
        Some(WorkerId::from("coordinator_001"))
    );
    assert_eq!(dispatched.task.status, TaskStatus::Completed);
}

#[test]
fn execution_failure_marks_task_failed_and_worker_error() {
    let context = memory_context();

    // Unmapped types route to executors, which have no body for them.
    let dispatched = context
        .coordinator()
        .submit(NewTask::new("purge temp", "cleanup").with_id("bad"))
        .unwrap();

    assert_eq!(dispatched.task.status, TaskStatus::Failed);
    assert!(dispatched.output.is_none());
    let bound = dispatched.task.bound_worker_id.clone().unwrap();
    assert!(dispatched.task.error_msg.as_deref().unwrap().contains("cleanup"));
    assert_eq!(worker_status(&context, bound.as_str()), WorkerStatus::Error);
    assert_eq!(context.registry().failed_tasks().unwrap().len(), 1);

    context.registry().restart_worker(&bound).unwrap();
    assert_eq!(worker_status(&context, bound.as_str()), WorkerStatus::Idle);
}

#[test]
fn allocation_failure_keeps_task_pending_until_retry() {
    let context = memory_context();
    let registry = context.registry();
    for worker in registry.workers().unwrap() {
        registry.stop_worker(worker.id()).unwrap();
    }

    let error = context
        .coordinator()
        .submit(NewTask::new("ingest", "data_process").with_id("t1"))
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::AllocationFailure);
    assert_eq!(error.task, Some(TaskId::from("t1")));
    let pending = registry.pending_tasks().unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].bound_worker_id.is_none());

    let summary = context.coordinator().retry_pending().unwrap();
    assert!(summary.dispatched.is_empty());
    assert_eq!(summary.still_pending, vec![TaskId::from("t1")]);

    registry
        .start_worker(&WorkerId::from("executor_002"))
        .unwrap();
    let summary = context.coordinator().retry_pending().unwrap();
    assert_eq!(summary.dispatched.len(), 1);
    assert_eq!(
        summary.dispatched[0].task.bound_worker_id,
        Some(WorkerId::from("executor_002"))
    );
    assert!(registry.pending_tasks().unwrap().is_empty());
}

#[test]
fn invalid_submission_is_rejected_without_mutation() {
    let context = memory_context();

    let error = context
        .coordinator()
        .submit(NewTask::new("  ", "data_process"))
        .unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::InvalidInput);
    assert!(context.registry().tasks().unwrap().is_empty());
}

#[test]
fn dispatch_to_deregistered_worker_fails_the_task() {
    let context = memory_context();
    let coordinator = context.coordinator();
    coordinator
        .create_task(NewTask::new("weekly", "analysis").with_id("r1"))
        .unwrap();
    let allocated = coordinator.allocate(&TaskId::from("r1")).unwrap();
    let bound = allocated.bound_worker_id.clone().unwrap();
    assert_eq!(bound.as_str(), "analyzer_001");

    context.registry().deregister_worker(&bound).unwrap();
    let dispatched = coordinator.dispatch(&allocated).unwrap();

    assert_eq!(dispatched.task.status, TaskStatus::Failed);
    assert!(dispatched.task.error_msg.unwrap().contains("not registered"));
}

#[test]
fn json_backed_engine_survives_restart() {
    let config = json_config("restart");

    {
        let context = EngineContext::init(config.clone()).unwrap();
        context
            .coordinator()
            .submit(NewTask::new("weekly", "analysis").with_id("r1"))
            .unwrap();
        context
            .coordinator()
            .create_task(NewTask::new("later", "data_process").with_id("p1"))
            .unwrap();
        context.shutdown().unwrap();
        assert_eq!(
            worker_status(&context, "executor_001"),
            WorkerStatus::Stopped
        );
    }

    let mut no_auto_start = config;
    no_auto_start.worker.auto_start = false;
    let context = EngineContext::init(no_auto_start).unwrap();
    let lists = context.registry().task_lists().unwrap();
    assert_eq!(lists.completed.len(), 1);
    assert_eq!(lists.pending.len(), 1);
    assert_eq!(
        lists.completed[0].bound_worker_id,
        Some(WorkerId::from("analyzer_001"))
    );
    assert_eq!(
        worker_status(&context, "executor_001"),
        WorkerStatus::Stopped
    );
}

#[test]
fn auto_start_revives_stopped_workers() {
    let config = json_config("auto-start");
    EngineContext::init(config.clone())
        .unwrap()
        .shutdown()
        .unwrap();

    let context = EngineContext::init(config).unwrap();
    for id in ["coordinator_001", "executor_001", "executor_002", "analyzer_001"] {
        assert_eq!(worker_status(&context, id), WorkerStatus::Idle);
    }
}

#[test]
fn sqlite_backed_engine_runs_submissions() {
    let mut config = json_config("sqlite-engine");
    config.storage.backend = StorageBackend::Sqlite;

    let context = EngineContext::init(config.clone()).unwrap();
    context
        .coordinator()
        .submit(NewTask::new("ingest", "data_process").with_id("s1"))
        .unwrap();
    drop(context);

    let context = EngineContext::init(config).unwrap();
    let task = context
        .registry()
        .get_task(&TaskId::from("s1"))
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawn_submit_runs_on_blocking_pool() {
    let context = memory_context();

    let handle = context
        .coordinator()
        .spawn_submit(NewTask::new("weekly", "analysis").with_param("report_type", "detail"));
    let dispatched = handle.await.unwrap().unwrap();

    assert_eq!(dispatched.task.status, TaskStatus::Completed);
    let report_path = dispatched.output.unwrap().data["report_path"].clone();
    assert_eq!(
        report_path,
        format!("./reports/{}_detail.pdf", dispatched.task.task_id)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heartbeat_syncs_live_state_until_stopped() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(Registry::new(store.clone()));
    let worker: Arc<dyn Worker> = Arc::new(PoolWorker::executor("executor_001"));
    registry.register_worker(worker.clone()).unwrap();

    // Change the live state behind the registry's back; only a sync persists it.
    worker.stop().unwrap();
    let worker_id = WorkerId::from("executor_001");
    assert_eq!(
        store.get_worker_state(&worker_id).unwrap().unwrap().status,
        WorkerStatus::Idle
    );

    let handle = spawn_heartbeat(registry.clone(), Duration::from_millis(10)).unwrap();
    while handle.beats() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let beats = handle.stop().await.unwrap();

    assert!(beats >= 2);
    assert_eq!(
        store.get_worker_state(&worker_id).unwrap().unwrap().status,
        WorkerStatus::Stopped
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heartbeat_reports_rounds_that_fail_to_persist() {
    let storage_dir = test_storage_dir("heartbeat-failing");
    let store = Arc::new(JsonFileStore::open(storage_dir.clone()).unwrap());
    let registry = Arc::new(Registry::new(store));
    let worker: Arc<dyn Worker> = Arc::new(PoolWorker::executor("executor_001"));
    registry.register_worker(worker).unwrap();

    // The storage directory turns into a plain file, so every write fails.
    std::fs::remove_dir_all(&storage_dir).unwrap();
    std::fs::write(&storage_dir, b"not a directory").unwrap();

    let handle = spawn_heartbeat(registry, Duration::from_millis(10)).unwrap();
    while handle.failures() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let error = handle.last_error().unwrap();
    let beats = handle.stop().await.unwrap();

    assert_eq!(beats, 0);
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);
    assert!(error.message.contains("executor_001"));
}

#[tokio::test]
async fn heartbeat_rejects_zero_interval() {
    let registry = Arc::new(Registry::new(Arc::new(MemoryStore::new())));
    let error = spawn_heartbeat(registry, Duration::ZERO).err().unwrap();
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);
}

#[test]
fn custom_allocator_can_be_installed_on_context() {
    let mut context = memory_context();
    let registry = Arc::clone(context.registry());
    context.set_allocator(TaskAllocator::default().with_strategy(
        mcas_core::orchestration::AllocationStrategy::TypeMatching,
    ));
    let coordinator: &Arc<Coordinator> = context.coordinator();
    assert!(Arc::ptr_eq(coordinator.registry(), &registry));

    let dispatched = coordinator
        .submit(NewTask::new("weekly", "analysis"))
        .unwrap();
    assert_eq!(
        dispatched.task.bound_worker_id,
        Some(WorkerId::from("analyzer_001"))
    );
}
