use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use mcas_core::models::{
    CoreErrorKind, NewTask, TaskId, TaskRecord, TaskStatus, WorkerId, WorkerState, WorkerStatus,
    WorkerType,
};
use mcas_core::persistence::{JsonFileStore, TaskStore, WorkerStateStore};
use serde_json::json;
use time::macros::datetime;

fn test_storage_dir(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("mcas-{test_name}-{nanos}"))
}

fn task(id: &str) -> TaskRecord {
    NewTask::new("nightly ingest", "data_process")
        .with_id(id)
        .with_param("file_path", "/data/in.csv")
        .with_param("options", json!({ "delimiter": ";", "skip": [1, 2] }))
        .into_record(datetime!(2025-03-01 08:00:00.123456789 UTC))
        .unwrap()
}

#[test]
fn open_initializes_empty_collections() {
    let store = JsonFileStore::open(test_storage_dir("init")).unwrap();

    assert!(store.tasks_path().exists());
    assert!(store.worker_states_path().exists());
    assert!(store.list_tasks(None).unwrap().is_empty());
    assert!(store.list_worker_states().unwrap().is_empty());
}

#[test]
fn task_round_trip_with_null_timestamps() {
    let store = JsonFileStore::open(test_storage_dir("null-times")).unwrap();
    let pending = task("t1");

    store.save_task(&pending).unwrap();

    let loaded = store.get_task(&pending.task_id).unwrap().unwrap();
    assert_eq!(loaded, pending);
    assert!(loaded.start_time.is_none());
    assert!(loaded.end_time.is_none());
}

#[test]
fn task_round_trip_with_populated_timestamps() {
    let store = JsonFileStore::open(test_storage_dir("full-times")).unwrap();
    let mut failed = task("t1");
    failed
        .bind(
            &WorkerId::from("executor_001"),
            datetime!(2025-03-01 08:00:01.5 +02:00),
        )
        .unwrap();
    failed
        .fail("file not found", datetime!(2025-03-01 08:00:07.000000001 UTC))
        .unwrap();

    store.save_task(&failed).unwrap();

    let loaded = store.get_task(&failed.task_id).unwrap().unwrap();
    assert_eq!(loaded, failed);
    assert_eq!(loaded.start_time.unwrap().offset(), failed.start_time.unwrap().offset());
}

#[test]
fn upsert_replaces_in_place_and_appends_new_ids() {
    let store = JsonFileStore::open(test_storage_dir("upsert")).unwrap();
    store.save_task(&task("a")).unwrap();
    store.save_task(&task("b")).unwrap();

    let mut running = task("a");
    running
        .bind(&WorkerId::from("executor_001"), datetime!(2025-03-01 09:00:00 UTC))
        .unwrap();
    store.save_task(&running).unwrap();
    store.save_task(&task("c")).unwrap();

    let ids: Vec<String> = store
        .list_tasks(None)
        .unwrap()
        .into_iter()
        .map(|task| task.task_id.0)
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);

    let running_only = store.list_tasks(Some(TaskStatus::Running)).unwrap();
    assert_eq!(running_only.len(), 1);
    assert_eq!(running_only[0].task_id.as_str(), "a");
}

#[test]
fn delete_reports_whether_a_task_existed() {
    let store = JsonFileStore::open(test_storage_dir("delete")).unwrap();
    store.save_task(&task("a")).unwrap();

    assert!(store.delete_task(&TaskId::from("a")).unwrap());
    assert!(!store.delete_task(&TaskId::from("a")).unwrap());
    assert!(store.get_task(&TaskId::from("a")).unwrap().is_none());
}

#[test]
fn persisted_task_uses_external_field_names() {
    let store = JsonFileStore::open(test_storage_dir("format")).unwrap();
    let mut running = task("t1");
    running
        .bind(&WorkerId::from("executor_001"), datetime!(2025-03-01 09:00:00 UTC))
        .unwrap();
    store.save_task(&running).unwrap();

    let raw = std::fs::read_to_string(store.tasks_path()).unwrap();
    let document: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let entry = &document[0];
    assert_eq!(entry["type"], "data_process");
    assert_eq!(entry["executor_agent_id"], "executor_001");
    assert_eq!(entry["status"], "running");
    assert_eq!(entry["start_time"], "2025-03-01T09:00:00Z");
    assert!(entry["end_time"].is_null());
}

#[test]
fn worker_states_are_keyed_by_id() {
    let store = JsonFileStore::open(test_storage_dir("workers")).unwrap();
    let mut state = WorkerState::new(
        WorkerId::from("analyzer_001"),
        WorkerType::Analyzer,
        datetime!(2025-03-01 08:00:00 UTC),
    );
    state
        .transition(
            WorkerStatus::Running,
            0.7,
            None,
            datetime!(2025-03-01 08:00:02 UTC),
        )
        .unwrap();

    store.save_worker_state(&state).unwrap();

    assert_eq!(
        store.get_worker_state(&state.worker_id).unwrap(),
        Some(state.clone())
    );
    let raw = std::fs::read_to_string(store.worker_states_path()).unwrap();
    let document: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(document["analyzer_001"]["agent_type"], "analyzer");
    assert_eq!(document["analyzer_001"]["load"], 0.7);

    assert!(store.delete_worker_state(&state.worker_id).unwrap());
    assert!(!store.delete_worker_state(&state.worker_id).unwrap());
}

#[test]
fn malformed_task_file_is_a_parse_failure() {
    let store = JsonFileStore::open(test_storage_dir("malformed")).unwrap();
    std::fs::write(store.tasks_path(), "[{\"task_id\": ").unwrap();

    let error = store.list_tasks(None).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::ParseFailure);

    let error = store.save_task(&task("t1")).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::ParseFailure);
}

#[test]
fn records_violating_invariants_are_rejected_on_load() {
    let store = JsonFileStore::open(test_storage_dir("invariants")).unwrap();
    std::fs::write(
        store.tasks_path(),
        r#"[{
            "task_id": "t1", "name": "x", "type": "data_process", "params": {},
            "status": "completed", "executor_agent_id": "executor_001",
            "create_time": "2025-03-01T08:00:00Z", "start_time": null,
            "end_time": null, "error_msg": null
        }]"#,
    )
    .unwrap();

    let error = store.list_tasks(None).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::ParseFailure);
}

#[test]
fn stopped_worker_with_load_is_rejected_on_load() {
    let store = JsonFileStore::open(test_storage_dir("stopped-load")).unwrap();
    std::fs::write(
        store.worker_states_path(),
        r#"{"executor_001": {
            "agent_type": "executor", "status": "stopped", "load": 0.4,
            "error_msg": null, "updated_at": "2025-03-01T08:00:00Z"
        }}"#,
    )
    .unwrap();

    let error = store.list_worker_states().unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::ParseFailure);
}

#[test]
fn error_message_outside_error_status_is_rejected_on_load() {
    let store = JsonFileStore::open(test_storage_dir("idle-error-msg")).unwrap();
    std::fs::write(
        store.worker_states_path(),
        r#"{"executor_001": {
            "agent_type": "executor", "status": "idle", "load": 0.0,
            "error_msg": "stale failure", "updated_at": "2025-03-01T08:00:00Z"
        }}"#,
    )
    .unwrap();

    let error = store.list_worker_states().unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::ParseFailure);
    let error = store
        .get_worker_state(&WorkerId::from("executor_001"))
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::ParseFailure);
}

#[test]
fn worker_states_use_agent_states_file() {
    let store = JsonFileStore::open(test_storage_dir("state-file-name")).unwrap();
    assert_eq!(
        store.worker_states_path().file_name().unwrap(),
        "agent_states.json"
    );
}
