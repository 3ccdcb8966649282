use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::models::{
    CoreError, CoreErrorKind, TaskId, TaskParams, TaskRecord, TaskStatus, WorkerId, WorkerState,
    WorkerStatus, WorkerType,
};
use crate::persistence::{MigrationStore, PersistenceResult, TaskStore, WorkerStateStore};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "mcas_schema_migrations";

const TASK_COLUMNS: &str = "task_id, name, task_type, params_json, status, executor_agent_id, \
                            create_time, start_time, end_time, error_msg";

/// Indexed backend with the same contract as the JSON documents. Tasks keep their
/// first-insert position through an autoincrement sequence column.
pub struct SqliteStore {
    database_path: PathBuf,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl TaskStore for SqliteStore {
    fn save_task(&self, task: &TaskRecord) -> PersistenceResult<()> {
        self.with_connection("save_task", |connection| {
            ensure_schema_ready(connection)?;
            let params_json = serde_json::to_string(&task.params)
                .map_err(|error| storage_error_sqlite(&error.to_string()))?;
            connection.execute(
                "
INSERT INTO task_records (
    task_id, name, task_type, params_json, status, executor_agent_id,
    create_time, start_time, end_time, error_msg
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
ON CONFLICT(task_id) DO UPDATE SET
    name = excluded.name,
    task_type = excluded.task_type,
    params_json = excluded.params_json,
    status = excluded.status,
    executor_agent_id = excluded.executor_agent_id,
    create_time = excluded.create_time,
    start_time = excluded.start_time,
    end_time = excluded.end_time,
    error_msg = excluded.error_msg
",
                params![
                    task.task_id.as_str(),
                    task.name.as_str(),
                    task.task_type.as_str(),
                    params_json,
                    task.status.as_str(),
                    task.bound_worker_id.as_ref().map(WorkerId::as_str),
                    format_time(task.create_time)?,
                    task.start_time.map(format_time).transpose()?,
                    task.end_time.map(format_time).transpose()?,
                    task.error_msg.as_deref(),
                ],
            )?;
            Ok(())
        })
    }

    fn get_task(&self, task_id: &TaskId) -> PersistenceResult<Option<TaskRecord>> {
        let task = self.with_connection("get_task", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM task_records WHERE task_id = ?1"),
                    [task_id.as_str()],
                    task_from_row,
                )
                .optional()
        })?;

        if let Some(task) = &task {
            task.check_invariants()?;
        }
        Ok(task)
    }

    fn list_tasks(&self, status: Option<TaskStatus>) -> PersistenceResult<Vec<TaskRecord>> {
        let tasks = self.with_connection("list_tasks", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "
SELECT {TASK_COLUMNS}
FROM task_records
WHERE ?1 IS NULL OR status = ?1
ORDER BY seq ASC
"
            ))?;
            let rows = statement.query_map([status.map(TaskStatus::as_str)], task_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        for task in &tasks {
            task.check_invariants()?;
        }
        Ok(tasks)
    }

    fn delete_task(&self, task_id: &TaskId) -> PersistenceResult<bool> {
        self.with_connection("delete_task", |connection| {
            ensure_schema_ready(connection)?;
            let deleted = connection.execute(
                "DELETE FROM task_records WHERE task_id = ?1",
                [task_id.as_str()],
            )?;
            Ok(deleted > 0)
        })
    }
}

impl WorkerStateStore for SqliteStore {
    fn save_worker_state(&self, state: &WorkerState) -> PersistenceResult<()> {
        self.with_connection("save_worker_state", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO worker_states (worker_id, agent_type, status, load, error_msg, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(worker_id) DO UPDATE SET
    agent_type = excluded.agent_type,
    status = excluded.status,
    load = excluded.load,
    error_msg = excluded.error_msg,
    updated_at = excluded.updated_at
",
                params![
                    state.worker_id.as_str(),
                    state.worker_type.as_str(),
                    state.status.as_str(),
                    state.load,
                    state.error_msg.as_deref(),
                    format_time(state.updated_at)?,
                ],
            )?;
            Ok(())
        })
    }

    fn get_worker_state(&self, worker_id: &WorkerId) -> PersistenceResult<Option<WorkerState>> {
        let state = self.with_connection("get_worker_state", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    "
SELECT worker_id, agent_type, status, load, error_msg, updated_at
FROM worker_states
WHERE worker_id = ?1
",
                    [worker_id.as_str()],
                    worker_state_from_row,
                )
                .optional()
        })?;

        if let Some(state) = &state {
            checked_worker_state(state)?;
        }
        Ok(state)
    }

    fn list_worker_states(&self) -> PersistenceResult<BTreeMap<WorkerId, WorkerState>> {
        let states = self.with_connection("list_worker_states", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT worker_id, agent_type, status, load, error_msg, updated_at
FROM worker_states
ORDER BY worker_id ASC
",
            )?;
            let rows = statement.query_map([], worker_state_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        states
            .into_iter()
            .map(|state| {
                checked_worker_state(&state)?;
                Ok((state.worker_id.clone(), state))
            })
            .collect()
    }

    fn delete_worker_state(&self, worker_id: &WorkerId) -> PersistenceResult<bool> {
        self.with_connection("delete_worker_state", |connection| {
            ensure_schema_ready(connection)?;
            let deleted = connection.execute(
                "DELETE FROM worker_states WHERE worker_id = ?1",
                [worker_id.as_str()],
            )?;
            Ok(deleted > 0)
        })
    }
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let params_raw: String = row.get(3)?;
    let status_raw: String = row.get(4)?;
    let bound_raw: Option<String> = row.get(5)?;
    let create_raw: String = row.get(6)?;
    let start_raw: Option<String> = row.get(7)?;
    let end_raw: Option<String> = row.get(8)?;

    let params: TaskParams = serde_json::from_str(&params_raw)
        .map_err(|error| decode_error(3, format!("invalid params_json: {error}")))?;

    Ok(TaskRecord {
        task_id: TaskId(row.get(0)?),
        name: row.get(1)?,
        task_type: row.get(2)?,
        params,
        status: status_raw
            .parse::<TaskStatus>()
            .map_err(|error| decode_error(4, error.message))?,
        bound_worker_id: bound_raw.map(WorkerId),
        create_time: parse_time(6, &create_raw)?,
        start_time: start_raw.as_deref().map(|raw| parse_time(7, raw)).transpose()?,
        end_time: end_raw.as_deref().map(|raw| parse_time(8, raw)).transpose()?,
        error_msg: row.get(9)?,
    })
}

fn worker_state_from_row(row: &Row<'_>) -> rusqlite::Result<WorkerState> {
    let type_raw: String = row.get(1)?;
    let status_raw: String = row.get(2)?;
    let updated_raw: String = row.get(5)?;

    Ok(WorkerState {
        worker_id: WorkerId(row.get(0)?),
        worker_type: type_raw
            .parse::<WorkerType>()
            .map_err(|error| decode_error(1, error.message))?,
        status: status_raw
            .parse::<WorkerStatus>()
            .map_err(|error| decode_error(2, error.message))?,
        load: row.get(3)?,
        error_msg: row.get(4)?,
        updated_at: parse_time(5, &updated_raw)?,
    })
}

fn checked_worker_state(state: &WorkerState) -> PersistenceResult<()> {
    state.check_invariants().map_err(|error| CoreError {
        kind: CoreErrorKind::ParseFailure,
        ..error
    })
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    Connection::open(database_path)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"
    ))?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "database schema is not initialized; apply migrations before store operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn format_time(value: OffsetDateTime) -> rusqlite::Result<String> {
    value
        .format(&Rfc3339)
        .map_err(|error| storage_error_sqlite(&format!("timestamp is not RFC 3339: {error}")))
}

fn parse_time(column: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|error| decode_error(column, format!("invalid timestamp '{raw}': {error}")))
}

fn decode_error(column: usize, message: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        Type::Text,
        Box::new(std::io::Error::other(message.into())),
    )
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    let kind = match error {
        rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::InvalidColumnType(..) => {
            CoreErrorKind::ParseFailure
        }
        _ => CoreErrorKind::StorageFailure,
    };
    CoreError::new(
        kind,
        format!("sqlite store '{operation}' failed: {error}"),
    )
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}
