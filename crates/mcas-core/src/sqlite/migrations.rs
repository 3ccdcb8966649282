#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_engine_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS task_records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    task_type TEXT NOT NULL,
    params_json TEXT NOT NULL,
    status TEXT NOT NULL,
    executor_agent_id TEXT,
    create_time TEXT NOT NULL,
    start_time TEXT,
    end_time TEXT,
    error_msg TEXT
);

CREATE TABLE IF NOT EXISTS worker_states (
    worker_id TEXT PRIMARY KEY,
    agent_type TEXT NOT NULL,
    status TEXT NOT NULL,
    load REAL NOT NULL,
    error_msg TEXT,
    updated_at TEXT NOT NULL
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS worker_states;
DROP TABLE IF EXISTS task_records;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_task_status_index",
    up_sql: r#"
CREATE INDEX IF NOT EXISTS idx_task_records_status ON task_records (status, seq);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_task_records_status;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
