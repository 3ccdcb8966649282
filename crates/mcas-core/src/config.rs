//! Engine configuration, loaded from a JSON file with every field defaulted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind, CoreResult};
use crate::orchestration::{AllocationStrategy, DEFAULT_LOAD_THRESHOLD, TypeMapping};

const SQLITE_FILE_NAME: &str = "engine.sqlite3";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub log: LogConfig,
    pub worker: WorkerConfig,
    pub storage: StorageConfig,
    pub allocation: AllocationConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or `mcas_core=debug`.
    pub level: String,
    /// Write rolling log files instead of stderr. The file name is the prefix
    /// of every rotated file, e.g. `logs/mcas.log.2025-03-01`.
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Rotated files kept on disk; older ones are pruned.
    pub max_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            rotation: LogRotation::Daily,
            max_files: 7,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
    Never,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Workers at or above this load are not eligible for new tasks.
    pub load_threshold: f64,
    pub auto_start: bool,
    pub heartbeat_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            load_threshold: DEFAULT_LOAD_THRESHOLD,
            auto_start: true,
            heartbeat_interval_secs: 5,
        }
    }
}

impl WorkerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Json,
    Sqlite,
    Memory,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Storage directory. The sqlite backend keeps its database file inside it.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Json,
            path: PathBuf::from("./data_storage"),
        }
    }
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.path.join(SQLITE_FILE_NAME)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    pub strategy: AllocationStrategy,
    pub type_mapping: TypeMapping,
}

impl EngineConfig {
    /// Reads a JSON config file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(error) => {
                return Err(CoreError::new(
                    CoreErrorKind::StorageFailure,
                    format!("failed to read config '{}': {error}", path.display()),
                ));
            }
        };
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> CoreResult<Self> {
        let config: Self = serde_json::from_str(raw).map_err(|error| {
            CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("malformed config: {error}"),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CoreResult<()> {
        let threshold = self.worker.load_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("load_threshold {threshold} must be in (0, 1]"),
            ));
        }
        if self.log.max_files == 0 {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "log max_files must be greater than zero",
            ));
        }
        if self.worker.heartbeat_interval_secs == 0 {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "heartbeat_interval_secs must be greater than zero",
            ));
        }
        Ok(())
    }
}
