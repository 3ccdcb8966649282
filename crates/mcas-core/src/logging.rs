use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogRotation};
use crate::models::{CoreError, CoreErrorKind, CoreResult};

/// Returned by [`init_tracing`]. File output goes through a background writer
/// that flushes when this guard is dropped, so hold it for the life of the process.
#[must_use]
pub struct LoggingGuard {
    installed: bool,
    _writer: Option<WorkerGuard>,
}

impl LoggingGuard {
    /// `false` when a global subscriber was already set.
    pub fn installed(&self) -> bool {
        self.installed
    }
}

/// Installs the global fmt subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init_tracing(config: &LogConfig) -> CoreResult<LoggingGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|error| {
            CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("invalid log level '{}': {error}", config.level),
            )
        })?;

    let Some(path) = &config.file_path else {
        let installed = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .is_ok();
        return Ok(LoggingGuard {
            installed,
            _writer: None,
        });
    };

    let (writer, guard) = tracing_appender::non_blocking(rolling_file(path, config)?);
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .is_ok();
    Ok(LoggingGuard {
        installed,
        _writer: Some(guard),
    })
}

/// Appender writing `<dir>/<file name>.<period>` and keeping the newest
/// `max_files` of them.
fn rolling_file(path: &Path, config: &LogConfig) -> CoreResult<RollingFileAppender> {
    let prefix = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("log file path '{}' has no file name", path.display()),
            )
        })?;
    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(directory).map_err(|error| log_file_error(path, error))?;

    rolling::Builder::new()
        .rotation(rotation(config.rotation))
        .filename_prefix(prefix)
        .max_log_files(config.max_files)
        .build(directory)
        .map_err(|error| log_file_error(path, error))
}

fn rotation(rotation: LogRotation) -> Rotation {
    match rotation {
        LogRotation::Minutely => Rotation::MINUTELY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    }
}

fn log_file_error(path: &Path, error: impl std::fmt::Display) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("failed to open log file '{}': {error}", path.display()),
    )
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn test_log_dir(test_name: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("mcas-log-{test_name}-{nanos}"))
    }

    #[test]
    fn rolling_file_writes_under_configured_prefix() {
        let dir = test_log_dir("prefix");
        let config = LogConfig {
            file_path: Some(dir.join("nested").join("mcas.log")),
            ..LogConfig::default()
        };

        let mut appender =
            rolling_file(config.file_path.as_deref().unwrap(), &config).unwrap();
        appender.write_all(b"engine initialized\n").unwrap();
        appender.flush().unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.join("nested"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("mcas.log"), "{names:?}");
    }

    #[test]
    fn never_rotation_keeps_plain_file_name() {
        let dir = test_log_dir("never");
        let config = LogConfig {
            file_path: Some(dir.join("mcas.log")),
            rotation: LogRotation::Never,
            ..LogConfig::default()
        };

        rolling_file(config.file_path.as_deref().unwrap(), &config).unwrap();

        assert!(dir.join("mcas.log").exists());
    }

    #[test]
    fn path_without_file_name_is_rejected() {
        let error = rolling_file(Path::new("/"), &LogConfig::default()).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidInput);
    }

    #[test]
    fn invalid_level_is_rejected() {
        let config = LogConfig {
            level: "mcas_core=loud".to_string(),
            ..LogConfig::default()
        };
        // RUST_LOG may be set in the environment; only assert when it is not.
        if std::env::var_os("RUST_LOG").is_none() {
            assert_eq!(
                init_tracing(&config).err().unwrap().kind,
                CoreErrorKind::InvalidInput
            );
        }
    }
}
