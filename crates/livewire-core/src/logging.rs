//! File logging for the connector.
//!
//! Every livewire command writes NDJSON to stdout, so the subscriber installed
//! here never has a stdout or stderr writer. Logs go to a daily-rolling file
//! instead.

use std::path::{Path, PathBuf};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

/// Environment variable controlling the log filter.
pub const LOG_ENV_VAR: &str = "LIVEWIRE_LOG";

/// Environment variable overriding the log directory.
pub const LOG_DIR_ENV_VAR: &str = "LIVEWIRE_LOG_DIR";

/// Filter used when `LIVEWIRE_LOG` is unset or unparsable.
pub const DEFAULT_FILTER: &str = "livewire=info,livewire_link=info,warn";

const LOG_FILE_PREFIX: &str = "livewire.log";

/// Initialize the logging subsystem
///
/// Logs go to `$LIVEWIRE_LOG_DIR` when set, otherwise to
/// `<data_local_dir>/livewire/logs/`. The filter comes from `LIVEWIRE_LOG`.
///
/// # Examples
/// ```bash
/// LIVEWIRE_LOG=debug livewire watch --endpoint wss://example.test/ws
/// LIVEWIRE_LOG=livewire_link=trace LIVEWIRE_LOG_DIR=/tmp/lw livewire call ping
/// ```
pub fn init() -> Result<()> {
    let log_dir = get_log_directory();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_PREFIX);

    let (env_filter, filter_error) = match EnvFilter::try_from_env(LOG_ENV_VAR) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new(DEFAULT_FILTER), Some(e)),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true)
                .with_timer(fmt::time::ChronoLocal::new(
                    "%Y-%m-%d %H:%M:%S%.3f".to_string(),
                )),
        )
        .init();

    tracing::info!(
        "livewire {} starting (pid {})",
        env!("CARGO_PKG_VERSION"),
        std::process::id()
    );
    tracing::info!("Log directory: {}", log_dir.display());
    if let Some(e) = filter_error {
        if std::env::var_os(LOG_ENV_VAR).is_some() {
            tracing::warn!("Ignoring invalid ${}: {}; using {}", LOG_ENV_VAR, e, DEFAULT_FILTER);
        }
    }

    Ok(())
}

/// Directory the rolling log files live in.
pub fn get_log_directory() -> PathBuf {
    resolve_log_directory(
        std::env::var_os(LOG_DIR_ENV_VAR).map(PathBuf::from),
        dirs::data_local_dir(),
    )
}

fn resolve_log_directory(explicit: Option<PathBuf>, data_dir: Option<PathBuf>) -> PathBuf {
    match explicit {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => data_dir
            .unwrap_or_else(|| PathBuf::from("."))
            .join("livewire")
            .join("logs"),
    }
}

/// Base path of the rolling log file. The appender adds a date suffix.
pub fn get_current_log_file() -> PathBuf {
    log_file_in(&get_log_directory())
}

fn log_file_in(dir: &Path) -> PathBuf {
    dir.join(LOG_FILE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_log_directory_wins() {
        let dir = resolve_log_directory(
            Some(PathBuf::from("/var/log/lw")),
            Some(PathBuf::from("/home/u/.local/share")),
        );
        assert_eq!(dir, PathBuf::from("/var/log/lw"));
    }

    #[test]
    fn test_empty_override_falls_back_to_data_dir() {
        let dir = resolve_log_directory(
            Some(PathBuf::new()),
            Some(PathBuf::from("/home/u/.local/share")),
        );
        assert_eq!(dir, PathBuf::from("/home/u/.local/share/livewire/logs"));
    }

    #[test]
    fn test_missing_data_dir_uses_working_directory() {
        let dir = resolve_log_directory(None, None);
        assert_eq!(dir, PathBuf::from("./livewire/logs"));
    }

    #[test]
    fn test_log_file_name() {
        assert_eq!(
            log_file_in(Path::new("/tmp/lw")),
            PathBuf::from("/tmp/lw/livewire.log")
        );
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}
