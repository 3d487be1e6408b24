//! Structured logging to a daily-rotated file under the XDG state directory.
//!
//! Files are named `chanwatch.<date>.log`. Nothing is written to the
//! terminal, which belongs to the CLI's progress output.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// HTTP internals are noisy at debug level; keep them at warn unless
/// `RUST_LOG` says otherwise.
const QUIET_TARGETS: &[&str] = &["hyper=warn", "hyper_util=warn", "reqwest=warn", "rustls=warn"];

/// Keeps the background log writer alive. Dropping it flushes pending lines.
pub struct LoggingGuard {
    _worker: WorkerGuard,
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `config.level` when set.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let dir = log_dir();
    let (writer, worker) = file_writer(&dir, config.max_files)?;

    tracing_subscriber::registry()
        .with(env_filter(&config.level))
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .init();

    tracing::info!(
        dir = %dir.display(),
        level = %config.level,
        max_files = config.max_files,
        "Logging initialized"
    );
    Ok(LoggingGuard { _worker: worker })
}

/// Send logs to the test harness; safe to call from every test.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn log_dir() -> PathBuf {
    Config::state_dir()
}

fn file_writer(dir: &Path, max_files: usize) -> Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("chanwatch")
        .filename_suffix("log")
        .max_log_files(max_files.max(1))
        .build(dir)
        .map_err(|e| Error::Config(format!("cannot open log file in {}: {}", dir.display(), e)))?;
    Ok(tracing_appender::non_blocking(appender))
}

fn env_filter(level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    QUIET_TARGETS
        .iter()
        .fold(EnvFilter::new(level), |filter, directive| {
            match directive.parse() {
                Ok(d) => filter.add_directive(d),
                Err(_) => filter,
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_dir_is_app_scoped() {
        assert!(log_dir().ends_with("chanwatch"));
    }

    #[test]
    fn test_file_writer_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested/logs");
        let (_writer, _guard) = file_writer(&dir, 0).unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn test_init_test_is_repeatable() {
        init_test();
        init_test();
        tracing::info!(channel = "news", "still alive");
    }
}
