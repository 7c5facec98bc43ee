//! Process-wide `tracing` subscriber setup.
//!
//! Human-readable output goes to stderr. When a log file is given, the same
//! records are also written there in plain text (no ANSI colors).

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter when neither `--log-level` nor `RUST_LOG` is set.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Builds the filter: explicit level, else `RUST_LOG`, else [`DEFAULT_LOG_FILTER`].
#[must_use]
pub fn build_filter(level: Option<&str>) -> EnvFilter {
    level
        .and_then(|l| EnvFilter::try_new(l).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Installs the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process. Calling this twice leaves the first subscriber
/// in place.
pub fn init_logging(level: Option<&str>, log_file: Option<&Path>) -> std::io::Result<Option<WorkerGuard>> {
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)?;
            let name = path
                .file_name()
                .map_or_else(|| "dtiflow.log".into(), |n| n.to_os_string());
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(build_filter(level))
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    Ok(guard)
}
