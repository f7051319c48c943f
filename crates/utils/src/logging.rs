//! provides logging helpers

use std::env;
use std::path::Path;

use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Environment variable naming a log file; when set, logs are also written to
/// a daily rotated file at that path.
pub const LOG_PATH_ENV_VAR: &str = "NODE_INFORMER_LOG_PATH";

const MAX_LOG_FILES: usize = 7;

/// initiate the global tracing subscriber
///
/// The returned guard flushes the file writer and must be held until exit.
pub fn init() -> Option<WorkerGuard> {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let stderr_layer = layer().with_writer(std::io::stderr).with_target(true);

    let (file_layer, guard) = match env::var(LOG_PATH_ENV_VAR)
        .ok()
        .and_then(|path| rolling_file_writer(Path::new(&path)))
    {
        Some((writer, guard)) => (
            Some(
                layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true),
            ),
            Some(guard),
        ),
        None => (None, None),
    };

    registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}

fn rolling_file_writer(path: &Path) -> Option<(NonBlocking, WorkerGuard)> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = path.file_name()?.to_str()?;

    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(MAX_LOG_FILES)
        .build(dir)
    {
        Ok(appender) => Some(tracing_appender::non_blocking(appender)),
        Err(e) => {
            // the subscriber is not installed yet
            eprintln!("failed to create log file appender in {}: {e}", dir.display());
            None
        }
    }
}
