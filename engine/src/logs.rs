//! Engine log output: console plus an optional rolling file under the data
//! directory. Deployment build logs are separate, see `deploy::logstream`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::errors::ShipyardError;

const FILE_PREFIX: &str = "engine";
const FILE_SUFFIX: &str = "log";

/// Verbosity named in the settings file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub level: LogLevel,
    pub console: bool,
    /// JSON lines on the console; the file is always JSON
    pub json: bool,
    /// Where `engine.<date>.log` files go; `None` keeps logs on the console
    pub file_dir: Option<PathBuf>,
    /// Rotated files kept next to the current one
    pub keep_files: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            console: true,
            json: false,
            file_dir: None,
            keep_files: 7,
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
///
/// Hold the returned guard until exit, dropping it flushes the file writer.
pub fn init_logging(options: LogOptions) -> Result<Option<WorkerGuard>, ShipyardError> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(options.level).into())
        .from_env_lossy();

    let console = options.console.then(|| {
        if options.json {
            fmt::layer().json().boxed()
        } else {
            fmt::layer().with_target(false).boxed()
        }
    });

    let mut guard = None;
    let file = match &options.file_dir {
        Some(dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(FILE_PREFIX)
                .filename_suffix(FILE_SUFFIX)
                .max_log_files(options.keep_files.max(1))
                .build(dir)
                .map_err(|e| ShipyardError::ConfigError(format!("log file in {}: {}", dir.display(), e)))?;
            let (writer, flush) = tracing_appender::non_blocking(appender);
            guard = Some(flush);
            Some(fmt::layer().json().with_ansi(false).with_writer(writer).boxed())
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| ShipyardError::ConfigError(format!("logging already initialised: {}", e)))?;

    Ok(guard)
}
