//! Tracing subscriber setup shared by the control-plane binaries.
//!
//! Output destination, format and level come from a [`LogConfig`], which is
//! normally read once from the environment at startup:
//!
//! - `LOG_LEVEL`: default filter when `RUST_LOG` is unset (`info`)
//! - `LOG_FORMAT`: `human` or `json`
//! - `LOG_OUTPUT`: `console`, `file` or `both`
//! - `LOG_FILE_PATH`: file written when output includes `file`

use std::{
    env,
    path::{Path, PathBuf},
};
use tracing_appender::{non_blocking::WorkerGuard, rolling::RollingFileAppender};
use tracing_subscriber::{fmt, fmt::writer::MakeWriterExt, prelude::*, registry, EnvFilter};

const DEFAULT_LOG_FILE: &str = "/tmp/ws-reconciler.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Human,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
}

impl LogOutput {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            _ => LogOutput::Console,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    pub file_path: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Human,
            output: LogOutput::Console,
            file_path: PathBuf::from(DEFAULT_LOG_FILE),
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            level: lookup("LOG_LEVEL").unwrap_or(defaults.level),
            format: lookup("LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or(defaults.format),
            output: lookup("LOG_OUTPUT")
                .map(|v| LogOutput::parse(&v))
                .unwrap_or(defaults.output),
            file_path: lookup("LOG_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.file_path),
        }
    }
}

fn quiet(filter: EnvFilter, directive: &str) -> EnvFilter {
    match directive.parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

fn file_appender(path: &Path) -> RollingFileAppender {
    let dir = path.parent().unwrap_or_else(|| Path::new("/tmp"));
    let file_name = path
        .file_name()
        .unwrap_or_else(|| "ws-reconciler.log".as_ref());
    tracing_appender::rolling::daily(dir, file_name)
}

/// Installs the global tracing subscriber.
///
/// The returned guard must be held for the lifetime of the process when file
/// output is enabled, otherwise buffered lines are lost on exit. Calling this
/// a second time is a no-op.
pub fn init_subscriber(config: &LogConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let filter = quiet(filter, "hyper=warn");
    let filter = quiet(filter, "kube_client=warn");
    let filter = quiet(filter, "sqlx=warn");

    let subscriber = registry().with(filter);
    let is_json = config.format == LogFormat::Json;

    match config.output {
        LogOutput::Console => {
            let layer = fmt::layer().with_writer(std::io::stdout);
            let _ = if is_json {
                subscriber.with(layer.json()).try_init()
            } else {
                subscriber.with(layer).try_init()
            };
            None
        }
        LogOutput::File => {
            let (writer, guard) = tracing_appender::non_blocking(file_appender(&config.file_path));
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            let _ = if is_json {
                subscriber.with(layer.json()).try_init()
            } else {
                subscriber.with(layer).try_init()
            };
            Some(guard)
        }
        LogOutput::Both => {
            let (writer, guard) = tracing_appender::non_blocking(file_appender(&config.file_path));
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(std::io::stdout.and(writer));
            let _ = if is_json {
                subscriber.with(layer.json()).try_init()
            } else {
                subscriber.with(layer).try_init()
            };
            Some(guard)
        }
    }
}
