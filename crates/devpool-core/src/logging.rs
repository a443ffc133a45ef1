//! Logging configuration using tracing
//!
//! One-shot CLI runs log to a daily file so their stdout stays clean JSON;
//! `serve` logs to stderr. Both read their filter from [`LogSettings::env_var`].

use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Error, Result};

/// Where a devpool process logs and which filter it starts with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// Directory under the platform data dir, also the log file stem
    pub app_name: &'static str,

    /// Variable holding an `EnvFilter` directive
    pub env_var: &'static str,

    /// Directive used when the variable is unset or unparseable
    pub default_filter: &'static str,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            app_name: "devpool",
            env_var: "DEVPOOL_LOG",
            default_filter: "devpool=info,warn",
        }
    }
}

impl LogSettings {
    /// `<data_local_dir>/<app_name>/logs`
    pub fn log_directory(&self) -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(self.app_name)
            .join("logs")
    }

    fn log_file_name(&self) -> String {
        format!("{}.log", self.app_name)
    }

    /// Filter for a directive taken from the environment
    pub fn filter_for(&self, directive: Option<&str>) -> EnvFilter {
        directive
            .and_then(|d| EnvFilter::try_new(d).ok())
            .unwrap_or_else(|| EnvFilter::new(self.default_filter))
    }

    fn env_filter(&self) -> EnvFilter {
        self.filter_for(std::env::var(self.env_var).ok().as_deref())
    }
}

fn timer() -> fmt::time::ChronoLocal {
    fmt::time::ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string())
}

fn already_installed(e: impl std::fmt::Display) -> Error {
    Error::config(format!("a tracing subscriber is already installed: {}", e))
}

/// Log to a daily-rotated file, returning the log directory
///
/// # Examples
/// ```bash
/// DEVPOOL_LOG=debug devpool subscribe platform=android
/// DEVPOOL_LOG=devpool_app=trace devpool boot count=2
/// ```
pub fn init(settings: &LogSettings) -> Result<PathBuf> {
    let log_dir = settings.log_directory();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender =
        RollingFileAppender::new(Rotation::DAILY, &log_dir, settings.log_file_name());

    tracing_subscriber::registry()
        .with(settings.env_filter())
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true)
                .with_timer(timer()),
        )
        .try_init()
        .map_err(already_installed)?;

    tracing::debug!(
        "{} logging to {} (pid {})",
        settings.app_name,
        log_dir.display(),
        std::process::id()
    );
    Ok(log_dir)
}

/// Log to stderr, for foreground processes like `serve`
pub fn init_stderr(settings: &LogSettings) -> Result<()> {
    tracing_subscriber::registry()
        .with(settings.env_filter())
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_timer(timer()),
        )
        .try_init()
        .map_err(already_installed)
}
