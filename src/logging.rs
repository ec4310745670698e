use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::audit::AUDIT_TARGET;

const MAIN_LOG_FILE: &str = "nexo-mfa.log";
const AUDIT_LOG_FILE: &str = "mfa-audit.log";

/// Log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `nexo_mfa=debug`
    pub level: String,
    pub format: LogFormat,
    /// Write to stderr
    pub console: bool,
    /// Write rolling files under `log_dir`
    pub file_enabled: bool,
    pub log_dir: PathBuf,
    pub rotation: LogRotation,
    /// Copy audit events into their own file
    pub audit_file: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Plain,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Plain,
            console: true,
            file_enabled: false,
            log_dir: PathBuf::from("logs"),
            rotation: LogRotation::Daily,
            audit_file: true,
        }
    }
}

impl LogConfig {
    pub fn with_log_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }
}

fn ensure_log_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn appender(config: &LogConfig, file_name: &str) -> rolling::RollingFileAppender {
    match config.rotation {
        LogRotation::Daily => rolling::daily(&config.log_dir, file_name),
        LogRotation::Hourly => rolling::hourly(&config.log_dir, file_name),
        LogRotation::Never => rolling::never(&config.log_dir, file_name),
    }
}

/// Install the global subscriber.
///
/// The returned guards flush the file writers when dropped; keep them alive
/// for the life of the process.
pub fn init_logging(config: &LogConfig) -> Result<Vec<WorkerGuard>> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let mut guards = Vec::new();

    if config.console {
        let layer = match config.format {
            LogFormat::Plain => fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_filter(env_filter(&config.level))
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_filter(env_filter(&config.level))
                .boxed(),
        };
        layers.push(layer);
    }

    if config.file_enabled {
        ensure_log_dir(&config.log_dir)?;

        let (writer, guard) = non_blocking(appender(config, MAIN_LOG_FILE));
        guards.push(guard);
        layers.push(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(env_filter(&config.level))
                .boxed(),
        );

        if config.audit_file {
            let (writer, guard) = non_blocking(appender(config, AUDIT_LOG_FILE));
            guards.push(guard);
            layers.push(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_filter(filter_fn(|meta| meta.target() == AUDIT_TARGET))
                    .boxed(),
            );
        }
    }

    tracing_subscriber::registry().with(layers).try_init()?;

    tracing::debug!(
        level = %config.level,
        log_dir = %config.log_dir.display(),
        files = config.file_enabled,
        "Logging initialised"
    );

    Ok(guards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEntry, AuditEvent};
    use tempfile::tempdir;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.console);
        assert!(!config.file_enabled);
        assert_eq!(config.rotation, LogRotation::Daily);
    }

    #[test]
    fn test_ensure_log_dir() {
        let temp_dir = tempdir().unwrap();
        let log_dir = temp_dir.path().join("test_logs");

        assert!(ensure_log_dir(&log_dir).is_ok());
        assert!(log_dir.exists());
    }

    #[test]
    fn test_audit_events_get_their_own_file() {
        let temp_dir = tempdir().unwrap();
        let config = LogConfig {
            console: false,
            file_enabled: true,
            rotation: LogRotation::Never,
            ..LogConfig::default()
        }
        .with_log_dir(temp_dir.path());

        let guards = init_logging(&config).unwrap();
        tracing::info!("ordinary event");
        AuditEntry::new(12, AuditEvent::LockedOut, false, 0)
            .reason("too many failures")
            .trace();
        drop(guards);

        let audit = fs::read_to_string(temp_dir.path().join(AUDIT_LOG_FILE)).unwrap();
        let main = fs::read_to_string(temp_dir.path().join(MAIN_LOG_FILE)).unwrap();

        assert!(audit.contains("locked_out"));
        assert!(!audit.contains("ordinary event"));
        assert!(main.contains("ordinary event"));
        assert!(main.contains("locked_out"));
    }
}
