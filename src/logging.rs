//! Logging setup for the daemon and the one-shot commands.
//!
//! Console output always goes to stderr. When `logging.file` is set, a second
//! layer writes plain text to a daily rotated file next to it
//! (`backup.log.2024-01-01`, ...). `RUST_LOG` overrides the configured level.

use anyhow::{anyhow, Result};
use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config_manager::LoggingConfig;

/// Installs the global subscriber. Keep the returned guard alive until exit
/// or buffered file output is lost.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(&config.level)))
        .map_err(|e| anyhow!("invalid log level {:?}: {}", config.level, e))?;

    let console = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(rolling_appender(path)?);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to initialise logging: {}", e))?;

    Ok(guard)
}

fn default_directive(level: &str) -> String {
    format!("sftp_backup={level},sftp_backup_lib={level}", level = level.trim())
}

fn rolling_appender(path: &Path) -> Result<tracing_appender::rolling::RollingFileAppender> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("log file path has no file name: {}", path.display()))?;
    fs::create_dir_all(dir)?;
    Ok(tracing_appender::rolling::daily(dir, file_name))
}
