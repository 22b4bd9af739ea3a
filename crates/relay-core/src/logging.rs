//! File logging setup.
//!
//! Logs never go to stdout; the chat renderer owns it.

use std::fs;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LoggingConfig, paths};

pub const LOG_ENV: &str = "RELAY_LOG";
const LOG_FILE_PREFIX: &str = "relay.log";

/// Installs the global subscriber.
///
/// Returns the appender guard; drop it only at process exit or buffered
/// lines are lost. Returns `None` when file logging is disabled. A second
/// call leaves the first subscriber in place.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    if !config.file {
        return Ok(None);
    }

    let dir = paths::logs_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let appender = RollingFileAppender::new(Rotation::DAILY, &dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_level(true);

    let installed = tracing_subscriber::registry()
        .with(build_filter(config))
        .with(layer)
        .try_init();
    if installed.is_err() {
        return Ok(None);
    }

    Ok(Some(guard))
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    if let Ok(directives) = std::env::var(LOG_ENV)
        && let Ok(filter) = EnvFilter::try_new(directives)
    {
        return filter;
    }

    EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_file_logging_installs_nothing() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            file: false,
        };
        assert!(init(&config).unwrap().is_none());
    }

    #[test]
    fn test_invalid_level_falls_back_to_info() {
        let config = LoggingConfig {
            level: "=[not a directive".to_string(),
            file: true,
        };
        // Only checks that an unparseable directive does not panic.
        let filter = build_filter(&config);
        assert!(!filter.to_string().is_empty());
    }
}
