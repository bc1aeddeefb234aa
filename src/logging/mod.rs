//! Structured logging
//!
//! Installs a `tracing` subscriber with JSON or plain-text output. The filter
//! comes from `FILEINFO_LOG`, then `RUST_LOG`, then the configured level.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Logging error types
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("logging already initialized: {0}")]
    Init(String),
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Human-readable text
    #[default]
    Text,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "pretty" | "plain" => Ok(LogFormat::Text),
            other => Err(format!("unknown log format '{other}' (expected json or text)")),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Default filter directive, e.g. `info` or `fileinfo=debug`
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: "info".to_string(),
        }
    }
}

/// Build the filter: `FILEINFO_LOG` > `RUST_LOG` > configured level.
fn build_env_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    for var in ["FILEINFO_LOG", "RUST_LOG"] {
        if let Ok(filter) = std::env::var(var) {
            if !filter.trim().is_empty() {
                return Ok(EnvFilter::try_new(filter)?);
            }
        }
    }
    Ok(EnvFilter::try_new(level)?)
}

/// Install the global subscriber.
pub fn init_logging(config: &LogConfig) -> Result<(), LoggingError> {
    let env_filter = build_env_filter(&config.level)?;

    let result = match config.format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init(),
    };
    result.map_err(|e| LoggingError::Init(e.to_string()))?;

    tracing::debug!(format = ?config.format, level = %config.level, "logging initialized");
    Ok(())
}

/// Best-effort subscriber for tests; ignores double initialization.
pub fn init_test_logging() {
    let _ = Registry::default()
        .with(EnvFilter::new("debug"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.format, LogFormat::Text);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_invalid_level_rejected() {
        assert!(matches!(
            EnvFilter::try_new("fileinfo=notalevel"),
            Err(_)
        ));
    }

    #[test]
    fn test_init_test_logging_is_idempotent() {
        init_test_logging();
        init_test_logging();
    }
}
