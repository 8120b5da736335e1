//! Tracing subscriber setup.
//!
//! `RUST_LOG` directives take precedence; without them the configured level
//! applies to every target. Output goes to stdout unless a log file is set,
//! in which case lines are appended to it without ANSI colors.

use std::fs::{File, OpenOptions};
use std::sync::Arc;

use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    /// One JSON object per event, with span context and source location.
    Json,
    Pretty,
}

impl LogFormat {
    fn from_config(format: &str) -> Self {
        if format.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Install the global subscriber. Fails on an unknown level, an unwritable
/// log file, or when a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let (writer, ansi) = match config.file_path.as_deref() {
        Some(path) => (BoxMakeWriter::new(Arc::new(open_append(path)?)), false),
        None => (BoxMakeWriter::new(std::io::stdout), true),
    };

    let registry = tracing_subscriber::registry().with(filter);
    match LogFormat::from_config(&config.format) {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(writer),
            )
            .try_init()?,
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(ansi)
                    .with_file(false)
                    .with_line_number(true)
                    .with_writer(writer),
            )
            .try_init()?,
    }
    Ok(())
}

fn open_append(path: &str) -> anyhow::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("Cannot open log file {path}: {e}"))
}

fn parse_log_level(level: &str) -> anyhow::Result<LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" | "warning" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        "off" => Ok(LevelFilter::OFF),
        other => Err(anyhow::anyhow!("Invalid log level: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("INFO").unwrap(), LevelFilter::INFO);
        assert_eq!(parse_log_level("warning").unwrap(), LevelFilter::WARN);
        assert_eq!(parse_log_level("off").unwrap(), LevelFilter::OFF);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_format_falls_back_to_pretty() {
        assert_eq!(LogFormat::from_config("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::from_config("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::from_config("compact"), LogFormat::Pretty);
    }

    #[test]
    fn test_init_rejects_bad_level() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }

    #[test]
    fn test_init_reports_unwritable_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            file_path: Some(dir.path().join("missing/relay.log").to_string_lossy().into_owned()),
            ..LoggingConfig::default()
        };
        let err = init_logging(&config).unwrap_err();
        assert!(err.to_string().contains("Cannot open log file"));
    }
}
