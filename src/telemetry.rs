//! Tracing bootstrap and metric label plumbing.
//!
//! Structured events go through `tracing`; counters and histograms go
//! through the `metrics` facade macros at call sites. Recorder and collector
//! installation belong to the embedding service, not this crate.

use crate::{Error, Result};
use std::sync::OnceLock;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

static SERVICE_NAME: OnceLock<String> = OnceLock::new();
static RUN_ID: OnceLock<String> = OnceLock::new();

/// Parsed telemetry configuration from environment.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub log_level: Level,
    pub json_logs: bool,
    pub run_id: String,
}

impl TelemetryConfig {
    /// Read `RINGMASTER_SERVICE_NAME`, `RINGMASTER_LOG_LEVEL` and
    /// `RINGMASTER_LOG_JSON`, falling back to the given defaults.
    pub fn from_env(default_service_name: &str) -> Result<Self> {
        let service_name = std::env::var("RINGMASTER_SERVICE_NAME")
            .unwrap_or_else(|_| default_service_name.to_string());
        let log_level = match std::env::var("RINGMASTER_LOG_LEVEL") {
            Ok(raw) => parse_log_level(&raw)?,
            Err(_) => Level::INFO,
        };
        let json_logs = match std::env::var("RINGMASTER_LOG_JSON") {
            Ok(raw) => parse_bool("RINGMASTER_LOG_JSON", &raw)?,
            Err(_) => true,
        };
        Ok(Self {
            service_name,
            log_level,
            json_logs,
            run_id: uuid::Uuid::new_v4().to_string(),
        })
    }
}

/// Installed telemetry state for a process.
pub struct Telemetry {
    config: TelemetryConfig,
}

impl Telemetry {
    /// Initialize the global tracing subscriber for a binary or test harness.
    pub fn init(default_service_name: &str) -> Result<Self> {
        let config = TelemetryConfig::from_env(default_service_name)?;

        let builder = FmtSubscriber::builder()
            .with_max_level(config.log_level)
            .with_target(true)
            .with_thread_ids(true);
        let init_result = if config.json_logs {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
        init_result.map_err(|e| {
            Error::Config(format!("failed to initialize telemetry subscriber: {e}"))
        })?;

        let _ = SERVICE_NAME.set(config.service_name.clone());
        let _ = RUN_ID.set(config.run_id.clone());

        info!(
            service = %config.service_name,
            run_id = %config.run_id,
            "telemetry initialized"
        );
        Ok(Self { config })
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn run_id(&self) -> &str {
        &self.config.run_id
    }
}

/// Service-name label for metric emission.
pub fn service() -> String {
    SERVICE_NAME
        .get()
        .cloned()
        .unwrap_or_else(|| "ringmaster".to_string())
}

/// Run-id label for metric emission.
pub fn run_id() -> String {
    RUN_ID.get().cloned().unwrap_or_else(|| "unset".to_string())
}

fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "RINGMASTER_LOG_LEVEL must be one of [trace, debug, info, warn, error], got '{other}'"
        ))),
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(Error::Config(format!(
            "{name} must be a boolean, got '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("info").unwrap(), Level::INFO);
        assert_eq!(parse_log_level(" WARN ").unwrap(), Level::WARN);
        assert_eq!(parse_log_level("warning").unwrap(), Level::WARN);
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("X", "true").unwrap());
        assert!(parse_bool("X", "1").unwrap());
        assert!(!parse_bool("X", "no").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }

    #[test]
    fn test_labels_have_defaults() {
        assert!(!service().is_empty());
        assert!(!run_id().is_empty());
    }
}
