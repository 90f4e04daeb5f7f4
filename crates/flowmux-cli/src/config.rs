//! Process configuration: the stream definition plus serving and shutdown
//! settings.

use flowmux_core::StreamConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// The stream definition (input, buffer, pipeline, output, backoff).
    #[serde(flatten)]
    pub stream: StreamConfig,

    /// HTTP server settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Shutdown settings.
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Monitoring settings.
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    /// Whether to serve HTTP endpoints at all.
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,

    /// Listen address.
    #[serde(default = "default_http_address")]
    pub address: String,
}

fn default_http_enabled() -> bool {
    true
}

fn default_http_address() -> String {
    "0.0.0.0:4195".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            address: default_http_address(),
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShutdownConfig {
    /// Total budget for the tiered stop, in milliseconds.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_shutdown_timeout_ms() -> u64 {
    20_000
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Structured JSON lines.
    #[default]
    Json,
    /// Human-readable text.
    Text,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: Config = toml::from_str(
            r#"
            [input]
            type = "generate"

            [output]
            type = "stdout"
            "#,
        )
        .unwrap();

        assert!(config.http.enabled);
        assert_eq!(config.http.address, "0.0.0.0:4195");
        assert_eq!(config.shutdown.timeout_ms, 20_000);
        assert_eq!(config.monitoring.log_format, LogFormat::Json);
        assert_eq!(config.stream.input.kind, "generate");
    }

    #[test]
    fn test_config_overrides() {
        let config: Config = toml::from_str(
            r#"
            [input]
            type = "file"
            path = "in.txt"

            [output]
            type = "discard"

            [http]
            address = "127.0.0.1:9999"

            [shutdown]
            timeout_ms = 5000

            [monitoring]
            log_format = "text"
            "#,
        )
        .unwrap();

        assert_eq!(config.http.address, "127.0.0.1:9999");
        assert_eq!(config.shutdown.timeout_ms, 5_000);
        assert_eq!(config.monitoring.log_format, LogFormat::Text);
    }
}
