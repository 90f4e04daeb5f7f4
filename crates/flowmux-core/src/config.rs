//! Stream configuration structures.
//!
//! A stream is described by four sections: `input`, optional `buffer`
//! (default `none`, which omits the layer entirely), optional `pipeline`
//! (omitted when the processor list is empty), and `output`. Connector
//! sections carry a `type` plus connector-specific parameters that the
//! engine never interprets; the registry that materialises connectors lives
//! outside the core.

use crate::error::{Error, Result};
use crate::retry::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration of one stream.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Input connector section.
    pub input: ConnectorConfig,

    /// Buffer section.
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Pipeline section.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Output connector section.
    pub output: ConnectorConfig,

    /// Connect backoff parameters shared by the input and output adapters.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl StreamConfig {
    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.input.kind.is_empty() {
            return Err(Error::Config("input type must not be empty".into()));
        }
        if self.output.kind.is_empty() {
            return Err(Error::Config("output type must not be empty".into()));
        }
        if self.pipeline.workers == 0 {
            return Err(Error::Config("pipeline workers must be >= 1".into()));
        }
        if self.output.workers == 0 {
            return Err(Error::Config("output workers must be >= 1".into()));
        }
        if let BufferConfig::Memory { max_bytes } = &self.buffer {
            if *max_bytes == 0 {
                return Err(Error::Config("memory buffer max_bytes must be > 0".into()));
            }
        }
        Ok(())
    }
}

/// A connector or processor section: a type name plus opaque parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectorConfig {
    /// Registered connector type.
    #[serde(rename = "type")]
    pub kind: String,

    /// Writer parallelism; only meaningful for outputs.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Connector-specific parameters, passed through untouched.
    #[serde(flatten)]
    pub params: toml::value::Table,
}

impl ConnectorConfig {
    /// Construct a config with no parameters.
    pub fn of_type(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            workers: default_workers(),
            params: toml::value::Table::new(),
        }
    }

    /// Look up a string parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    /// Look up an integer parameter.
    pub fn param_int(&self, key: &str) -> Option<i64> {
        self.params.get(key).and_then(|v| v.as_integer())
    }
}

fn default_workers() -> usize {
    1
}

/// Buffer regimes. `none` wires the input directly to the next layer.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BufferConfig {
    /// No buffer layer.
    #[default]
    None,

    /// Volatile in-memory queue bounded by total batch bytes.
    Memory {
        /// Capacity in bytes before backpressure engages.
        #[serde(default = "default_memory_max_bytes")]
        max_bytes: usize,
    },

    /// Disk-backed append log.
    Spool {
        /// Directory holding spool log files.
        dir: PathBuf,
    },
}

fn default_memory_max_bytes() -> usize {
    64 * 1024 * 1024
}

/// Pipeline section: processors applied in order across worker slots.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Processor chain; an empty list omits the pipeline layer.
    #[serde(default)]
    pub processors: Vec<ConnectorConfig>,

    /// Number of parallel pipeline workers. Order is preserved only with a
    /// single worker.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            processors: Vec::new(),
            workers: default_workers(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config: StreamConfig = toml::from_str(
            r#"
            [input]
            type = "generate"

            [output]
            type = "stdout"
            "#,
        )
        .unwrap();

        assert_eq!(config.input.kind, "generate");
        assert_eq!(config.buffer, BufferConfig::None);
        assert!(config.pipeline.processors.is_empty());
        assert_eq!(config.pipeline.workers, 1);
        assert_eq!(config.output.workers, 1);
        assert_eq!(config.backoff.initial_ms, 100);
        config.validate().unwrap();
    }

    #[test]
    fn test_full_config() {
        let config: StreamConfig = toml::from_str(
            r#"
            [input]
            type = "file"
            path = "/tmp/in.txt"

            [buffer]
            type = "memory"
            max_bytes = 1024

            [pipeline]
            workers = 4

            [[pipeline.processors]]
            type = "mapping_upper"

            [output]
            type = "file"
            path = "/tmp/out.txt"
            workers = 2

            [backoff]
            initial_ms = 50
            max_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.input.param_str("path"), Some("/tmp/in.txt"));
        assert_eq!(config.buffer, BufferConfig::Memory { max_bytes: 1024 });
        assert_eq!(config.pipeline.workers, 4);
        assert_eq!(config.pipeline.processors[0].kind, "mapping_upper");
        assert_eq!(config.output.workers, 2);
        assert_eq!(config.backoff.max_ms, 500);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config: StreamConfig = toml::from_str(
            r#"
            [input]
            type = "generate"
            [output]
            type = "stdout"
            "#,
        )
        .unwrap();
        config.pipeline.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_spool_buffer_config() {
        let config: BufferConfig = toml::from_str(
            r#"
            type = "spool"
            dir = "/var/lib/flowmux/spool"
            "#,
        )
        .unwrap();
        assert_eq!(
            config,
            BufferConfig::Spool {
                dir: PathBuf::from("/var/lib/flowmux/spool")
            }
        );
    }
}
