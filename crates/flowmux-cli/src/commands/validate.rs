//! The `validate` command: check a configuration without running it.

use crate::config::Config;
use crate::connectors::ConnectorRegistry;
use anyhow::{bail, Result};

/// Validate the configuration and the referenced connector types.
pub fn run(config: &Config) -> Result<()> {
    config.stream.validate()?;

    let registry = ConnectorRegistry::with_defaults();
    if !registry.has_input(&config.stream.input.kind) {
        bail!("unknown input type: {}", config.stream.input.kind);
    }
    if !registry.has_output(&config.stream.output.kind) {
        bail!("unknown output type: {}", config.stream.output.kind);
    }
    for processor in &config.stream.pipeline.processors {
        if !registry.has_processor(&processor.kind) {
            bail!("unknown processor type: {}", processor.kind);
        }
    }

    println!("Configuration is valid");
    Ok(())
}
