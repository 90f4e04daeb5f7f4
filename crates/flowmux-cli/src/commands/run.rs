//! The `run` command: materialise a stream from config and drive it until a
//! shutdown signal arrives.

use crate::config::Config;
use crate::connectors::{BuildContext, ConnectorRegistry};
use crate::server::{start_server, ServerState};
use anyhow::{Context, Result};
use flowmux_core::endpoints::EndpointRegistry;
use flowmux_core::metrics::Metrics;
use flowmux_core::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Build and run the configured stream.
pub async fn run(config: Config) -> Result<()> {
    config
        .stream
        .validate()
        .context("invalid stream configuration")?;

    let metrics = Metrics::new();
    let endpoints = EndpointRegistry::new();
    let registry = ConnectorRegistry::with_defaults();
    let ctx = BuildContext {
        metrics: Arc::clone(&metrics),
        backoff: config.stream.backoff.clone(),
        endpoints: Arc::clone(&endpoints),
        registry: Arc::clone(&registry),
    };

    let input = registry
        .build_input(&config.stream.input, &ctx)
        .context("failed to build input")?;
    let buffer = registry
        .build_buffer(&config.stream.buffer)
        .context("failed to build buffer")?;
    let pipeline = registry
        .build_pipeline(&config.stream.pipeline, &ctx)
        .context("failed to build pipeline")?;
    let output = registry
        .build_output(&config.stream.output, &ctx)
        .context("failed to build output")?;

    let stream = Arc::new(
        Stream::new(input, buffer, pipeline, output).context("failed to wire stream")?,
    );
    Stream::register_ready_endpoint(&stream, &endpoints);

    let (shutdown_tx, _) = broadcast::channel(1);
    if config.http.enabled {
        let state = Arc::new(ServerState {
            endpoints: Arc::clone(&endpoints),
            metrics: Arc::clone(&metrics),
        });
        tokio::spawn(start_server(
            state,
            config.http.address.clone(),
            shutdown_tx.subscribe(),
        ));
    }

    info!(
        input = %config.stream.input.kind,
        output = %config.stream.output.kind,
        "Stream running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    let timeout = Duration::from_millis(config.shutdown.timeout_ms);
    if let Err(err) = stream.stop(timeout).await {
        error!(error = %err, "Stream did not stop cleanly");
    } else {
        info!("Stream stopped");
    }

    let _ = shutdown_tx.send(());
    Ok(())
}
