//! Stream supervisor: wires the four layers and manages their lifetime.
//!
//! Layers are chained by handing each producer's outbound channel to the
//! next consumer. Shutdown is tiered: a graceful pass drains the layers in
//! stream order on three quarters of the budget, and only if that times out
//! is everything closed concurrently on the remainder.

use crate::buffer::Buffer;
use crate::endpoints::{EndpointRegistry, EndpointResponse};
use crate::error::{Error, Result};
use crate::input::StreamedInput;
use crate::output::StreamedOutput;
use crate::pipeline::Pipeline;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// A wired stream: Input → (Buffer?) → (Pipeline?) → Output.
pub struct Stream {
    input: Box<dyn StreamedInput>,
    buffer: Option<Box<dyn Buffer>>,
    pipeline: Option<Pipeline>,
    output: Box<dyn StreamedOutput>,
}

impl Stream {
    /// Wire the given layers together. Buffer and pipeline are optional;
    /// when absent the neighbouring layers connect directly.
    pub fn new(
        mut input: Box<dyn StreamedInput>,
        mut buffer: Option<Box<dyn Buffer>>,
        mut pipeline: Option<Pipeline>,
        mut output: Box<dyn StreamedOutput>,
    ) -> Result<Self> {
        let mut next = input.take_transactions().ok_or(Error::AlreadyConsuming)?;

        if let Some(buffer) = buffer.as_mut() {
            buffer.consume(next)?;
            next = buffer.take_transactions().ok_or(Error::AlreadyConsuming)?;
        }
        if let Some(pipeline) = pipeline.as_mut() {
            pipeline.consume(next)?;
            next = pipeline
                .take_transactions()
                .ok_or(Error::AlreadyConsuming)?;
        }
        output.consume(next)?;

        Ok(Self {
            input,
            buffer,
            pipeline,
            output,
        })
    }

    /// Whether both ends of the stream are connected.
    pub fn is_ready(&self) -> bool {
        self.input.connected() && self.output.connected()
    }

    /// Register the readiness endpoint: 200 "OK" when both ends are
    /// connected, 503 naming the unconnected sides otherwise.
    pub fn register_ready_endpoint(stream: &Arc<Stream>, registry: &EndpointRegistry) {
        let stream = Arc::downgrade(stream);
        registry.register(
            "/ready",
            "Returns 200 OK if the input and output are connected, otherwise a 503 is returned.",
            Arc::new(move |_req| {
                let Some(stream) = stream.upgrade() else {
                    return EndpointResponse::status(503, "stream terminated\n");
                };
                let input_connected = stream.input.connected();
                let output_connected = stream.output.connected();
                if input_connected && output_connected {
                    return EndpointResponse::ok("OK");
                }
                let mut body = String::new();
                if !input_connected {
                    body.push_str("input not connected\n");
                }
                if !output_connected {
                    body.push_str("output not connected\n");
                }
                EndpointResponse::status(503, body)
            }),
        );
    }

    /// Drain the stream in layer order: close the input and wait for its
    /// channel to close, let the buffer empty out, then close the pipeline
    /// and output in turn. Any wait exceeding the remaining budget returns
    /// `Error::Timeout`.
    pub async fn stop_gracefully(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();

        self.input.close_at_leisure();
        self.input.wait_for_close(timeout).await?;

        // Let the buffer drain to the downstream before prompting any other
        // layer to shut down.
        if let Some(buffer) = &self.buffer {
            buffer.stop_consuming();
            let remaining = timeout
                .checked_sub(started.elapsed())
                .ok_or(Error::Timeout)?;
            buffer.wait_for_close(remaining).await?;
        }

        if let Some(pipeline) = &self.pipeline {
            pipeline.close_at_leisure();
            let remaining = timeout
                .checked_sub(started.elapsed())
                .ok_or(Error::Timeout)?;
            pipeline.wait_for_close(remaining).await?;
        }

        self.output.close_at_leisure();
        let remaining = timeout
            .checked_sub(started.elapsed())
            .ok_or(Error::Timeout)?;
        self.output.wait_for_close(remaining).await?;

        Ok(())
    }

    /// Close all layers concurrently and wait for each in declaration
    /// order. Attempted only after a graceful stop failed.
    pub async fn stop_unordered(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();

        self.input.close_at_leisure();
        if let Some(buffer) = &self.buffer {
            buffer.close_at_leisure();
        }
        if let Some(pipeline) = &self.pipeline {
            pipeline.close_at_leisure();
        }
        self.output.close_at_leisure();

        self.input.wait_for_close(timeout).await?;

        if let Some(buffer) = &self.buffer {
            let remaining = timeout
                .checked_sub(started.elapsed())
                .ok_or(Error::Timeout)?;
            buffer.wait_for_close(remaining).await?;
        }

        if let Some(pipeline) = &self.pipeline {
            let remaining = timeout
                .checked_sub(started.elapsed())
                .ok_or(Error::Timeout)?;
            pipeline.wait_for_close(remaining).await?;
        }

        let remaining = timeout
            .checked_sub(started.elapsed())
            .ok_or(Error::Timeout)?;
        self.output.wait_for_close(remaining).await?;

        Ok(())
    }

    /// Stop the stream within `timeout`: graceful on three quarters of the
    /// budget, then unordered on the remainder.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let unordered_budget = timeout / 4;
        let graceful_budget = timeout - unordered_budget;

        match self.stop_gracefully(graceful_budget).await {
            Ok(()) => return Ok(()),
            Err(Error::Timeout) => {
                info!("Unable to fully drain buffered messages within target time");
            }
            Err(err) => {
                error!(error = %err, "Encountered error whilst shutting down");
            }
        }

        match self.stop_unordered(unordered_budget).await {
            Ok(()) => Ok(()),
            Err(Error::Timeout) => {
                error!("Failed to stop stream gracefully within target time");
                self.dump_diagnostics();
                Err(Error::Timeout)
            }
            Err(err) => {
                error!(error = %err, "Encountered error whilst shutting down");
                Err(err)
            }
        }
    }

    fn dump_diagnostics(&self) {
        error!(
            input_connected = self.input.connected(),
            output_connected = self.output.connected(),
            has_buffer = self.buffer.is_some(),
            has_pipeline = self.pipeline.is_some(),
            "Stream failed to drain; layers may still hold in-flight transactions"
        );
    }
}
