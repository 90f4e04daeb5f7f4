//! Connector registry and the built-in connector and processor set.
//!
//! The registry is populated before stream construction and maps the `type`
//! field of connector sections onto constructors. Built-ins cover local
//! development and testing (generate, file, stdout, discard); protocol
//! connectors register through the same table.

use async_trait::async_trait;
use flowmux_core::buffer::{Buffer, MemoryBuffer, SpoolBuffer, SpoolConfig};
use flowmux_core::endpoints::EndpointRegistry;
use flowmux_core::error::{Error, Result};
use flowmux_core::input::broker::{DynamicFanIn, FanIn};
use flowmux_core::input::{AckFn, AsyncReader, Input, StreamedInput};
use flowmux_core::message::{Batch, Message};
use flowmux_core::metrics::SharedMetrics;
use flowmux_core::output::broker::{Fallback, FanOut, Greedy, RoundRobin};
use flowmux_core::output::{AsyncWriter, Output, StreamedOutput};
use flowmux_core::pipeline::{Pipeline, Processor};
use flowmux_core::retry::BackoffConfig;
use flowmux_core::{BufferConfig, ConnectorConfig, PipelineConfig};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write as IoWrite;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Everything a constructor needs besides its own section. Carries the
/// registry so broker constructors can build their children through it.
#[derive(Clone)]
pub struct BuildContext {
    pub metrics: SharedMetrics,
    pub backoff: BackoffConfig,
    pub endpoints: Arc<EndpointRegistry>,
    pub registry: Arc<ConnectorRegistry>,
}

type InputCtor = fn(&ConnectorConfig, &BuildContext) -> Result<Box<dyn StreamedInput>>;
type OutputCtor = fn(&ConnectorConfig, &BuildContext) -> Result<Box<dyn StreamedOutput>>;
type ProcessorCtor = fn(&ConnectorConfig) -> Result<Box<dyn Processor>>;

/// Process-wide registry mapping connector types to constructors.
pub struct ConnectorRegistry {
    inputs: HashMap<&'static str, InputCtor>,
    outputs: HashMap<&'static str, OutputCtor>,
    processors: HashMap<&'static str, ProcessorCtor>,
}

impl ConnectorRegistry {
    /// Registry with all built-in connectors and processors.
    pub fn with_defaults() -> Arc<Self> {
        let mut inputs: HashMap<&'static str, InputCtor> = HashMap::new();
        inputs.insert("generate", build_generate_input);
        inputs.insert("file", build_file_input);
        inputs.insert("fan_in", build_fan_in_input);
        inputs.insert("dynamic", build_dynamic_input);

        let mut outputs: HashMap<&'static str, OutputCtor> = HashMap::new();
        outputs.insert("stdout", build_stdout_output);
        outputs.insert("file", build_file_output);
        outputs.insert("discard", build_discard_output);
        outputs.insert("fan_out", build_fan_out_output);
        outputs.insert("round_robin", build_round_robin_output);
        outputs.insert("greedy", build_greedy_output);
        outputs.insert("fallback", build_fallback_output);

        let mut processors: HashMap<&'static str, ProcessorCtor> = HashMap::new();
        processors.insert("mapping_upper", build_upper_processor);
        processors.insert("filter_empty", build_filter_empty_processor);

        Arc::new(Self {
            inputs,
            outputs,
            processors,
        })
    }

    /// Build an input layer from its section.
    pub fn build_input(
        &self,
        conf: &ConnectorConfig,
        ctx: &BuildContext,
    ) -> Result<Box<dyn StreamedInput>> {
        let ctor = self
            .inputs
            .get(conf.kind.as_str())
            .ok_or_else(|| Error::Config(format!("unknown input type: {}", conf.kind)))?;
        ctor(conf, ctx)
    }

    /// Build an output layer from its section.
    pub fn build_output(
        &self,
        conf: &ConnectorConfig,
        ctx: &BuildContext,
    ) -> Result<Box<dyn StreamedOutput>> {
        let ctor = self
            .outputs
            .get(conf.kind.as_str())
            .ok_or_else(|| Error::Config(format!("unknown output type: {}", conf.kind)))?;
        ctor(conf, ctx)
    }

    /// Build a processor from its section.
    pub fn build_processor(&self, conf: &ConnectorConfig) -> Result<Box<dyn Processor>> {
        let ctor = self
            .processors
            .get(conf.kind.as_str())
            .ok_or_else(|| Error::Config(format!("unknown processor type: {}", conf.kind)))?;
        ctor(conf)
    }

    /// Build the optional pipeline layer; an empty processor list omits it.
    pub fn build_pipeline(
        &self,
        conf: &PipelineConfig,
        ctx: &BuildContext,
    ) -> Result<Option<Pipeline>> {
        if conf.processors.is_empty() {
            return Ok(None);
        }
        let processors = conf
            .processors
            .iter()
            .map(|p| self.build_processor(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Pipeline::new(
            conf.workers,
            processors,
            Arc::clone(&ctx.metrics),
        )))
    }

    /// Build the optional buffer layer; type `none` omits it.
    pub fn build_buffer(&self, conf: &BufferConfig) -> Result<Option<Box<dyn Buffer>>> {
        match conf {
            BufferConfig::None => Ok(None),
            BufferConfig::Memory { max_bytes } => Ok(Some(Box::new(MemoryBuffer::new(*max_bytes)))),
            BufferConfig::Spool { dir } => {
                let spool = SpoolBuffer::open(SpoolConfig {
                    dir: dir.clone(),
                    redelivery_backoff: BackoffConfig::default(),
                })?;
                Ok(Some(Box::new(spool)))
            }
        }
    }

    /// Whether the given input type is registered.
    pub fn has_input(&self, kind: &str) -> bool {
        self.inputs.contains_key(kind)
    }

    /// Whether the given output type is registered.
    pub fn has_output(&self, kind: &str) -> bool {
        self.outputs.contains_key(kind)
    }

    /// Whether the given processor type is registered.
    pub fn has_processor(&self, kind: &str) -> bool {
        self.processors.contains_key(kind)
    }
}

fn child_configs(conf: &ConnectorConfig, key: &str) -> Result<Vec<ConnectorConfig>> {
    let value = conf
        .params
        .get(key)
        .ok_or_else(|| Error::Config(format!("{} broker requires a '{key}' list", conf.kind)))?;
    let children = value
        .as_array()
        .ok_or_else(|| Error::Config(format!("'{key}' must be an array of connector tables")))?;
    children
        .iter()
        .map(|child| {
            child
                .clone()
                .try_into::<ConnectorConfig>()
                .map_err(|e| Error::Config(e.to_string()))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Emits a fixed payload on an interval, optionally a bounded number of
/// times.
struct GenerateInput {
    interval: Duration,
    payload: Vec<u8>,
    remaining: Option<u64>,
}

#[async_trait]
impl Input for GenerateInput {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read_batch(&mut self) -> Result<(Batch, AckFn)> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Err(Error::TypeClosed);
            }
            *remaining -= 1;
        }
        tokio::time::sleep(self.interval).await;
        let batch = Batch::from_payloads([self.payload.clone()]);
        let ack_fn: AckFn = Box::new(|_res| async { Ok(()) }.boxed());
        Ok((batch, ack_fn))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn build_generate_input(
    conf: &ConnectorConfig,
    ctx: &BuildContext,
) -> Result<Box<dyn StreamedInput>> {
    let interval = Duration::from_millis(conf.param_int("interval_ms").unwrap_or(1_000) as u64);
    let payload = conf.param_str("payload").unwrap_or("{}").as_bytes().to_vec();
    let remaining = conf.param_int("count").and_then(|c| {
        if c > 0 {
            Some(c as u64)
        } else {
            None
        }
    });
    let input = GenerateInput {
        interval,
        payload,
        remaining,
    };
    Ok(Box::new(AsyncReader::new(
        "generate",
        input,
        Arc::clone(&ctx.metrics),
        ctx.backoff.clone(),
    )))
}

/// Reads a file line by line, one message per line, then closes.
struct FileInput {
    path: PathBuf,
    lines: Option<std::collections::VecDeque<String>>,
}

#[async_trait]
impl Input for FileInput {
    async fn connect(&mut self) -> Result<()> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| Error::Connector(format!("failed to open {}: {e}", self.path.display())))?;
        self.lines = Some(content.lines().map(str::to_string).collect());
        Ok(())
    }

    async fn read_batch(&mut self) -> Result<(Batch, AckFn)> {
        let lines = self.lines.as_mut().ok_or(Error::NotConnected)?;
        let Some(line) = lines.pop_front() else {
            return Err(Error::TypeClosed);
        };
        let batch = Batch::from_payloads([line.into_bytes()]);
        let ack_fn: AckFn = Box::new(|_res| async { Ok(()) }.boxed());
        Ok((batch, ack_fn))
    }

    async fn close(&mut self) -> Result<()> {
        self.lines = None;
        Ok(())
    }
}

fn build_file_input(
    conf: &ConnectorConfig,
    ctx: &BuildContext,
) -> Result<Box<dyn StreamedInput>> {
    let path = conf
        .param_str("path")
        .ok_or_else(|| Error::Config("file input requires a 'path'".into()))?;
    let input = FileInput {
        path: PathBuf::from(path),
        lines: None,
    };
    Ok(Box::new(AsyncReader::new(
        "file",
        input,
        Arc::clone(&ctx.metrics),
        ctx.backoff.clone(),
    )))
}

fn build_fan_in_input(
    conf: &ConnectorConfig,
    ctx: &BuildContext,
) -> Result<Box<dyn StreamedInput>> {
    let children = child_configs(conf, "inputs")?
        .iter()
        .map(|child| ctx.registry.build_input(child, ctx))
        .collect::<Result<Vec<_>>>()?;
    if children.is_empty() {
        return Err(Error::Config("fan_in broker requires at least one input".into()));
    }
    Ok(Box::new(FanIn::new(children)?))
}

fn build_dynamic_input(
    conf: &ConnectorConfig,
    ctx: &BuildContext,
) -> Result<Box<dyn StreamedInput>> {
    let builder_ctx = ctx.clone();
    let broker = DynamicFanIn::new(Arc::new(move |_name, body| {
        let child: ConnectorConfig =
            toml::from_str(body).map_err(|e| Error::Config(e.to_string()))?;
        builder_ctx.registry.build_input(&child, &builder_ctx)
    }));

    // Seed any children declared inline in the config.
    if let Some(value) = conf.params.get("inputs") {
        let table = value
            .as_table()
            .ok_or_else(|| Error::Config("'inputs' must be a table of connector tables".into()))?;
        for (name, child) in table {
            let body = toml::to_string(child).map_err(|e| Error::Config(e.to_string()))?;
            broker.set_input(name, &body)?;
        }
    }

    broker.register_endpoints(&ctx.endpoints);
    Ok(Box::new(broker))
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Writes each message as a line on stdout.
struct StdoutOutput;

#[async_trait]
impl Output for StdoutOutput {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn write_batch(&self, batch: &Batch) -> Result<()> {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        for msg in batch.iter() {
            lock.write_all(msg.payload())
                .and_then(|_| lock.write_all(b"\n"))
                .map_err(|e| Error::Connector(format!("stdout write failed: {e}")))?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Appends each message as a line to a file.
struct FileOutput {
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
}

#[async_trait]
impl Output for FileOutput {
    async fn connect(&self) -> Result<()> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::Connector(format!("failed to open {}: {e}", self.path.display())))?;
        *self.file.lock() = Some(file);
        Ok(())
    }

    async fn write_batch(&self, batch: &Batch) -> Result<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(Error::NotConnected)?;
        for msg in batch.iter() {
            file.write_all(msg.payload())
                .and_then(|_| file.write_all(b"\n"))
                .map_err(|e| Error::Connector(format!("file write failed: {e}")))?;
        }
        file.flush()
            .map_err(|e| Error::Connector(format!("file flush failed: {e}")))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.file.lock().take();
        Ok(())
    }
}

/// Accepts and forgets everything.
struct DiscardOutput;

#[async_trait]
impl Output for DiscardOutput {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }
    async fn write_batch(&self, _batch: &Batch) -> Result<()> {
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn wrap_writer(
    type_str: &str,
    conf: &ConnectorConfig,
    output: impl Output + 'static,
    ctx: &BuildContext,
) -> Box<dyn StreamedOutput> {
    Box::new(AsyncWriter::new(
        type_str,
        conf.workers,
        output,
        Arc::clone(&ctx.metrics),
        ctx.backoff.clone(),
    ))
}

fn build_stdout_output(
    conf: &ConnectorConfig,
    ctx: &BuildContext,
) -> Result<Box<dyn StreamedOutput>> {
    Ok(wrap_writer("stdout", conf, StdoutOutput, ctx))
}

fn build_file_output(
    conf: &ConnectorConfig,
    ctx: &BuildContext,
) -> Result<Box<dyn StreamedOutput>> {
    let path = conf
        .param_str("path")
        .ok_or_else(|| Error::Config("file output requires a 'path'".into()))?;
    let output = FileOutput {
        path: PathBuf::from(path),
        file: Mutex::new(None),
    };
    Ok(wrap_writer("file", conf, output, ctx))
}

fn build_discard_output(
    conf: &ConnectorConfig,
    ctx: &BuildContext,
) -> Result<Box<dyn StreamedOutput>> {
    Ok(wrap_writer("discard", conf, DiscardOutput, ctx))
}

fn broker_children(
    conf: &ConnectorConfig,
    ctx: &BuildContext,
) -> Result<Vec<Box<dyn StreamedOutput>>> {
    let children = child_configs(conf, "outputs")?
        .iter()
        .map(|child| ctx.registry.build_output(child, ctx))
        .collect::<Result<Vec<_>>>()?;
    if children.is_empty() {
        return Err(Error::Config(format!(
            "{} broker requires at least one output",
            conf.kind
        )));
    }
    Ok(children)
}

fn build_fan_out_output(
    conf: &ConnectorConfig,
    ctx: &BuildContext,
) -> Result<Box<dyn StreamedOutput>> {
    Ok(Box::new(FanOut::new(broker_children(conf, ctx)?)))
}

fn build_round_robin_output(
    conf: &ConnectorConfig,
    ctx: &BuildContext,
) -> Result<Box<dyn StreamedOutput>> {
    Ok(Box::new(RoundRobin::new(broker_children(conf, ctx)?)))
}

fn build_greedy_output(
    conf: &ConnectorConfig,
    ctx: &BuildContext,
) -> Result<Box<dyn StreamedOutput>> {
    Ok(Box::new(Greedy::new(broker_children(conf, ctx)?)))
}

fn build_fallback_output(
    conf: &ConnectorConfig,
    ctx: &BuildContext,
) -> Result<Box<dyn StreamedOutput>> {
    Ok(Box::new(Fallback::new(broker_children(conf, ctx)?)))
}

// ---------------------------------------------------------------------------
// Processors
// ---------------------------------------------------------------------------

/// Uppercases every payload.
struct UpperProcessor;

impl Processor for UpperProcessor {
    fn process(&self, batch: &Batch) -> Result<Vec<Batch>> {
        let out: Batch = batch
            .iter()
            .map(|m| {
                let mut msg = Message::new(m.payload().to_ascii_uppercase());
                for (k, v) in m.metadata_iter() {
                    msg.set_metadata(k, v);
                }
                msg
            })
            .collect();
        Ok(vec![out])
    }
}

/// Drops messages with empty payloads; a batch emptied entirely is filtered
/// out.
struct FilterEmptyProcessor;

impl Processor for FilterEmptyProcessor {
    fn process(&self, batch: &Batch) -> Result<Vec<Batch>> {
        let kept: Batch = batch
            .iter()
            .filter(|m| !m.payload().is_empty())
            .cloned()
            .collect();
        if kept.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(vec![kept])
        }
    }
}

fn build_upper_processor(_conf: &ConnectorConfig) -> Result<Box<dyn Processor>> {
    Ok(Box::new(UpperProcessor))
}

fn build_filter_empty_processor(_conf: &ConnectorConfig) -> Result<Box<dyn Processor>> {
    Ok(Box::new(FilterEmptyProcessor))
}
