//! Flowmux core - stream multiplexing engine
//!
//! This library provides the transaction-passing substrate that composes a
//! stream out of four layers (Input → Buffer → Pipeline → Output):
//!
//! - At-least-once delivery with explicit backpressure over rendezvous
//!   transaction channels
//! - Async reader and writer adapters wrapping single-call connectors with
//!   reconnect backoff
//! - Fan-in, fan-out, round-robin, greedy and fallback brokers
//! - Tiered graceful→unordered shutdown bounded by a caller deadline

pub mod buffer;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod input;
pub mod message;
pub mod metrics;
pub mod output;
pub mod pipeline;
pub mod retry;
pub mod shutdown;
pub mod stream;
pub mod transaction;

// Re-export commonly used types
pub use config::{BufferConfig, ConnectorConfig, PipelineConfig, StreamConfig};
pub use error::{AckResult, Error, Result};
pub use message::{Batch, Message};
pub use stream::Stream;
pub use transaction::{transaction_channel, AckSink, Transaction};
