//! Output layer: connector trait, the async writer adapter and output-side
//! brokers.

mod async_writer;
pub mod broker;

pub use async_writer::AsyncWriter;

use crate::error::Result;
use crate::message::Batch;
use crate::transaction::TransactionRx;
use async_trait::async_trait;
use std::time::Duration;

/// A single-call output connector, wrapped by [`AsyncWriter`] to become a
/// consuming layer.
///
/// Methods take `&self` so that parallel writer workers can share one
/// connector; implementations synchronise internally where they must.
#[async_trait]
pub trait Output: Send + Sync {
    /// Establish the connection. Called before the first write and again
    /// after every lost connection.
    async fn connect(&self) -> Result<()>;

    /// Write one batch. `Error::NotConnected` marks the connection lost and
    /// the batch is retried after reconnecting; `Error::TypeClosed`
    /// terminates the worker; any other error is surfaced to the
    /// transaction's ack sink.
    async fn write_batch(&self, batch: &Batch) -> Result<()>;

    /// Release connector resources. The adapter bounds this call with its
    /// close-now signal.
    async fn close(&self) -> Result<()>;
}

/// A consuming layer: reads transactions from an inbound channel and
/// resolves their acks.
#[async_trait]
pub trait StreamedOutput: Send + Sync {
    /// Begin consuming from the given channel. Calling this twice is a
    /// contract violation and returns `Error::AlreadyConsuming`.
    fn consume(&mut self, transactions: TransactionRx) -> Result<()>;

    /// Whether the layer is currently connected to its sink.
    fn connected(&self) -> bool;

    /// Signal the layer to stop accepting new work and finish in-flight
    /// writes.
    fn close_at_leisure(&self);

    /// Block until the layer has closed, escalating to close-now shortly
    /// before the deadline. Returns `Error::Timeout` on expiry.
    async fn wait_for_close(&self, timeout: Duration) -> Result<()>;
}
