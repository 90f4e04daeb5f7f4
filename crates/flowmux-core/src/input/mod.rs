//! Input layer: connector trait, the async reader adapter and input-side
//! brokers.

mod async_reader;
pub mod broker;

pub use async_reader::AsyncReader;

use crate::error::{AckResult, Result};
use crate::message::Batch;
use crate::transaction::TransactionRx;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::time::Duration;

/// Future returned by a connector-level acknowledgement callback.
pub type AckFuture = BoxFuture<'static, Result<()>>;

/// Connector-level acknowledgement callback, invoked exactly once with the
/// batch verdict. Connectors use it to advance offsets, delete queue
/// entries, send protocol-level acks and so on.
pub type AckFn = Box<dyn FnOnce(AckResult) -> AckFuture + Send>;

/// A single-call input connector, wrapped by [`AsyncReader`] to become a
/// producing layer.
#[async_trait]
pub trait Input: Send {
    /// Establish the connection. Called before the first read and again
    /// after every lost connection.
    async fn connect(&mut self) -> Result<()>;

    /// Read the next batch along with its acknowledgement callback.
    ///
    /// Returns `Error::Timeout` when no data is available within the
    /// connector's own bounded wait, `Error::NotConnected` when the
    /// connection was lost, and `Error::TypeClosed` when the connector will
    /// never produce again.
    async fn read_batch(&mut self) -> Result<(Batch, AckFn)>;

    /// Release connector resources. The adapter bounds this call with its
    /// close-now signal.
    async fn close(&mut self) -> Result<()>;
}

/// A producing layer: a closed-over actor emitting transactions.
#[async_trait]
pub trait StreamedInput: Send + Sync {
    /// Hand over the outbound transaction channel. Yields `Some` exactly
    /// once; the channel closes when the layer has fully shut down.
    fn take_transactions(&mut self) -> Option<TransactionRx>;

    /// Whether the layer is currently connected to its source.
    fn connected(&self) -> bool;

    /// Signal the layer to stop accepting new work and drain.
    fn close_at_leisure(&self);

    /// Block until the layer has closed, escalating to close-now shortly
    /// before the deadline. Returns `Error::Timeout` on expiry.
    async fn wait_for_close(&self, timeout: Duration) -> Result<()>;
}

impl std::fmt::Debug for dyn StreamedInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn StreamedInput")
    }
}
