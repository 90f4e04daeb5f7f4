//! Buffer layer: optional store-and-forward between the input and the rest
//! of the stream.
//!
//! A buffer is a consumer on one side and a producer on the other. The two
//! provided regimes make opposite acknowledgement trade-offs, documented on
//! each implementation: [`MemoryBuffer`] preserves end-to-end acks,
//! [`SpoolBuffer`] trades them for local durability.

mod memory;
mod spool;

pub use memory::MemoryBuffer;
pub use spool::{SpoolBuffer, SpoolConfig};

use crate::error::Result;
use crate::transaction::TransactionRx;
use async_trait::async_trait;
use std::time::Duration;

/// Store-and-forward layer between a producer and a consumer.
#[async_trait]
pub trait Buffer: Send + Sync {
    /// Begin consuming from the given channel. Calling this twice returns
    /// `Error::AlreadyConsuming`.
    fn consume(&mut self, transactions: TransactionRx) -> Result<()>;

    /// Hand over the outbound transaction channel. Yields `Some` exactly
    /// once.
    fn take_transactions(&mut self) -> Option<TransactionRx>;

    /// Stop accepting inbound transactions while continuing to drain to the
    /// downstream consumer.
    fn stop_consuming(&self);

    /// Signal the buffer to stop accepting and drain.
    fn close_at_leisure(&self);

    /// Block until the buffer has closed, escalating to close-now shortly
    /// before the deadline. Returns `Error::Timeout` on expiry.
    async fn wait_for_close(&self, timeout: Duration) -> Result<()>;
}
