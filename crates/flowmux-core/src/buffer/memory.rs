//! Volatile in-memory buffer.
//!
//! Whole transactions are queued, so the inbound ack resolves only after
//! the downstream consumer acks: end-to-end semantics are preserved and the
//! queue contents are lost on crash. A full queue refuses inbound receives,
//! which exerts backpressure on the upstream through the rendezvous
//! transaction channel.

use super::Buffer;
use crate::error::{Error, Result};
use crate::shutdown::Signaller;
use crate::transaction::{transaction_channel, Transaction, TransactionRx, TransactionTx};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// Byte-bounded volatile queue of in-flight transactions.
pub struct MemoryBuffer {
    max_bytes: usize,
    transactions: Option<TransactionRx>,
    out_tx: Option<TransactionTx>,
    consuming: bool,
    stop_sig: Signaller,
    shut_sig: Signaller,
}

impl MemoryBuffer {
    /// Create a buffer bounded to `max_bytes` of queued batch data.
    pub fn new(max_bytes: usize) -> Self {
        let (tx, rx) = transaction_channel();
        Self {
            max_bytes,
            transactions: Some(rx),
            out_tx: Some(tx),
            consuming: false,
            stop_sig: Signaller::new(),
            shut_sig: Signaller::new(),
        }
    }
}

#[async_trait]
impl Buffer for MemoryBuffer {
    fn consume(&mut self, transactions: TransactionRx) -> Result<()> {
        if self.consuming {
            return Err(Error::AlreadyConsuming);
        }
        self.consuming = true;

        let out_tx = self.out_tx.take().ok_or(Error::AlreadyConsuming)?;
        tokio::spawn(pump(
            transactions,
            out_tx,
            self.max_bytes,
            self.stop_sig.clone(),
            self.shut_sig.clone(),
        ));
        Ok(())
    }

    fn take_transactions(&mut self) -> Option<TransactionRx> {
        self.transactions.take()
    }

    fn stop_consuming(&self) {
        self.stop_sig.close_at_leisure();
    }

    fn close_at_leisure(&self) {
        self.shut_sig.close_at_leisure();
    }

    async fn wait_for_close(&self, timeout: Duration) -> Result<()> {
        self.shut_sig.wait_for_close(timeout).await
    }
}

async fn pump(
    mut inbound: TransactionRx,
    out_tx: TransactionTx,
    max_bytes: usize,
    stop_sig: Signaller,
    sig: Signaller,
) {
    let mut queue: VecDeque<Transaction> = VecDeque::new();
    let mut queued_bytes = 0usize;
    let mut inbound_open = true;

    loop {
        if sig.should_close_now() {
            break;
        }
        let stopped = stop_sig.should_close_at_leisure() || sig.should_close_at_leisure();
        if (stopped || !inbound_open) && queue.is_empty() {
            break;
        }

        tokio::select! {
            biased;
            _ = sig.closed_now() => break,
            _ = stop_sig.closed_at_leisure(), if !stopped => {}
            _ = sig.closed_at_leisure(), if !stopped => {}
            tr = inbound.recv(), if inbound_open && !stopped && queued_bytes < max_bytes => {
                match tr {
                    Some(tr) => {
                        queued_bytes += tr.payload().size_bytes();
                        queue.push_back(tr);
                    }
                    None => inbound_open = false,
                }
            }
            permit = out_tx.reserve(), if !queue.is_empty() => {
                match permit {
                    Ok(permit) => {
                        let tr = queue.pop_front().expect("guarded non-empty");
                        queued_bytes = queued_bytes.saturating_sub(tr.payload().size_bytes());
                        permit.send(tr);
                    }
                    Err(_) => break,
                }
            }
        }
    }

    if !queue.is_empty() {
        debug!(
            remaining = queue.len(),
            "Memory buffer discarding queued transactions on close"
        );
        for tr in queue.drain(..) {
            tr.resolve(Err(Error::TypeClosed));
        }
    }

    drop(out_tx);
    sig.shutdown_complete();
}
