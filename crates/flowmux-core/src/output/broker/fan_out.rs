//! Fan-out broker: every transaction is delivered to all children.
//!
//! Each inbound batch is deep-copied per child and the parent ack resolves
//! through the reference-counted aggregator: `Ok` only when every child
//! acked `Ok`.

use super::wait_for_children;
use crate::error::{Error, Result};
use crate::output::StreamedOutput;
use crate::shutdown::Signaller;
use crate::transaction::{transaction_channel, Transaction, TransactionRx, TransactionTx};
use async_trait::async_trait;
use std::time::Duration;

/// Broadcast broker over K child outputs.
pub struct FanOut {
    children: Vec<Box<dyn StreamedOutput>>,
    consuming: bool,
    shut_sig: Signaller,
}

impl FanOut {
    /// Compose the given children into a broadcasting output.
    pub fn new(children: Vec<Box<dyn StreamedOutput>>) -> Self {
        Self {
            children,
            consuming: false,
            shut_sig: Signaller::new(),
        }
    }
}

#[async_trait]
impl StreamedOutput for FanOut {
    fn consume(&mut self, transactions: TransactionRx) -> Result<()> {
        if self.consuming {
            return Err(Error::AlreadyConsuming);
        }
        self.consuming = true;

        let mut child_txs = Vec::with_capacity(self.children.len());
        for child in self.children.iter_mut() {
            let (tx, rx) = transaction_channel();
            child.consume(rx)?;
            child_txs.push(tx);
        }

        tokio::spawn(pump(transactions, child_txs, self.shut_sig.clone()));
        Ok(())
    }

    fn connected(&self) -> bool {
        self.children.iter().all(|c| c.connected())
    }

    fn close_at_leisure(&self) {
        self.shut_sig.close_at_leisure();
    }

    async fn wait_for_close(&self, timeout: Duration) -> Result<()> {
        wait_for_children(&self.shut_sig, &self.children, timeout).await
    }
}

async fn pump(mut inbound: TransactionRx, child_txs: Vec<TransactionTx>, sig: Signaller) {
    let k = child_txs.len();
    'outer: loop {
        let tr = tokio::select! {
            biased;
            _ = sig.closed_at_leisure() => break,
            tr = inbound.recv() => match tr {
                Some(tr) => tr,
                None => break,
            },
        };

        let (mut batch, ack) = tr.into_parts();
        let mut sinks = ack.split(k).into_iter();
        for (i, tx) in child_txs.iter().enumerate() {
            let sink = sinks.next().expect("one sink per child");
            let copy = if i + 1 == k {
                std::mem::take(&mut batch)
            } else {
                batch.clone()
            };
            let sent = tokio::select! {
                res = tx.send(Transaction::with_sink(copy, sink)) => res.is_ok(),
                _ = sig.closed_now() => false,
            };
            if !sent {
                // Remaining sinks drop here and nack the parent.
                break 'outer;
            }
        }
    }

    drop(child_txs);
    sig.shutdown_complete();
}
