//! Fallback broker: ordered children tried in sequence per transaction.
//!
//! Each transaction is offered to the first child; on failure a fresh copy
//! is offered to the next, until one succeeds or the list is exhausted and
//! the terminal failure surfaces to the parent.

use super::wait_for_children;
use crate::error::{Error, Result};
use crate::output::StreamedOutput;
use crate::shutdown::Signaller;
use crate::transaction::{transaction_channel, Transaction, TransactionRx, TransactionTx};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Ordered-fallback broker over K child outputs.
pub struct Fallback {
    children: Vec<Box<dyn StreamedOutput>>,
    consuming: bool,
    shut_sig: Signaller,
}

impl Fallback {
    /// Compose the given children, ordered by preference.
    pub fn new(children: Vec<Box<dyn StreamedOutput>>) -> Self {
        Self {
            children,
            consuming: false,
            shut_sig: Signaller::new(),
        }
    }
}

#[async_trait]
impl StreamedOutput for Fallback {
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
    loop {
        let tr = tokio::select! {
            biased;
            _ = sig.closed_at_leisure() => break,
            tr = inbound.recv() => match tr {
                Some(tr) => tr,
                None => break,
            },
        };

        let (batch, ack) = tr.into_parts();
        let mut verdict = Err(Error::TypeClosed);
        for (attempt, tx) in child_txs.iter().enumerate() {
            let (child_tr, reply) = Transaction::new(batch.clone());
            let sent = tokio::select! {
                res = tx.send(child_tr) => res.is_ok(),
                _ = sig.closed_now() => false,
            };
            if !sent {
                break;
            }

            verdict = tokio::select! {
                res = reply => res.unwrap_or(Err(Error::TypeClosed)),
                _ = sig.closed_now() => Err(Error::TypeClosed),
            };
            match &verdict {
                Ok(()) => break,
                Err(err) => {
                    debug!(attempt, error = %err, "Fallback child rejected batch");
                }
            }
        }
        ack.resolve(verdict);
    }

    drop(child_txs);
    sig.shutdown_complete();
}
