//! Greedy broker: children race for transactions, first free child wins.
//!
//! One forwarder per child contends on the shared inbound channel, so a
//! slow child never holds work back from its idle siblings.

use super::wait_for_children;
use crate::error::{Error, Result};
use crate::output::StreamedOutput;
use crate::shutdown::Signaller;
use crate::transaction::{transaction_channel, Transaction, TransactionRx};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Racing broker over K child outputs.
pub struct Greedy {
    children: Vec<Box<dyn StreamedOutput>>,
    consuming: bool,
    shut_sig: Signaller,
}

impl Greedy {
    /// Compose the given children into a racing output.
    pub fn new(children: Vec<Box<dyn StreamedOutput>>) -> Self {
        Self {
            children,
            consuming: false,
            shut_sig: Signaller::new(),
        }
    }
}

#[async_trait]
impl StreamedOutput for Greedy {
    fn consume(&mut self, transactions: TransactionRx) -> Result<()> {
        if self.consuming {
            return Err(Error::AlreadyConsuming);
        }
        self.consuming = true;

        let inbound = Arc::new(Mutex::new(transactions));
        let mut forwarders = Vec::with_capacity(self.children.len());
        for child in self.children.iter_mut() {
            let (tx, rx) = transaction_channel();
            child.consume(rx)?;

            let inbound = Arc::clone(&inbound);
            let sig = self.shut_sig.clone();
            forwarders.push(tokio::spawn(async move {
                loop {
                    let tr = tokio::select! {
                        biased;
                        _ = sig.closed_at_leisure() => break,
                        tr = recv_next(&inbound) => match tr {
                            Some(tr) => tr,
                            None => break,
                        },
                    };
                    let sent = tokio::select! {
                        res = tx.send(tr) => res.is_ok(),
                        _ = sig.closed_now() => false,
                    };
                    if !sent {
                        break;
                    }
                }
            }));
        }

        let sig = self.shut_sig.clone();
        tokio::spawn(async move {
            for forwarder in forwarders {
                let _ = forwarder.await;
            }
            sig.shutdown_complete();
        });
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

async fn recv_next(inbound: &Arc<Mutex<TransactionRx>>) -> Option<Transaction> {
    inbound.lock().await.recv().await
}
