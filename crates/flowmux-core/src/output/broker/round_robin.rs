//! Round-robin broker: transactions are handed to children in rotation.
//!
//! The index advances on every transaction regardless of the child's
//! verdict; failures surface to the parent unchanged, the broker never
//! retries on a sibling.

use super::wait_for_children;
use crate::error::{Error, Result};
use crate::output::StreamedOutput;
use crate::shutdown::Signaller;
use crate::transaction::{transaction_channel, TransactionRx, TransactionTx};
use async_trait::async_trait;
use std::time::Duration;

/// Rotating broker over K child outputs.
pub struct RoundRobin {
    children: Vec<Box<dyn StreamedOutput>>,
    consuming: bool,
    shut_sig: Signaller,
}

impl RoundRobin {
    /// Compose the given children into a rotating output.
    pub fn new(children: Vec<Box<dyn StreamedOutput>>) -> Self {
        Self {
            children,
            consuming: false,
            shut_sig: Signaller::new(),
        }
    }
}

#[async_trait]
impl StreamedOutput for RoundRobin {
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
    let mut index = 0usize;
    loop {
        let tr = tokio::select! {
            biased;
            _ = sig.closed_at_leisure() => break,
            tr = inbound.recv() => match tr {
                Some(tr) => tr,
                None => break,
            },
        };

        let tx = &child_txs[index % child_txs.len()];
        index = index.wrapping_add(1);

        let sent = tokio::select! {
            res = tx.send(tr) => res.is_ok(),
            _ = sig.closed_now() => false,
        };
        if !sent {
            break;
        }
    }

    drop(child_txs);
    sig.shutdown_complete();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Batch;
    use crate::output::broker::tests::CollectingOutput;
    use crate::transaction::Transaction;

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let (a, seen_a) = CollectingOutput::succeeding();
        let (b, seen_b) = CollectingOutput::succeeding();
        let mut broker = RoundRobin::new(vec![Box::new(a), Box::new(b)]);

        let (tx, rx) = transaction_channel();
        broker.consume(rx).unwrap();

        for payload in ["one", "two", "three", "four"] {
            let (tr, reply) = Transaction::new(Batch::from_payloads([payload]));
            tx.send(tr).await.unwrap();
            assert_eq!(reply.await.unwrap(), Ok(()));
        }

        assert_eq!(seen_a.lock().len(), 2);
        assert_eq!(seen_b.lock().len(), 2);
        assert_eq!(seen_a.lock()[0].get(0).unwrap().payload(), b"one");
        assert_eq!(seen_b.lock()[0].get(0).unwrap().payload(), b"two");

        drop(tx);
        broker.wait_for_close(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_round_robin_failure_surfaces_and_rotation_continues() {
        let (bad, _) = CollectingOutput::failing(Error::Connector("nope".into()));
        let (good, seen_good) = CollectingOutput::succeeding();
        let mut broker = RoundRobin::new(vec![Box::new(bad), Box::new(good)]);

        let (tx, rx) = transaction_channel();
        broker.consume(rx).unwrap();

        let (tr, reply) = Transaction::new(Batch::from_payloads(["a"]));
        tx.send(tr).await.unwrap();
        assert_eq!(reply.await.unwrap(), Err(Error::Connector("nope".into())));

        let (tr, reply) = Transaction::new(Batch::from_payloads(["b"]));
        tx.send(tr).await.unwrap();
        assert_eq!(reply.await.unwrap(), Ok(()));
        assert_eq!(seen_good.lock().len(), 1);

        drop(tx);
        broker.wait_for_close(Duration::from_secs(5)).await.unwrap();
    }
}
