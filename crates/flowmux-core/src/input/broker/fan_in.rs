//! Fan-in broker: merges the outbound channels of K child inputs into one.
//!
//! Selection among ready children is fair by way of independent forwarder
//! tasks contending on the merged channel. The merged channel closes only
//! after every child channel has closed.

use crate::error::{Error, Result};
use crate::input::StreamedInput;
use crate::shutdown::Signaller;
use crate::transaction::{transaction_channel, TransactionRx};
use async_trait::async_trait;
use std::time::{Duration, Instant};

/// Static fan-in over a fixed set of child inputs.
pub struct FanIn {
    children: Vec<Box<dyn StreamedInput>>,
    transactions: Option<TransactionRx>,
    shut_sig: Signaller,
}

impl FanIn {
    /// Merge the given child inputs. Each child's outbound channel must not
    /// have been taken yet.
    pub fn new(mut children: Vec<Box<dyn StreamedInput>>) -> Result<Self> {
        let (tx, rx) = transaction_channel();
        let shut_sig = Signaller::new();

        let mut forwarders = Vec::with_capacity(children.len());
        for child in children.iter_mut() {
            let mut child_rx = child.take_transactions().ok_or(Error::AlreadyConsuming)?;
            let tx = tx.clone();
            forwarders.push(tokio::spawn(async move {
                while let Some(tr) = child_rx.recv().await {
                    if tx.send(tr).await.is_err() {
                        return;
                    }
                }
            }));
        }
        drop(tx);

        let sig = shut_sig.clone();
        tokio::spawn(async move {
            for forwarder in forwarders {
                let _ = forwarder.await;
            }
            sig.shutdown_complete();
        });

        Ok(Self {
            children,
            transactions: Some(rx),
            shut_sig,
        })
    }
}

#[async_trait]
impl StreamedInput for FanIn {
    fn take_transactions(&mut self) -> Option<TransactionRx> {
        self.transactions.take()
    }

    fn connected(&self) -> bool {
        self.children.iter().all(|c| c.connected())
    }

    fn close_at_leisure(&self) {
        for child in &self.children {
            child.close_at_leisure();
        }
    }

    async fn wait_for_close(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        for child in &self.children {
            let remaining = timeout
                .checked_sub(started.elapsed())
                .ok_or(Error::Timeout)?;
            child.wait_for_close(remaining).await?;
        }
        let remaining = timeout
            .checked_sub(started.elapsed())
            .ok_or(Error::Timeout)?;
        self.shut_sig.wait_for_close(remaining).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Batch;
    use crate::transaction::Transaction;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Test input fed by a hand-held channel.
    struct ChannelInput {
        transactions: Option<TransactionRx>,
        connected: Arc<AtomicBool>,
        shut_sig: Signaller,
    }

    impl ChannelInput {
        fn new() -> (Self, crate::transaction::TransactionTx, Signaller) {
            let (tx, rx) = transaction_channel();
            let shut_sig = Signaller::new();
            let sig = shut_sig.clone();
            (
                Self {
                    transactions: Some(rx),
                    connected: Arc::new(AtomicBool::new(true)),
                    shut_sig,
                },
                tx,
                sig,
            )
        }
    }

    #[async_trait]
    impl StreamedInput for ChannelInput {
        fn take_transactions(&mut self) -> Option<TransactionRx> {
            self.transactions.take()
        }
        fn connected(&self) -> bool {
            self.connected.load(Ordering::Acquire)
        }
        fn close_at_leisure(&self) {
            self.shut_sig.close_at_leisure();
            self.shut_sig.shutdown_complete();
        }
        async fn wait_for_close(&self, timeout: Duration) -> Result<()> {
            self.shut_sig.wait_for_close(timeout).await
        }
    }

    #[tokio::test]
    async fn test_fan_in_merges_children() {
        let (a, tx_a, _) = ChannelInput::new();
        let (b, tx_b, _) = ChannelInput::new();
        let mut broker = FanIn::new(vec![Box::new(a), Box::new(b)]).unwrap();
        let mut merged = broker.take_transactions().unwrap();

        let (tr, reply_a) = Transaction::new(Batch::from_payloads(["from-a"]));
        tx_a.send(tr).await.unwrap();
        let (tr, reply_b) = Transaction::new(Batch::from_payloads(["from-b"]));
        tx_b.send(tr).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let tr = merged.recv().await.unwrap();
            seen.push(
                tr.payload()
                    .get(0)
                    .unwrap()
                    .payload_str()
                    .unwrap()
                    .to_string(),
            );
            tr.resolve(Ok(()));
        }
        seen.sort();
        assert_eq!(seen, ["from-a", "from-b"]);
        assert_eq!(reply_a.await.unwrap(), Ok(()));
        assert_eq!(reply_b.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_fan_in_closes_after_all_children() {
        let (a, tx_a, _) = ChannelInput::new();
        let (b, tx_b, _) = ChannelInput::new();
        let mut broker = FanIn::new(vec![Box::new(a), Box::new(b)]).unwrap();
        let mut merged = broker.take_transactions().unwrap();

        drop(tx_a);
        // One child still open: channel must stay open.
        let pending =
            tokio::time::timeout(Duration::from_millis(50), merged.recv()).await;
        assert!(pending.is_err(), "merged channel closed too early");

        drop(tx_b);
        assert!(merged.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_fan_in_connected_requires_all() {
        let (a, _tx_a, _) = ChannelInput::new();
        let (b, _tx_b, _) = ChannelInput::new();
        let flag = Arc::clone(&b.connected);
        let broker = FanIn::new(vec![Box::new(a), Box::new(b)]).unwrap();

        assert!(broker.connected());
        flag.store(false, Ordering::Release);
        assert!(!broker.connected());
    }
}
