//! Transactions and acknowledgement plumbing.
//!
//! A transaction pairs a batch travelling forward with a one-shot reply sink
//! travelling backward. Ownership of a transaction transfers atomically with
//! the channel send, and the ack obligation rides with ownership: whoever
//! holds a transaction must resolve or forward it.
//!
//! `AckSink` is consumed on resolution, which rules out double-acks at the
//! type level. A sink dropped without being resolved delivers
//! `Error::TypeClosed` so the obligation is never silently lost.

use crate::error::{AckResult, Error};
use crate::message::Batch;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Sending half of a transaction channel.
pub type TransactionTx = mpsc::Sender<Transaction>;

/// Receiving half of a transaction channel.
pub type TransactionRx = mpsc::Receiver<Transaction>;

/// Create a transaction channel.
///
/// Capacity is a single slot, the closest tokio rendition of a rendezvous
/// channel: a stalled consumer exerts backpressure on the producer after at
/// most one in-flight transaction.
pub fn transaction_channel() -> (TransactionTx, TransactionRx) {
    mpsc::channel(1)
}

/// One-shot reply path carrying the terminal disposition of a transaction.
///
/// Resolution consumes the sink. Dropping an unresolved sink resolves it
/// with `Error::TypeClosed`.
#[derive(Debug)]
pub struct AckSink {
    inner: Option<SinkInner>,
}

#[derive(Debug)]
enum SinkInner {
    Oneshot(oneshot::Sender<AckResult>),
    Shared(Arc<SharedAck>),
}

impl AckSink {
    /// Create a sink together with the receiver that observes its
    /// resolution.
    pub fn new() -> (Self, oneshot::Receiver<AckResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner: Some(SinkInner::Oneshot(tx)),
            },
            rx,
        )
    }

    /// Resolve the sink with the given disposition. Exactly-once is
    /// guaranteed by consumption.
    pub fn resolve(mut self, res: AckResult) {
        if let Some(inner) = self.inner.take() {
            Self::deliver(inner, res);
        }
    }

    /// Split this sink into `n` child sinks whose resolutions are
    /// aggregated: the parent resolves `Ok` iff every child resolved `Ok`,
    /// otherwise with the first observed error, retryable errors taking
    /// precedence over unclassified ones.
    ///
    /// The aggregation is a reference-counted slot, not a task per child;
    /// the parent resolves when the last child resolves or drops.
    pub fn split(mut self, n: usize) -> Vec<AckSink> {
        if n == 0 {
            self.resolve(Ok(()));
            return Vec::new();
        }
        if n == 1 {
            return vec![self];
        }
        let parent = AckSink {
            inner: self.inner.take(),
        };
        let shared = Arc::new(SharedAck {
            first_error: Mutex::new(None),
            parent: Mutex::new(Some(parent)),
        });
        (0..n)
            .map(|_| AckSink {
                inner: Some(SinkInner::Shared(Arc::clone(&shared))),
            })
            .collect()
    }

    fn deliver(inner: SinkInner, res: AckResult) {
        match inner {
            SinkInner::Oneshot(tx) => {
                let _ = tx.send(res);
            }
            SinkInner::Shared(shared) => {
                shared.record(res);
            }
        }
    }
}

impl Drop for AckSink {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            Self::deliver(inner, Err(Error::TypeClosed));
        }
    }
}

/// Reference-counted ack aggregator with a first-error slot.
#[derive(Debug)]
struct SharedAck {
    first_error: Mutex<Option<Error>>,
    parent: Mutex<Option<AckSink>>,
}

impl SharedAck {
    fn record(&self, res: AckResult) {
        if let Err(err) = res {
            let mut slot = self.first_error.lock();
            match &*slot {
                None => *slot = Some(err),
                Some(existing) if err.is_retryable() && !existing.is_retryable() => {
                    *slot = Some(err)
                }
                _ => {}
            }
        }
    }
}

impl Drop for SharedAck {
    fn drop(&mut self) {
        if let Some(parent) = self.parent.get_mut().take() {
            let res = match self.first_error.get_mut().take() {
                Some(err) => Err(err),
                None => Ok(()),
            };
            parent.resolve(res);
        }
    }
}

/// A batch travelling forward paired with its reply sink.
#[derive(Debug)]
pub struct Transaction {
    payload: Batch,
    ack: AckSink,
}

impl Transaction {
    /// Create a transaction with a fresh reply sink, returning the receiver
    /// that observes its resolution.
    pub fn new(payload: Batch) -> (Self, oneshot::Receiver<AckResult>) {
        let (ack, rx) = AckSink::new();
        (Self { payload, ack }, rx)
    }

    /// Create a transaction carrying an existing sink, e.g. a child of an
    /// ack fan-out.
    pub fn with_sink(payload: Batch, ack: AckSink) -> Self {
        Self { payload, ack }
    }

    /// The batch travelling with this transaction.
    pub fn payload(&self) -> &Batch {
        &self.payload
    }

    /// Split the transaction into its batch and sink, transferring the ack
    /// obligation to the caller.
    pub fn into_parts(self) -> (Batch, AckSink) {
        (self.payload, self.ack)
    }

    /// Resolve the transaction without forwarding it.
    pub fn resolve(self, res: AckResult) {
        self.ack.resolve(res);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Batch;

    #[tokio::test]
    async fn test_resolve_ok() {
        let (tr, rx) = Transaction::new(Batch::from_payloads(["foo"]));
        tr.resolve(Ok(()));
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_resolve_err() {
        let (tr, rx) = Transaction::new(Batch::new());
        tr.resolve(Err(Error::Connector("boom".into())));
        assert_eq!(rx.await.unwrap(), Err(Error::Connector("boom".into())));
    }

    #[tokio::test]
    async fn test_drop_without_resolve_is_closed_error() {
        let (tr, rx) = Transaction::new(Batch::new());
        drop(tr);
        assert_eq!(rx.await.unwrap(), Err(Error::TypeClosed));
    }

    #[tokio::test]
    async fn test_split_all_ok() {
        let (sink, rx) = AckSink::new();
        let children = sink.split(3);
        assert_eq!(children.len(), 3);
        for child in children {
            child.resolve(Ok(()));
        }
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_split_first_error_wins() {
        let (sink, rx) = AckSink::new();
        let mut children = sink.split(3);
        children.pop().unwrap().resolve(Ok(()));
        children
            .pop()
            .unwrap()
            .resolve(Err(Error::Connector("first".into())));
        children
            .pop()
            .unwrap()
            .resolve(Err(Error::Connector("second".into())));
        assert_eq!(rx.await.unwrap(), Err(Error::Connector("first".into())));
    }

    #[tokio::test]
    async fn test_split_retryable_takes_precedence() {
        let (sink, rx) = AckSink::new();
        let mut children = sink.split(2);
        children
            .pop()
            .unwrap()
            .resolve(Err(Error::Connector("permanent".into())));
        children.pop().unwrap().resolve(Err(Error::NotConnected));
        assert_eq!(rx.await.unwrap(), Err(Error::NotConnected));
    }

    #[tokio::test]
    async fn test_split_zero_resolves_immediately() {
        let (sink, rx) = AckSink::new();
        assert!(sink.split(0).is_empty());
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_split_child_dropped_is_failure() {
        let (sink, rx) = AckSink::new();
        let mut children = sink.split(2);
        children.pop().unwrap().resolve(Ok(()));
        children.pop();
        assert_eq!(rx.await.unwrap(), Err(Error::TypeClosed));
    }
}
