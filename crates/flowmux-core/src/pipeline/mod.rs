//! Pipeline layer: an ordered processor chain across parallel worker slots.
//!
//! Processors may emit zero batches (filter), one (map) or several (split).
//! A fully filtered transaction is acked immediately; a split transaction
//! resolves its parent ack through the fan-out aggregator once every
//! resulting batch has been acked downstream. Order through the pipeline is
//! preserved only with a single worker.

mod processor;

pub use processor::Processor;

use crate::error::{Error, Result};
use crate::message::Batch;
use crate::metrics::SharedMetrics;
use crate::shutdown::Signaller;
use crate::transaction::{transaction_channel, Transaction, TransactionRx, TransactionTx};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::trace;

/// Processing layer running an ordered list of processors over M workers.
pub struct Pipeline {
    processors: Arc<Vec<Box<dyn Processor>>>,
    workers: usize,
    metrics: SharedMetrics,
    transactions: Option<TransactionRx>,
    out_tx: Option<TransactionTx>,
    consuming: bool,
    shut_sig: Signaller,
}

impl Pipeline {
    /// Create a pipeline layer. Workers start when `consume` is called.
    pub fn new(
        workers: usize,
        processors: Vec<Box<dyn Processor>>,
        metrics: SharedMetrics,
    ) -> Self {
        let (tx, rx) = transaction_channel();
        Self {
            processors: Arc::new(processors),
            workers: workers.max(1),
            metrics,
            transactions: Some(rx),
            out_tx: Some(tx),
            consuming: false,
            shut_sig: Signaller::new(),
        }
    }

    /// Begin consuming from the given channel. Calling this twice returns
    /// `Error::AlreadyConsuming`.
    pub fn consume(&mut self, transactions: TransactionRx) -> Result<()> {
        if self.consuming {
            return Err(Error::AlreadyConsuming);
        }
        self.consuming = true;

        let out_tx = self.out_tx.take().ok_or(Error::AlreadyConsuming)?;
        let inbound = Arc::new(Mutex::new(transactions));

        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            handles.push(tokio::spawn(worker_loop(
                Arc::clone(&self.processors),
                Arc::clone(&inbound),
                out_tx.clone(),
                self.shut_sig.clone(),
                Arc::clone(&self.metrics),
            )));
        }
        drop(out_tx);

        let sig = self.shut_sig.clone();
        tokio::spawn(async move {
            for handle in handles {
                let _ = handle.await;
            }
            sig.shutdown_complete();
        });
        Ok(())
    }

    /// Hand over the outbound transaction channel. Yields `Some` exactly
    /// once.
    pub fn take_transactions(&mut self) -> Option<TransactionRx> {
        self.transactions.take()
    }

    /// Signal workers to stop accepting new transactions.
    pub fn close_at_leisure(&self) {
        self.shut_sig.close_at_leisure();
    }

    /// Block until all workers have exited. Returns `Error::Timeout` on
    /// expiry.
    pub async fn wait_for_close(&self, timeout: Duration) -> Result<()> {
        self.shut_sig.wait_for_close(timeout).await
    }
}

async fn worker_loop(
    processors: Arc<Vec<Box<dyn Processor>>>,
    inbound: Arc<Mutex<TransactionRx>>,
    out_tx: TransactionTx,
    sig: Signaller,
    metrics: SharedMetrics,
) {
    let m_dropped = metrics.counter("pipeline_dropped");

    loop {
        let tr = tokio::select! {
            biased;
            _ = sig.closed_at_leisure() => return,
            tr = recv_next(&inbound) => match tr {
                Some(tr) => tr,
                None => return,
            },
        };

        let (batch, ack) = tr.into_parts();
        let batches = run_processors(&processors, batch);

        if batches.is_empty() {
            // Fully filtered: early ack, nothing travels further.
            m_dropped.incr(1);
            ack.resolve(Ok(()));
            continue;
        }

        trace!(batches = batches.len(), "Pipeline emitting batches");
        let mut sinks = ack.split(batches.len()).into_iter();
        for batch in batches {
            let sink = sinks.next().expect("one sink per batch");
            let sent = tokio::select! {
                res = out_tx.send(Transaction::with_sink(batch, sink)) => res.is_ok(),
                _ = sig.closed_now() => false,
            };
            if !sent {
                // Remaining sinks drop and nack the parent.
                return;
            }
        }
    }
}

/// Thread a batch through the processor chain. A processor error keeps the
/// input batch alive with per-message error flags instead of dropping it.
fn run_processors(processors: &[Box<dyn Processor>], batch: Batch) -> Vec<Batch> {
    let mut batches = vec![batch];
    for processor in processors {
        let mut next = Vec::with_capacity(batches.len());
        for batch in batches {
            match processor.process(&batch) {
                Ok(produced) => next.extend(produced),
                Err(err) => {
                    let mut flagged = batch;
                    let reason = err.to_string();
                    for msg in flagged.iter_mut() {
                        msg.set_error(reason.clone());
                    }
                    next.push(flagged);
                }
            }
        }
        batches = next;
        if batches.is_empty() {
            break;
        }
    }
    batches
}

async fn recv_next(inbound: &Arc<Mutex<TransactionRx>>) -> Option<Transaction> {
    inbound.lock().await.recv().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::metrics::Metrics;

    struct Upper;
    impl Processor for Upper {
        fn process(&self, batch: &Batch) -> Result<Vec<Batch>> {
            let out = batch
                .iter()
                .map(|m| {
                    Message::new(m.payload().to_ascii_uppercase())
                })
                .collect();
            Ok(vec![out])
        }
    }

    struct DropAll;
    impl Processor for DropAll {
        fn process(&self, _batch: &Batch) -> Result<Vec<Batch>> {
            Ok(Vec::new())
        }
    }

    struct SplitPerMessage;
    impl Processor for SplitPerMessage {
        fn process(&self, batch: &Batch) -> Result<Vec<Batch>> {
            Ok(batch
                .iter()
                .map(|m| Batch::from_payloads([m.payload().to_vec()]))
                .collect())
        }
    }

    struct AlwaysFails;
    impl Processor for AlwaysFails {
        fn process(&self, _batch: &Batch) -> Result<Vec<Batch>> {
            Err(Error::Processing("bad mapping".into()))
        }
    }

    fn new_pipeline(workers: usize, processors: Vec<Box<dyn Processor>>) -> Pipeline {
        Pipeline::new(workers, processors, Metrics::new())
    }

    #[tokio::test]
    async fn test_pipeline_maps_batches() {
        let mut pipeline = new_pipeline(1, vec![Box::new(Upper)]);
        let mut out = pipeline.take_transactions().unwrap();
        let (tx, rx) = transaction_channel();
        pipeline.consume(rx).unwrap();

        let (tr, reply) = Transaction::new(Batch::from_payloads(["foo"]));
        tx.send(tr).await.unwrap();

        let emitted = out.recv().await.unwrap();
        assert_eq!(emitted.payload().get(0).unwrap().payload(), b"FOO");
        emitted.resolve(Ok(()));
        assert_eq!(reply.await.unwrap(), Ok(()));

        drop(tx);
        pipeline
            .wait_for_close(Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pipeline_filter_early_acks() {
        let mut pipeline = new_pipeline(1, vec![Box::new(DropAll)]);
        let mut out = pipeline.take_transactions().unwrap();
        let (tx, rx) = transaction_channel();
        pipeline.consume(rx).unwrap();

        let (tr, reply) = Transaction::new(Batch::from_payloads(["discard-me"]));
        tx.send(tr).await.unwrap();

        // The parent acks without anything reaching the outbound side.
        assert_eq!(reply.await.unwrap(), Ok(()));
        drop(tx);
        assert!(out.recv().await.is_none());

        pipeline
            .wait_for_close(Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pipeline_split_aggregates_acks() {
        let mut pipeline = new_pipeline(1, vec![Box::new(SplitPerMessage)]);
        let mut out = pipeline.take_transactions().unwrap();
        let (tx, rx) = transaction_channel();
        pipeline.consume(rx).unwrap();

        let (tr, reply) = Transaction::new(Batch::from_payloads(["a", "b"]));
        tx.send(tr).await.unwrap();

        let first = out.recv().await.unwrap();
        first.resolve(Ok(()));
        // Parent must not resolve until the second child acks.
        let second = out.recv().await.unwrap();
        second.resolve(Ok(()));
        assert_eq!(reply.await.unwrap(), Ok(()));

        drop(tx);
        pipeline
            .wait_for_close(Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pipeline_processor_error_flags_messages() {
        let mut pipeline = new_pipeline(1, vec![Box::new(AlwaysFails)]);
        let mut out = pipeline.take_transactions().unwrap();
        let (tx, rx) = transaction_channel();
        pipeline.consume(rx).unwrap();

        let (tr, reply) = Transaction::new(Batch::from_payloads(["keep-me"]));
        tx.send(tr).await.unwrap();

        let emitted = out.recv().await.unwrap();
        let msg = emitted.payload().get(0).unwrap();
        assert_eq!(msg.payload(), b"keep-me");
        assert!(msg.error().unwrap().contains("bad mapping"));
        emitted.resolve(Ok(()));
        assert_eq!(reply.await.unwrap(), Ok(()));

        drop(tx);
        pipeline
            .wait_for_close(Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pipeline_duplicate_consume_rejected() {
        let mut pipeline = new_pipeline(1, Vec::new());
        let (_tx, rx) = transaction_channel();
        pipeline.consume(rx).unwrap();
        let (_tx2, rx2) = transaction_channel();
        assert_eq!(pipeline.consume(rx2), Err(Error::AlreadyConsuming));
    }
}
