//! Async reader adapter: wraps a single-call input connector as a producing
//! layer with connect backoff, ack tracking and cooperative shutdown.
//!
//! A single dedicated actor owns the connector. Reconnection is an explicit
//! state in the loop rather than error-handler fallout, so connection churn
//! is observable through the `input_connection_*` counters.

use super::{Input, StreamedInput};
use crate::error::{Error, Result};
use crate::metrics::SharedMetrics;
use crate::retry::{Backoff, BackoffConfig};
use crate::shutdown::Signaller;
use crate::transaction::{transaction_channel, Transaction, TransactionRx, TransactionTx};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, trace, Instrument};

/// Producing layer wrapping an [`Input`] connector.
pub struct AsyncReader {
    connected: Arc<AtomicBool>,
    transactions: Option<TransactionRx>,
    shut_sig: Signaller,
}

impl AsyncReader {
    /// Wrap a connector and start its read loop.
    pub fn new(
        type_str: impl Into<String>,
        input: impl Input + 'static,
        metrics: SharedMetrics,
        backoff: BackoffConfig,
    ) -> Self {
        let (tx, rx) = transaction_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let shut_sig = Signaller::new();

        tokio::spawn(read_loop(
            type_str.into(),
            Box::new(input),
            tx,
            shut_sig.clone(),
            Arc::clone(&connected),
            metrics,
            Backoff::new(backoff),
        ));

        Self {
            connected,
            transactions: Some(rx),
            shut_sig,
        }
    }
}

#[async_trait]
impl StreamedInput for AsyncReader {
    fn take_transactions(&mut self) -> Option<TransactionRx> {
        self.transactions.take()
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn close_at_leisure(&self) {
        self.shut_sig.close_at_leisure();
    }

    async fn wait_for_close(&self, timeout: Duration) -> Result<()> {
        self.shut_sig.wait_for_close(timeout).await
    }
}

async fn read_loop(
    type_str: String,
    mut input: Box<dyn Input>,
    tx: TransactionTx,
    sig: Signaller,
    connected: Arc<AtomicBool>,
    metrics: SharedMetrics,
    mut boff: Backoff,
) {
    let m_rcvd = metrics.counter("input_received");
    let m_conn = metrics.counter("input_connection_up");
    let m_failed_conn = metrics.counter("input_connection_failed");
    let m_lost_conn = metrics.counter("input_connection_lost");
    let m_latency = metrics.timer("input_latency_ns");

    // Ack waiters each hold a clone of this sender; recv returns None once
    // every waiter has finished.
    let (ack_guard, mut ack_drained) = mpsc::channel::<()>(1);

    'run: {
        if !init_connection(&type_str, &mut input, &sig, &mut boff, &m_failed_conn).await {
            break 'run;
        }
        m_conn.incr(1);
        connected.store(true, Ordering::Release);

        loop {
            let read_res = tokio::select! {
                res = input.read_batch() => res,
                _ = sig.closed_at_leisure() => break 'run,
            };

            let (batch, ack_fn) = match read_res {
                Ok(accepted) => accepted,
                Err(Error::NotConnected) => {
                    m_lost_conn.incr(1);
                    connected.store(false, Ordering::Release);
                    if !init_connection(&type_str, &mut input, &sig, &mut boff, &m_failed_conn)
                        .await
                    {
                        break 'run;
                    }
                    m_conn.incr(1);
                    connected.store(true, Ordering::Release);
                    continue;
                }
                Err(Error::TypeClosed) => break 'run,
                Err(err) => {
                    if err != Error::Timeout {
                        error!(input = %type_str, error = %err, "Failed to read batch");
                    }
                    tokio::select! {
                        _ = sleep(boff.next_delay()) => continue,
                        _ = sig.closed_at_leisure() => break 'run,
                    }
                }
            };

            boff.reset();
            m_rcvd.incr(batch.len() as u64);
            trace!(input = %type_str, messages = batch.len(), "Consumed batch");

            let started = Instant::now();
            let (transaction, reply) = Transaction::new(batch);

            let sent = tokio::select! {
                res = tx.send(transaction) => res,
                _ = sig.closed_at_leisure() => break 'run,
            };
            if sent.is_err() {
                // Downstream is gone; refuse the batch so the connector can
                // redeliver, bounded in case close-now is already raised.
                let nack = ack_fn(Err(Error::TypeClosed));
                tokio::select! {
                    _ = nack => {}
                    _ = sig.closed_now() => {}
                }
                break 'run;
            }

            let guard = ack_guard.clone();
            let waiter_sig = sig.clone();
            let latency = m_latency.clone();
            let waiter_type = type_str.clone();
            let span = tracing::trace_span!("input_batch", input = %type_str);
            tokio::spawn(
                async move {
                    let _guard = guard;

                    // Even while the stream terminates we still try to
                    // observe the reply from in-transit batches, but never
                    // past close-now.
                    let verdict = tokio::select! {
                        res = reply => res.unwrap_or(Err(Error::TypeClosed)),
                        _ = waiter_sig.closed_now() => return,
                    };
                    latency.record(started.elapsed());

                    tokio::select! {
                        res = ack_fn(verdict) => {
                            if let Err(err) = res {
                                error!(input = %waiter_type, error = %err, "Failed to acknowledge batch");
                            }
                        }
                        _ = waiter_sig.closed_now() => {}
                    }
                }
                .instrument(span),
            );
        }
    }

    debug!(input = %type_str, "Waiting for pending acks to resolve before shutting down");
    drop(ack_guard);
    let _ = ack_drained.recv().await;
    debug!(input = %type_str, "Pending acks resolved");

    tokio::select! {
        res = input.close() => {
            if let Err(err) = res {
                error!(input = %type_str, error = %err, "Failed to close input connector");
            }
        }
        _ = sig.closed_now() => {}
    }

    connected.store(false, Ordering::Release);
    drop(tx);
    sig.shutdown_complete();
}

/// Connect with exponential backoff until success or shutdown. Returns
/// false when the loop should terminate instead of producing.
async fn init_connection(
    type_str: &str,
    input: &mut Box<dyn Input>,
    sig: &Signaller,
    boff: &mut Backoff,
    m_failed_conn: &crate::metrics::Counter,
) -> bool {
    loop {
        let res = tokio::select! {
            res = input.connect() => res,
            _ = sig.closed_at_leisure() => return false,
        };
        match res {
            Ok(()) => {
                boff.reset();
                return true;
            }
            Err(Error::TypeClosed) => return false,
            Err(err) => {
                if sig.should_close_at_leisure() {
                    return false;
                }
                error!(input = %type_str, error = %err, "Failed to connect");
                m_failed_conn.incr(1);
                tokio::select! {
                    _ = sleep(boff.next_delay()) => {}
                    _ = sig.closed_at_leisure() => return false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AckResult;
    use crate::input::AckFn;
    use crate::message::Batch;
    use crate::metrics::Metrics;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Scripted connector: pops pre-baked connect and read results.
    struct MockInput {
        connects: Arc<Mutex<VecDeque<Result<()>>>>,
        reads: Arc<Mutex<VecDeque<Result<Batch>>>>,
        acks: Arc<Mutex<Vec<AckResult>>>,
        connect_calls: Arc<Mutex<u32>>,
    }

    impl MockInput {
        fn new(
            connects: Vec<Result<()>>,
            reads: Vec<Result<Batch>>,
        ) -> (Self, Arc<Mutex<Vec<AckResult>>>, Arc<Mutex<u32>>) {
            let acks = Arc::new(Mutex::new(Vec::new()));
            let connect_calls = Arc::new(Mutex::new(0));
            (
                Self {
                    connects: Arc::new(Mutex::new(connects.into())),
                    reads: Arc::new(Mutex::new(reads.into())),
                    acks: Arc::clone(&acks),
                    connect_calls: Arc::clone(&connect_calls),
                },
                acks,
                connect_calls,
            )
        }
    }

    #[async_trait]
    impl Input for MockInput {
        async fn connect(&mut self) -> Result<()> {
            *self.connect_calls.lock() += 1;
            self.connects.lock().pop_front().unwrap_or(Ok(()))
        }

        async fn read_batch(&mut self) -> Result<(Batch, AckFn)> {
            let next = self
                .reads
                .lock()
                .pop_front()
                .unwrap_or(Err(Error::TypeClosed))?;
            let acks = Arc::clone(&self.acks);
            let ack_fn: AckFn = Box::new(move |res| {
                async move {
                    acks.lock().push(res);
                    Ok(())
                }
                .boxed()
            });
            Ok((next, ack_fn))
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_reader_produces_and_propagates_ack() {
        let (input, acks, _) = MockInput::new(
            vec![Ok(())],
            vec![Ok(Batch::from_payloads(["foo", "bar"]))],
        );
        let metrics = Metrics::new();
        let mut reader = AsyncReader::new(
            "mock",
            input,
            Arc::clone(&metrics),
            BackoffConfig::default(),
        );

        let mut rx = reader.take_transactions().unwrap();
        let tr = rx.recv().await.expect("one transaction");
        assert_eq!(tr.payload().len(), 2);
        tr.resolve(Ok(()));

        reader.close_at_leisure();
        reader.wait_for_close(Duration::from_secs(5)).await.unwrap();

        assert_eq!(acks.lock().as_slice(), &[Ok(())]);
        assert_eq!(metrics.counter("input_received").get(), 2);
        assert_eq!(metrics.counter("input_connection_up").get(), 1);
        assert_eq!(metrics.timer("input_latency_ns").count(), 1);
    }

    #[tokio::test]
    async fn test_reader_reconnects_on_not_connected() {
        let (input, acks, connect_calls) = MockInput::new(
            vec![Ok(()), Ok(())],
            vec![
                Err(Error::NotConnected),
                Ok(Batch::from_payloads(["after-reconnect"])),
            ],
        );
        let metrics = Metrics::new();
        let mut reader = AsyncReader::new(
            "mock",
            input,
            Arc::clone(&metrics),
            BackoffConfig::default(),
        );

        let mut rx = reader.take_transactions().unwrap();
        let tr = rx.recv().await.expect("one transaction");
        tr.resolve(Ok(()));

        reader.close_at_leisure();
        reader.wait_for_close(Duration::from_secs(5)).await.unwrap();

        assert_eq!(*connect_calls.lock(), 2);
        assert_eq!(acks.lock().len(), 1);
        assert_eq!(metrics.counter("input_connection_lost").get(), 1);
        assert_eq!(metrics.counter("input_connection_up").get(), 2);
    }

    #[tokio::test]
    async fn test_reader_start_already_closed() {
        let (input, _, _) = MockInput::new(vec![Err(Error::TypeClosed)], vec![]);
        let mut reader = AsyncReader::new("mock", input, Metrics::new(), BackoffConfig::default());

        let mut rx = reader.take_transactions().unwrap();
        assert!(rx.recv().await.is_none());
        reader.wait_for_close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_nacks_when_downstream_drops() {
        let (input, acks, _) =
            MockInput::new(vec![Ok(())], vec![Ok(Batch::from_payloads(["orphan"]))]);
        let mut reader = AsyncReader::new("mock", input, Metrics::new(), BackoffConfig::default());

        let rx = reader.take_transactions().unwrap();
        drop(rx);

        reader.wait_for_close(Duration::from_secs(5)).await.unwrap();
        assert_eq!(acks.lock().as_slice(), &[Err(Error::TypeClosed)]);
    }

    #[tokio::test]
    async fn test_reader_backoff_on_timeout_is_silent_retry() {
        let (input, acks, _) = MockInput::new(
            vec![Ok(())],
            vec![Err(Error::Timeout), Ok(Batch::from_payloads(["late"]))],
        );
        let mut reader = AsyncReader::new(
            "mock",
            input,
            Metrics::new(),
            BackoffConfig {
                initial_ms: 1,
                max_ms: 5,
                jitter: false,
            },
        );

        let mut rx = reader.take_transactions().unwrap();
        let tr = rx.recv().await.expect("batch after timeout retry");
        assert_eq!(tr.payload().get(0).unwrap().payload(), b"late");
        tr.resolve(Ok(()));

        reader.close_at_leisure();
        reader.wait_for_close(Duration::from_secs(5)).await.unwrap();
        assert_eq!(acks.lock().len(), 1);
    }
}
