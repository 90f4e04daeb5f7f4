//! Async writer adapter: wraps a single-call output connector as a
//! consuming layer with N parallel workers, connect backoff and ack
//! propagation.
//!
//! Workers share one inbound channel and one connection state. Acks resolve
//! independently per transaction; with more than one worker there is no
//! cross-transaction ordering.

use super::{Output, StreamedOutput};
use crate::error::{Error, Result};
use crate::metrics::SharedMetrics;
use crate::retry::{Backoff, BackoffConfig};
use crate::shutdown::Signaller;
use crate::transaction::{Transaction, TransactionRx};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, trace};

/// Consuming layer wrapping an [`Output`] connector with parallel workers.
pub struct AsyncWriter {
    type_str: String,
    workers: usize,
    output: Arc<dyn Output>,
    connected: Arc<AtomicBool>,
    consuming: bool,
    metrics: SharedMetrics,
    backoff: BackoffConfig,
    shut_sig: Signaller,
}

/// Connection state shared by all workers of one writer. The backoff mutex
/// doubles as the single-reconnector-at-a-time guard.
struct ConnState {
    connected: Arc<AtomicBool>,
    backoff: Mutex<Backoff>,
}

impl AsyncWriter {
    /// Wrap a connector. Workers start when `consume` is called.
    pub fn new(
        type_str: impl Into<String>,
        workers: usize,
        output: impl Output + 'static,
        metrics: SharedMetrics,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            type_str: type_str.into(),
            workers: workers.max(1),
            output: Arc::new(output),
            connected: Arc::new(AtomicBool::new(false)),
            consuming: false,
            metrics,
            backoff,
            shut_sig: Signaller::new(),
        }
    }
}

#[async_trait]
impl StreamedOutput for AsyncWriter {
    fn consume(&mut self, transactions: TransactionRx) -> Result<()> {
        if self.consuming {
            return Err(Error::AlreadyConsuming);
        }
        self.consuming = true;

        let inbound = Arc::new(Mutex::new(transactions));
        let conn = Arc::new(ConnState {
            connected: Arc::clone(&self.connected),
            backoff: Mutex::new(Backoff::new(self.backoff.clone())),
        });

        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            handles.push(tokio::spawn(write_loop(
                self.type_str.clone(),
                Arc::clone(&self.output),
                Arc::clone(&inbound),
                Arc::clone(&conn),
                self.shut_sig.clone(),
                Arc::clone(&self.metrics),
            )));
        }

        let output = Arc::clone(&self.output);
        let connected = Arc::clone(&self.connected);
        let sig = self.shut_sig.clone();
        let type_str = self.type_str.clone();
        tokio::spawn(async move {
            for handle in handles {
                let _ = handle.await;
            }
            tokio::select! {
                res = output.close() => {
                    if let Err(err) = res {
                        error!(output = %type_str, error = %err, "Failed to close output connector");
                    }
                }
                _ = sig.closed_now() => {}
            }
            connected.store(false, Ordering::Release);
            sig.shutdown_complete();
        });

        Ok(())
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

async fn write_loop(
    type_str: String,
    output: Arc<dyn Output>,
    inbound: Arc<Mutex<TransactionRx>>,
    conn: Arc<ConnState>,
    sig: Signaller,
    metrics: SharedMetrics,
) {
    let m_sent = metrics.counter("output_sent");
    let m_error = metrics.counter("output_error");
    let m_conn = metrics.counter("output_connection_up");
    let m_failed_conn = metrics.counter("output_connection_failed");
    let m_lost_conn = metrics.counter("output_connection_lost");
    let m_latency = metrics.timer("output_latency_ns");

    if ensure_connected(&type_str, &output, &conn, &sig, &m_conn, &m_failed_conn)
        .await
        .is_err()
    {
        return;
    }

    loop {
        let transaction = tokio::select! {
            biased;
            _ = sig.closed_at_leisure() => return,
            tr = recv_next(&inbound) => match tr {
                Some(tr) => tr,
                None => return,
            },
        };

        let (batch, ack) = transaction.into_parts();
        let started = Instant::now();

        let verdict = loop {
            if !conn.connected.load(Ordering::Acquire) {
                // The transaction is held, not acked: one immediate connect
                // attempt happens inside ensure_connected before any
                // backoff sleep.
                if ensure_connected(&type_str, &output, &conn, &sig, &m_conn, &m_failed_conn)
                    .await
                    .is_err()
                {
                    break Err(Error::TypeClosed);
                }
            }

            let res = tokio::select! {
                res = output.write_batch(&batch) => res,
                _ = sig.closed_now() => Err(Error::TypeClosed),
            };
            match res {
                Err(Error::NotConnected) => {
                    m_lost_conn.incr(1);
                    conn.connected.store(false, Ordering::Release);
                    if sig.should_close_at_leisure() {
                        break Err(Error::TypeClosed);
                    }
                }
                other => break other,
            }
        };

        match verdict {
            Ok(()) => {
                m_sent.incr(batch.len() as u64);
                m_latency.record(started.elapsed());
                trace!(output = %type_str, messages = batch.len(), "Wrote batch");
                ack.resolve(Ok(()));
            }
            Err(Error::TypeClosed) => {
                ack.resolve(Err(Error::TypeClosed));
                return;
            }
            Err(err) => {
                m_error.incr(1);
                error!(output = %type_str, error = %err, "Failed to write batch");
                ack.resolve(Err(err));
            }
        }
    }
}

async fn recv_next(inbound: &Arc<Mutex<TransactionRx>>) -> Option<Transaction> {
    inbound.lock().await.recv().await
}

/// Reconnect with backoff, one worker at a time. A worker that finds the
/// flag already raised returns without touching the connector.
async fn ensure_connected(
    type_str: &str,
    output: &Arc<dyn Output>,
    conn: &Arc<ConnState>,
    sig: &Signaller,
    m_conn: &crate::metrics::Counter,
    m_failed_conn: &crate::metrics::Counter,
) -> Result<()> {
    loop {
        if conn.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut boff = conn.backoff.lock().await;
        if conn.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let res = tokio::select! {
            res = output.connect() => res,
            _ = sig.closed_at_leisure() => return Err(Error::TypeClosed),
        };
        match res {
            Ok(()) => {
                conn.connected.store(true, Ordering::Release);
                boff.reset();
                m_conn.incr(1);
                return Ok(());
            }
            Err(Error::TypeClosed) => return Err(Error::TypeClosed),
            Err(err) => {
                if sig.should_close_at_leisure() {
                    return Err(Error::TypeClosed);
                }
                error!(output = %type_str, error = %err, "Failed to connect");
                m_failed_conn.incr(1);
                let delay = boff.next_delay();
                drop(boff);
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = sig.closed_at_leisure() => return Err(Error::TypeClosed),
                }
            }
        }
    }
}
