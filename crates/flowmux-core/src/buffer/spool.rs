//! Persistent spool buffer backed by an append-only log.
//!
//! The spool acks inbound transactions as soon as their entry is durably
//! recorded, then owns the downstream acknowledgement itself: completions
//! are logged, downstream failures are redelivered with backoff, and
//! entries that were written but never completed are recovered on open.
//! This trades end-to-end acknowledgement for local durability.

use super::Buffer;
use crate::error::{Error, Result};
use crate::message::{Batch, Message};
use crate::retry::{Backoff, BackoffConfig};
use crate::shutdown::Signaller;
use crate::transaction::{transaction_channel, Transaction, TransactionRx, TransactionTx};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Spool buffer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpoolConfig {
    /// Directory holding spool log files.
    pub dir: PathBuf,

    /// Backoff applied between redelivery attempts after a downstream
    /// failure.
    #[serde(default)]
    pub redelivery_backoff: BackoffConfig,
}

/// A log entry. Write entries carry batch data; ack entries mark a sequence
/// as completed downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum SpoolEntry {
    Write {
        seq: u64,
        messages: Vec<SpoolMessage>,
        written_at: DateTime<Utc>,
    },
    Ack {
        seq: u64,
        acked_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpoolMessage {
    payload: Vec<u8>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl From<&Message> for SpoolMessage {
    fn from(msg: &Message) -> Self {
        Self {
            payload: msg.payload().to_vec(),
            metadata: msg
                .metadata_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl From<SpoolMessage> for Message {
    fn from(entry: SpoolMessage) -> Self {
        let mut msg = Message::new(entry.payload);
        for (k, v) in entry.metadata {
            msg.set_metadata(k, v);
        }
        msg
    }
}

/// Append-only spool log file.
struct SpoolLog {
    file: Mutex<BufWriter<File>>,
}

impl SpoolLog {
    fn open(dir: &PathBuf, first_seq: u64) -> Result<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| Error::Spool(format!("failed to create spool directory: {e}")))?;

        let path = dir.join(format!("spool-{first_seq:016x}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Spool(format!("failed to open spool file: {e}")))?;

        info!(path = %path.display(), "Spool log opened");
        Ok(Self {
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    fn append(&self, entry: &SpoolEntry) -> Result<()> {
        let json = serde_json::to_string(entry)?;
        let mut file = self.file.lock();
        writeln!(file, "{json}")
            .map_err(|e| Error::Spool(format!("failed to append spool entry: {e}")))?;
        // Durability before the inbound ack resolves.
        file.flush()
            .map_err(|e| Error::Spool(format!("failed to flush spool entry: {e}")))?;
        Ok(())
    }

    fn append_write(&self, seq: u64, batch: &Batch) -> Result<()> {
        self.append(&SpoolEntry::Write {
            seq,
            messages: batch.iter().map(SpoolMessage::from).collect(),
            written_at: Utc::now(),
        })
    }

    fn append_ack(&self, seq: u64) -> Result<()> {
        self.append(&SpoolEntry::Ack {
            seq,
            acked_at: Utc::now(),
        })
    }
}

/// Scan the spool directory for entries written but never acked. Corrupt
/// lines are skipped with a warning rather than failing recovery.
fn recover(dir: &PathBuf) -> Result<(VecDeque<(u64, Batch)>, u64)> {
    let mut writes: Vec<(u64, Batch)> = Vec::new();
    let mut acked: Vec<u64> = Vec::new();
    let mut next_seq = 0u64;

    if !dir.exists() {
        return Ok((VecDeque::new(), 0));
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| Error::Spool(format!("failed to read spool directory: {e}")))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "jsonl"))
        .collect();
    paths.sort();

    for path in paths {
        let file =
            File::open(&path).map_err(|e| Error::Spool(format!("failed to open spool: {e}")))?;
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| Error::Spool(format!("failed to read spool: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SpoolEntry>(&line) {
                Ok(SpoolEntry::Write {
                    seq, messages, ..
                }) => {
                    next_seq = next_seq.max(seq + 1);
                    writes.push((seq, messages.into_iter().map(Message::from).collect()));
                }
                Ok(SpoolEntry::Ack { seq, .. }) => {
                    next_seq = next_seq.max(seq + 1);
                    acked.push(seq);
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        line = line_no + 1,
                        error = %err,
                        "Skipping corrupt spool entry"
                    );
                }
            }
        }
    }

    writes.retain(|(seq, _)| !acked.contains(seq));
    writes.sort_by_key(|(seq, _)| *seq);

    if !writes.is_empty() {
        info!(entries = writes.len(), "Recovered unacked spool entries");
    }
    Ok((writes.into(), next_seq))
}

/// Disk-backed buffer that owns the downstream acknowledgement.
pub struct SpoolBuffer {
    transactions: Option<TransactionRx>,
    out_tx: Option<TransactionTx>,
    pending: Option<VecDeque<(u64, Batch)>>,
    next_seq: u64,
    log: Option<SpoolLog>,
    redelivery_backoff: BackoffConfig,
    consuming: bool,
    stop_sig: Signaller,
    shut_sig: Signaller,
}

impl SpoolBuffer {
    /// Open the spool, recovering any entries written but not completed by
    /// a previous run.
    pub fn open(config: SpoolConfig) -> Result<Self> {
        let (pending, next_seq) = recover(&config.dir)?;
        let log = SpoolLog::open(&config.dir, next_seq)?;
        let (tx, rx) = transaction_channel();
        Ok(Self {
            transactions: Some(rx),
            out_tx: Some(tx),
            pending: Some(pending),
            next_seq,
            log: Some(log),
            redelivery_backoff: config.redelivery_backoff,
            consuming: false,
            stop_sig: Signaller::new(),
            shut_sig: Signaller::new(),
        })
    }
}

#[async_trait]
impl Buffer for SpoolBuffer {
    fn consume(&mut self, transactions: TransactionRx) -> Result<()> {
        if self.consuming {
            return Err(Error::AlreadyConsuming);
        }
        self.consuming = true;

        let out_tx = self.out_tx.take().ok_or(Error::AlreadyConsuming)?;
        let pending = self.pending.take().unwrap_or_default();
        let log = self.log.take().ok_or(Error::AlreadyConsuming)?;

        tokio::spawn(pump(
            log,
            pending,
            self.next_seq,
            transactions,
            out_tx,
            Backoff::new(self.redelivery_backoff.clone()),
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

#[allow(clippy::too_many_arguments)]
async fn pump(
    log: SpoolLog,
    mut pending: VecDeque<(u64, Batch)>,
    mut next_seq: u64,
    mut inbound: TransactionRx,
    out_tx: TransactionTx,
    mut redelivery: Backoff,
    stop_sig: Signaller,
    sig: Signaller,
) {
    let mut inbound_open = true;
    let mut inflight: Option<(u64, Batch)> = None;
    let mut inflight_reply: Option<oneshot::Receiver<crate::error::AckResult>> = None;

    loop {
        if sig.should_close_now() {
            break;
        }
        let stopped = stop_sig.should_close_at_leisure() || sig.should_close_at_leisure();
        if (stopped || !inbound_open) && pending.is_empty() && inflight.is_none() {
            break;
        }

        tokio::select! {
            biased;
            _ = sig.closed_now() => break,
            _ = stop_sig.closed_at_leisure(), if !stopped => {}
            _ = sig.closed_at_leisure(), if !stopped => {}
            tr = inbound.recv(), if inbound_open && !stopped => {
                match tr {
                    Some(tr) => {
                        let (batch, ack) = tr.into_parts();
                        match log.append_write(next_seq, &batch) {
                            Ok(()) => {
                                // Durable: the inbound ack resolves here and
                                // the spool owns delivery from now on.
                                ack.resolve(Ok(()));
                                pending.push_back((next_seq, batch));
                                next_seq += 1;
                            }
                            Err(err) => ack.resolve(Err(err)),
                        }
                    }
                    None => inbound_open = false,
                }
            }
            verdict = await_reply(&mut inflight_reply), if inflight.is_some() => {
                let (seq, batch) = inflight.take().expect("guarded some");
                inflight_reply = None;
                match verdict {
                    Ok(()) => {
                        redelivery.reset();
                        if let Err(err) = log.append_ack(seq) {
                            warn!(seq, error = %err, "Failed to record spool completion");
                        }
                    }
                    Err(err) => {
                        debug!(seq, error = %err, "Spooled batch refused, redelivering");
                        pending.push_front((seq, batch));
                        tokio::select! {
                            _ = sleep(redelivery.next_delay()) => {}
                            _ = sig.closed_now() => break,
                        }
                    }
                }
            }
            permit = out_tx.reserve(), if inflight.is_none() && !pending.is_empty() => {
                match permit {
                    Ok(permit) => {
                        let (seq, batch) = pending.pop_front().expect("guarded non-empty");
                        let (tr, reply) = Transaction::new(batch.clone());
                        permit.send(tr);
                        inflight = Some((seq, batch));
                        inflight_reply = Some(reply);
                    }
                    Err(_) => break,
                }
            }
        }
    }

    if !pending.is_empty() || inflight.is_some() {
        debug!(
            remaining = pending.len(),
            "Spool closing with undelivered entries; they remain on disk"
        );
    }

    drop(out_tx);
    sig.shutdown_complete();
}

async fn await_reply(
    reply: &mut Option<oneshot::Receiver<crate::error::AckResult>>,
) -> crate::error::AckResult {
    match reply.as_mut() {
        Some(reply) => reply.await.unwrap_or(Err(Error::TypeClosed)),
        None => std::future::pending().await,
    }
}

// TODO: compact fully-acked spool files instead of leaving them on disk.

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> SpoolConfig {
        SpoolConfig {
            dir: dir.path().to_path_buf(),
            redelivery_backoff: BackoffConfig {
                initial_ms: 1,
                max_ms: 5,
                jitter: false,
            },
        }
    }

    #[tokio::test]
    async fn test_spool_acks_on_durable_write() {
        let dir = TempDir::new().unwrap();
        let mut buffer = SpoolBuffer::open(config(&dir)).unwrap();
        let mut out = buffer.take_transactions().unwrap();
        let (tx, rx) = transaction_channel();
        buffer.consume(rx).unwrap();

        let (tr, reply) = Transaction::new(Batch::from_payloads(["durable"]));
        tx.send(tr).await.unwrap();

        // Inbound ack resolves before any downstream ack exists.
        assert_eq!(reply.await.unwrap(), Ok(()));

        let forwarded = out.recv().await.unwrap();
        assert_eq!(forwarded.payload().get(0).unwrap().payload(), b"durable");
        forwarded.resolve(Ok(()));

        drop(tx);
        buffer.wait_for_close(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_spool_redelivers_on_downstream_failure() {
        let dir = TempDir::new().unwrap();
        let mut buffer = SpoolBuffer::open(config(&dir)).unwrap();
        let mut out = buffer.take_transactions().unwrap();
        let (tx, rx) = transaction_channel();
        buffer.consume(rx).unwrap();

        let (tr, _reply) = Transaction::new(Batch::from_payloads(["again"]));
        tx.send(tr).await.unwrap();

        let first = out.recv().await.unwrap();
        first.resolve(Err(Error::Retryable("try later".into())));

        let second = out.recv().await.unwrap();
        assert_eq!(second.payload().get(0).unwrap().payload(), b"again");
        second.resolve(Ok(()));

        drop(tx);
        buffer.wait_for_close(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_spool_recovers_unacked_entries() {
        let dir = TempDir::new().unwrap();

        {
            let mut buffer = SpoolBuffer::open(config(&dir)).unwrap();
            let mut out = buffer.take_transactions().unwrap();
            let (tx, rx) = transaction_channel();
            buffer.consume(rx).unwrap();

            let (tr, reply) = Transaction::new(Batch::from_payloads(["completed"]));
            tx.send(tr).await.unwrap();
            reply.await.unwrap().unwrap();
            let forwarded = out.recv().await.unwrap();
            forwarded.resolve(Ok(()));

            let (tr, reply) = Transaction::new(Batch::from_payloads(["orphaned"]));
            tx.send(tr).await.unwrap();
            reply.await.unwrap().unwrap();
            // Forwarded but never acked downstream.
            let forwarded = out.recv().await.unwrap();
            drop(forwarded);

            // Make sure the pump has finished logging before reopening.
            drop(tx);
            drop(out);
            buffer.wait_for_close(Duration::from_secs(5)).await.unwrap();
        }

        // Reopen: only the unacked entry comes back.
        let mut buffer = SpoolBuffer::open(config(&dir)).unwrap();
        let mut out = buffer.take_transactions().unwrap();
        let (tx, rx) = transaction_channel();
        buffer.consume(rx).unwrap();

        let recovered = tokio::time::timeout(Duration::from_secs(5), out.recv())
            .await
            .expect("recovered entry")
            .unwrap();
        assert_eq!(recovered.payload().get(0).unwrap().payload(), b"orphaned");
        recovered.resolve(Ok(()));

        drop(tx);
        buffer.wait_for_close(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_spool_recovery_skips_corrupt_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spool-0000000000000000.jsonl");
        let valid = serde_json::to_string(&SpoolEntry::Write {
            seq: 0,
            messages: vec![SpoolMessage {
                payload: b"ok".to_vec(),
                metadata: HashMap::new(),
            }],
            written_at: Utc::now(),
        })
        .unwrap();
        fs::write(&path, format!("{valid}\nnot json at all\n")).unwrap();

        let (pending, next_seq) = recover(&dir.path().to_path_buf()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(next_seq, 1);
    }
}
