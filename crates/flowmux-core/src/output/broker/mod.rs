//! Output-side brokers composing multiple consuming layers into one.

mod fallback;
mod fan_out;
mod greedy;
mod round_robin;

pub use fallback::Fallback;
pub use fan_out::FanOut;
pub use greedy::Greedy;
pub use round_robin::RoundRobin;

use crate::error::{Error, Result};
use crate::output::StreamedOutput;
use crate::shutdown::Signaller;
use std::time::{Duration, Instant};

/// Wait for the broker's own pump and then each child in declaration order,
/// deducting elapsed time from the budget at every step.
pub(crate) async fn wait_for_children(
    sig: &Signaller,
    children: &[Box<dyn StreamedOutput>],
    timeout: Duration,
) -> Result<()> {
    let started = Instant::now();
    sig.wait_for_close(timeout).await?;
    for child in children {
        let remaining = timeout
            .checked_sub(started.elapsed())
            .ok_or(Error::Timeout)?;
        child.wait_for_close(remaining).await?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::AckResult;
    use crate::message::Batch;
    use crate::transaction::TransactionRx;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Consuming layer that records batches and resolves every ack with a
    /// fixed verdict.
    pub(crate) struct CollectingOutput {
        verdict: AckResult,
        seen: Arc<Mutex<Vec<Batch>>>,
        consuming: bool,
        shut_sig: Signaller,
    }

    impl CollectingOutput {
        pub(crate) fn succeeding() -> (Self, Arc<Mutex<Vec<Batch>>>) {
            Self::with_verdict(Ok(()))
        }

        pub(crate) fn failing(err: Error) -> (Self, Arc<Mutex<Vec<Batch>>>) {
            Self::with_verdict(Err(err))
        }

        fn with_verdict(verdict: AckResult) -> (Self, Arc<Mutex<Vec<Batch>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    verdict,
                    seen: Arc::clone(&seen),
                    consuming: false,
                    shut_sig: Signaller::new(),
                },
                seen,
            )
        }
    }

    #[async_trait]
    impl StreamedOutput for CollectingOutput {
        fn consume(&mut self, mut transactions: TransactionRx) -> Result<()> {
            if self.consuming {
                return Err(Error::AlreadyConsuming);
            }
            self.consuming = true;

            let verdict = self.verdict.clone();
            let seen = Arc::clone(&self.seen);
            let sig = self.shut_sig.clone();
            tokio::spawn(async move {
                loop {
                    let tr = tokio::select! {
                        tr = transactions.recv() => match tr {
                            Some(tr) => tr,
                            None => break,
                        },
                        _ = sig.closed_at_leisure() => break,
                    };
                    let (batch, ack) = tr.into_parts();
                    seen.lock().push(batch);
                    ack.resolve(verdict.clone());
                }
                sig.shutdown_complete();
            });
            Ok(())
        }

        fn connected(&self) -> bool {
            true
        }

        fn close_at_leisure(&self) {
            self.shut_sig.close_at_leisure();
        }

        async fn wait_for_close(&self, timeout: Duration) -> Result<()> {
            self.shut_sig.wait_for_close(timeout).await
        }
    }
}
