//! Cooperative shutdown signalling.
//!
//! One `Signaller` per actor, exposing two orthogonal close signals plus a
//! has-closed latch. At-leisure means stop accepting new work and finish
//! what is in flight; now means abandon bounded waits. Every blocking
//! primitive in the engine selects against at least the at-leisure signal so
//! that shutdown is bounded.

use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// Shutdown signaller shared between an actor and the handles driving it.
#[derive(Debug, Clone)]
pub struct Signaller {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    at_leisure: watch::Sender<bool>,
    now: watch::Sender<bool>,
    closed: watch::Sender<bool>,
}

impl Signaller {
    /// Create a signaller with no signals raised.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                at_leisure: watch::channel(false).0,
                now: watch::channel(false).0,
                closed: watch::channel(false).0,
            }),
        }
    }

    /// Signal the actor to stop accepting new work and drain.
    pub fn close_at_leisure(&self) {
        self.inner.at_leisure.send_replace(true);
    }

    /// Signal the actor to abandon bounded waits. Implies at-leisure.
    pub fn close_now(&self) {
        self.inner.at_leisure.send_replace(true);
        self.inner.now.send_replace(true);
    }

    /// Mark shutdown as complete. Called once by the owning actor as its
    /// final act.
    pub fn shutdown_complete(&self) {
        self.inner.closed.send_replace(true);
    }

    /// Whether at-leisure (or stronger) has been signalled.
    pub fn should_close_at_leisure(&self) -> bool {
        *self.inner.at_leisure.borrow()
    }

    /// Whether close-now has been signalled.
    pub fn should_close_now(&self) -> bool {
        *self.inner.now.borrow()
    }

    /// Whether the actor has completed shutdown.
    pub fn has_shutdown(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Wait until at-leisure (or stronger) is signalled.
    pub async fn closed_at_leisure(&self) {
        let mut rx = self.inner.at_leisure.subscribe();
        let _ = rx.wait_for(|raised| *raised).await;
    }

    /// Wait until close-now is signalled.
    pub async fn closed_now(&self) {
        let mut rx = self.inner.now.subscribe();
        let _ = rx.wait_for(|raised| *raised).await;
    }

    /// Wait until the actor has completed shutdown.
    pub async fn has_closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|raised| *raised).await;
    }

    /// Wait for shutdown to complete within `timeout`, arming close-now one
    /// second before the deadline so that draining work receives most of
    /// the budget. Returns `Error::Timeout` on expiry.
    pub async fn wait_for_close(&self, timeout: Duration) -> Result<()> {
        let escalate = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(timeout.saturating_sub(Duration::from_secs(1))) => escalate.close_now(),
                _ = escalate.has_closed() => {}
            }
        });

        tokio::select! {
            _ = self.has_closed() => Ok(()),
            _ = sleep(timeout) => Err(Error::Timeout),
        }
    }
}

impl Default for Signaller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_at_leisure_signal() {
        let sig = Signaller::new();
        assert!(!sig.should_close_at_leisure());

        let waiter = sig.clone();
        let handle = tokio::spawn(async move { waiter.closed_at_leisure().await });

        sig.close_at_leisure();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should resolve")
            .unwrap();
        assert!(sig.should_close_at_leisure());
        assert!(!sig.should_close_now());
    }

    #[tokio::test]
    async fn test_close_now_implies_at_leisure() {
        let sig = Signaller::new();
        sig.close_now();
        assert!(sig.should_close_at_leisure());
        assert!(sig.should_close_now());
        // Both waits resolve immediately.
        tokio::time::timeout(Duration::from_millis(100), sig.closed_at_leisure())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_millis(100), sig.closed_now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_has_closed_latch() {
        let sig = Signaller::new();
        assert!(!sig.has_shutdown());
        sig.shutdown_complete();
        assert!(sig.has_shutdown());
        tokio::time::timeout(Duration::from_millis(100), sig.has_closed())
            .await
            .unwrap();
    }
}
