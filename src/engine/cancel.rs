//! Cooperative cancellation

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Cloneable cancellation flag backed by a watch channel
///
/// In-flight attempts are never interrupted; callers check the flag before
/// dispatching work and race it against their sleeps.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any handle, so this cannot fail early
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Sleep for `duration`; returns false if cancelled first
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
