//! Cooperative cancellation token
//!
//! A clonable flag shared between the job runtime, the scheduler, and the
//! retry fabric. Cancellation is observed at suspension points; it never
//! interrupts an in-flight provider call mid-request.

use std::sync::Arc;

use tokio::sync::watch;

/// Clonable cancellation flag. All clones observe the same state.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trip the flag. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the token is cancelled. Safe to race in `select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // Closed sender can't happen while `self` holds the Arc
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
