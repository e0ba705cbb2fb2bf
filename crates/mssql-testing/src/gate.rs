//! Gates for holding statements in flight.

use std::sync::Arc;

use tokio::sync::watch;

/// A one-way latch. Statements scripted behind a gate block until it opens.
///
/// Clones share the same latch.
#[derive(Debug, Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    /// Create a closed gate.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Open the gate, releasing every current and future waiter.
    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    /// Check whether the gate is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate is open.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}
