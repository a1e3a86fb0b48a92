//! Cancellation shared by every long-running task of a node.
//!
//! A `watch` channel rather than `broadcast`: a task that subscribes after
//! shutdown began still sees it.

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Idempotent.
    pub fn close(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once the signal is closed. Pends forever if the sender is gone
/// without having closed.
pub async fn closed(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|closed| *closed).await.is_err() {
        std::future::pending::<()>().await;
    }
}
