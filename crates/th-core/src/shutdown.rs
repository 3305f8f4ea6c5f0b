use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal: cooperative shutdown coordination
// ---------------------------------------------------------------------------

/// Watch-based shutdown coordinator.
///
/// Long-running loops (the accept loop, the supervisor sweep) `select!` on
/// [`ShutdownSignal::cancelled`] alongside their work. Unlike a broadcast
/// channel, a loop that starts *after* `trigger()` still observes it.
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
/// tokio::select! {
///     _ = shutdown.cancelled() => { /* graceful cleanup */ }
///     _ = do_work() => {}
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Check if shutdown has been triggered (non-blocking).
    pub fn is_shutting_down(&self) -> bool {
        *self.rx.borrow()
    }

    /// Trigger shutdown for every holder of this signal.
    pub fn trigger(&self) {
        let first = self.tx.send_if_modified(|flag| {
            let was = *flag;
            *flag = true;
            !was
        });
        if first {
            info!("shutdown signal triggered");
        } else {
            warn!("shutdown already triggered");
        }
    }

    /// Resolves once shutdown has been triggered.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // An Err means every sender is gone, which can only happen once all
        // clones are dropped; treat it as shutdown.
        let _ = rx.wait_for(|flag| *flag).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
