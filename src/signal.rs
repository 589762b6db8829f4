//! # Stop Signals
//!
//! One-shot cancellation shared by subscriptions, entity observers and the
//! livedata bridge. A `StopController` aborts; any number of `StopSignal`s
//! observe it. Dropping every controller counts as a stop.

use std::sync::Arc;

use tokio::sync::watch;

/// Owner side of a stop signal
#[derive(Debug, Clone)]
pub struct StopController {
    tx: Arc<watch::Sender<bool>>,
}

/// Observer side of a stop signal
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Returns true only for the call that actually fired it.
    pub fn abort(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for StopController {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal fires
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // An Err means every controller is gone.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}
