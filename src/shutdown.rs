//! Shutdown signalling shared by the long-running tasks

use tokio::sync::watch;

/// `true` once shutdown has been requested
pub type ShutdownSignal = watch::Receiver<bool>;

pub fn shutdown_channel() -> (watch::Sender<bool>, ShutdownSignal) {
    watch::channel(false)
}

/// Resolve once shutdown is requested or the sender is gone. Cancel-safe.
pub async fn wait_for_shutdown(signal: &mut ShutdownSignal) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            return;
        }
    }
}

pub fn is_shutdown(signal: &ShutdownSignal) -> bool {
    *signal.borrow()
}
