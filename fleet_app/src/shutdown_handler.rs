use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::sync::Notify;

/// Shared stop signal: a flag for polling loops plus a [`Notify`] for async waiters
#[derive(Debug, Clone)]
pub struct Shutdown {
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self { running: Arc::new(AtomicBool::new(true)), notify: Arc::new(Notify::new()) }
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn trigger(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    /// Resolves once shutdown was triggered
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        if !self.is_running() {
            return;
        }
        notified.await;
    }
}

/// Sets up a Ctrl+C handler that triggers the shutdown signal
pub fn setup(shutdown: Shutdown) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received");
        shutdown.trigger();
    })
}
