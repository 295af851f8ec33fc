//! Signal handling for the supervisor process
//!
//! SIGTERM and SIGINT delivered to the supervisor itself are translated
//! into a graceful shutdown request that the run loop observes; the node
//! child is then stopped through the normal lifecycle path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

/// Shared signal state
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_requested: Arc<AtomicBool>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }

    /// Request shutdown programmatically, as if a signal had arrived
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Relaxed);
    }

    /// Block until a shutdown has been requested
    pub async fn wait_for_shutdown(&self) {
        while !self.is_shutdown_requested() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Start the signal monitoring task
    pub fn start_monitoring(&self) {
        let handler = self.clone();
        tokio::spawn(async move {
            handler.monitor_signals().await;
        });
    }

    async fn monitor_signals(&self) {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to install SIGINT handler: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("received SIGTERM - requesting graceful shutdown");
            }
            _ = sigint.recv() => {
                log::info!("received SIGINT - requesting graceful shutdown");
            }
        }
        self.shutdown_requested.store(true, Ordering::Relaxed);
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_flag_starts_clear() {
        let handler = SignalHandler::new();
        assert!(!handler.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_programmatic_shutdown_request() {
        let handler = SignalHandler::new();
        handler.request_shutdown();
        assert!(handler.is_shutdown_requested());

        // Clones observe the same flag.
        let clone = handler.clone();
        assert!(clone.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_returns_after_request() {
        let handler = SignalHandler::new();
        let waiter = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.wait_for_shutdown().await })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!waiter.is_finished());

        handler.request_shutdown();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter never woke")
            .unwrap();
    }
}
