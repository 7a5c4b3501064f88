//! Graceful shutdown coordination.
//!
//! [`ShutdownSignal`] is cloned into every long-running loop (ingress server,
//! stream consumer, queue ticker, event lanes). Once triggered it stays
//! triggered, so a loop that subscribes late still observes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Time given to in-flight work after the signal fires.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
    timeout: Duration,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    /// Grace period for draining lanes and acknowledging events.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGTERM or Ctrl+C, then notify every subscriber.
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
            _ = terminate => info!("Received SIGTERM, shutting down"),
        }

        self.fire();
    }

    fn fire(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        let _ = self.sender.send(());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has been triggered, immediately if it already was.
    pub async fn recv(&self) {
        let mut receiver = self.sender.subscribe();
        if self.is_shutdown() {
            return;
        }
        let _ = receiver.recv().await;
    }

    /// Trigger shutdown from code.
    pub fn trigger(&self) {
        info!("Shutdown triggered programmatically");
        self.fire();
    }

    /// Wait for shutdown, giving up after `timeout`. Returns `false` on timeout.
    pub async fn wait_with_timeout(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "Shutdown timeout reached, forcing shutdown"
                );
                false
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_timeout() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.timeout(), Duration::from_secs(30));
        assert!(!signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_manual_trigger_reaches_clones() {
        let signal = ShutdownSignal::new();
        let mut receiver = signal.subscribe();

        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        let result = tokio::time::timeout(Duration::from_millis(500), receiver.recv()).await;
        assert!(result.is_ok());
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_shutdown() {
        let signal = ShutdownSignal::new();
        signal.trigger();

        let late = signal.clone();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), late.recv())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_wait_with_timeout_expires() {
        let signal = ShutdownSignal::new();
        assert!(!signal.wait_with_timeout(Duration::from_millis(10)).await);
    }
}
