//! Shutdown signal and cancellable sleeps.
//!
//! Every wait in the daemon (data backoff, observation interval, status
//! polling, model polling) goes through [`Shutdown::sleep`] so that a
//! SIGTERM ends the loop at the next suspension point instead of mid-upload.

use drift_common::{MonitorError, MonitorResult};
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Sending half, held by whoever decides the process should stop.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        // send_replace works even when every receiver is gone
        self.tx.send_replace(true);
    }
}

/// Receiving half, cloned into every component that waits.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> (ShutdownHandle, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownHandle { tx }, Shutdown { rx })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for `duration`, or fail with `Cancelled` as soon as shutdown is triggered.
    pub async fn sleep(&self, duration: Duration) -> MonitorResult<()> {
        if self.is_cancelled() {
            return Err(MonitorError::Cancelled);
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(MonitorError::Cancelled),
        }
    }

    /// Resolve once shutdown is triggered. Never resolves if the handle was dropped untriggered.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let triggered = rx.wait_for(|stop| *stop).await.is_ok();
        if !triggered {
            std::future::pending::<()>().await;
        }
    }
}

/// Trigger `handle` on SIGINT or SIGTERM.
pub async fn listen_for_signals(handle: ShutdownHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!("Failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Interrupt received, shutting down");
                handle.trigger();
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Interrupt received, shutting down"),
            _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Interrupt received, shutting down");
    }

    handle.trigger();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_sleep_completes_without_shutdown() {
        let (_handle, shutdown) = Shutdown::new();
        assert!(shutdown.sleep(Duration::from_millis(5)).await.is_ok());
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_trigger_interrupts_long_sleep() {
        let (handle, shutdown) = Shutdown::new();
        let sleeper = shutdown.clone();

        let started = Instant::now();
        let task = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.trigger();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(MonitorError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_sleep_after_trigger_fails_immediately() {
        let (handle, shutdown) = Shutdown::new();
        handle.trigger();
        assert!(shutdown.is_cancelled());
        assert!(shutdown.sleep(Duration::from_secs(30)).await.is_err());
        shutdown.cancelled().await;
    }
}
