//! Stop signalling shared by every long-running component

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::signal;
use tokio::sync::watch;
use tracing::error;

/// Lifecycle of the whole process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

impl ShutdownState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ShutdownState::Running,
            1 => ShutdownState::Draining,
            _ => ShutdownState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownState::Running => "running",
            ShutdownState::Draining => "draining",
            ShutdownState::Stopped => "stopped",
        }
    }
}

/// Owner side of a stop signal
///
/// Receivers obtained from [`StopHandle::subscribe`] observe `true` once
/// [`StopHandle::stop`] is called. Dropping the handle also counts as stop.
pub struct StopHandle {
    stop_tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { stop_tx: tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn stop(&self) {
        // Stored even when nobody is subscribed yet
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new().0
    }
}

/// Resolve once the stop flag is raised or its sender is gone
pub async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Tracks the process lifecycle; transitions only move forward
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
        }
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move Running to Draining. Returns false if shutdown already began.
    pub fn begin_drain(&self) -> bool {
        self.state
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn mark_stopped(&self) {
        self.state.store(2, Ordering::Release);
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stopped_resolves_after_stop() {
        let (handle, mut rx) = StopHandle::new();

        let waiter = tokio::spawn(async move { stopped(&mut rx).await });
        handle.stop();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("stop was not observed")
            .unwrap();
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn test_stopped_resolves_when_sender_dropped() {
        let (handle, mut rx) = StopHandle::new();
        drop(handle);

        tokio::time::timeout(Duration::from_secs(1), stopped(&mut rx))
            .await
            .expect("dropped sender was not observed");
    }

    #[tokio::test]
    async fn test_subscribe_after_stop_sees_stop() {
        let (handle, _rx) = StopHandle::new();
        handle.stop();

        let mut late = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(1), stopped(&mut late))
            .await
            .expect("late subscriber missed stop");
    }

    #[test]
    fn test_lifecycle_moves_forward_once() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), ShutdownState::Running);

        assert!(lifecycle.begin_drain());
        assert!(!lifecycle.begin_drain());
        assert_eq!(lifecycle.state(), ShutdownState::Draining);

        lifecycle.mark_stopped();
        assert_eq!(lifecycle.state(), ShutdownState::Stopped);
        assert!(!lifecycle.begin_drain());
    }
}
