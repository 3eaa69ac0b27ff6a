//! Controller Triggers
//!
//! [`EventTrigger`] wakes a controller through its coalescing event
//! channel. [`RateLimitedTrigger`] folds a burst of kernel notifications
//! into at most one extra wake-up per window.

use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::trace;

/// Default coalescing window for kernel watchers
pub const DEFAULT_WATCH_WINDOW: Duration = Duration::from_millis(100);

/// Handle that schedules a controller run
#[derive(Debug, Clone)]
pub struct EventTrigger {
    tx: mpsc::Sender<()>,
}

impl EventTrigger {
    pub(crate) fn new(tx: mpsc::Sender<()>) -> Self {
        Self { tx }
    }

    /// Queue a wake-up; a pending wake-up absorbs this one
    pub fn fire(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Rate-limited wrapper around an [`EventTrigger`]
///
/// Dropping the last clone stops the background task.
#[derive(Debug, Clone)]
pub struct RateLimitedTrigger {
    tx: mpsc::Sender<()>,
    _guard: std::sync::Arc<DropGuard>,
}

impl RateLimitedTrigger {
    pub fn new(target: EventTrigger, window: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let token = CancellationToken::new();
        let cancel = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    msg = rx.recv() => {
                        if msg.is_none() {
                            return;
                        }
                    }
                }

                loop {
                    target.fire();

                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(window) => {}
                    }

                    let mut pending = false;
                    while rx.try_recv().is_ok() {
                        pending = true;
                    }

                    if !pending {
                        break;
                    }

                    trace!("coalesced watcher burst");
                }
            }
        });

        Self {
            tx,
            _guard: std::sync::Arc::new(token.drop_guard()),
        }
    }

    pub fn fire(&self) {
        let _ = self.tx.try_send(());
    }

    /// Forward every message of a broadcast watch stream into this trigger
    pub fn forward<T>(&self, mut rx: broadcast::Receiver<T>, cancel: CancellationToken)
    where
        T: Clone + Send + 'static,
    {
        let trigger = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    msg = rx.recv() => match msg {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => trigger.fire(),
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limited_trigger_coalesces() {
        let (tx, mut rx) = mpsc::channel(16);
        let trigger = RateLimitedTrigger::new(EventTrigger::new(tx), Duration::from_millis(50));

        for _ in 0..10 {
            trigger.fire();
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_ok());

        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut extra = 0;
        while rx.try_recv().is_ok() {
            extra += 1;
        }
        assert!(extra <= 1);
    }

    #[tokio::test]
    async fn test_event_trigger_coalesces() {
        let (tx, mut rx) = mpsc::channel(1);
        let trigger = EventTrigger::new(tx);

        trigger.fire();
        trigger.fire();
        trigger.fire();

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
