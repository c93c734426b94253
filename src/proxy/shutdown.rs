//! Shutdown signalling
//!
//! One controller owned by the listener manager; every accept loop and session
//! holds a cheap [`ShutdownSignal`] clone.

use tokio::sync::watch;

use crate::models::ShutdownState;

/// Publishes proxy lifecycle changes
pub struct ShutdownController {
    state: watch::Sender<ShutdownState>,
    force: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        let (force, _) = watch::channel(false);
        Self { state, force }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            state: self.state.subscribe(),
            force: self.force.subscribe(),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Move from Running to Draining; false if already past Running
    pub fn begin_drain(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::Draining;
                true
            } else {
                false
            }
        })
    }

    /// Tell every live session to stop immediately
    pub fn force_close(&self) {
        self.force.send_replace(true);
    }

    pub fn mark_stopped(&self) {
        self.state.send_replace(ShutdownState::Stopped);
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of [`ShutdownController`]
#[derive(Clone)]
pub struct ShutdownSignal {
    state: watch::Receiver<ShutdownState>,
    force: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    pub fn is_draining(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    /// Resolves once the proxy stops accepting new sessions
    pub async fn draining(&self) {
        let mut rx = self.state.clone();
        if rx.wait_for(|s| *s != ShutdownState::Running).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Resolves once live sessions must terminate
    pub async fn forced(&self) {
        let mut rx = self.force.clone();
        if rx.wait_for(|forced| *forced).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_drain_then_force() {
        let controller = ShutdownController::new();
        let signal = controller.signal();
        assert!(!signal.is_draining());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.draining().await })
        };
        assert!(controller.begin_drain());
        assert!(!controller.begin_drain());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_draining());

        let forced = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.forced().await })
        };
        controller.force_close();
        tokio::time::timeout(Duration::from_secs(1), forced)
            .await
            .unwrap()
            .unwrap();

        controller.mark_stopped();
        assert_eq!(signal.state(), ShutdownState::Stopped);
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_current_state() {
        let controller = ShutdownController::new();
        controller.begin_drain();
        controller.force_close();

        let signal = controller.signal();
        tokio::time::timeout(Duration::from_millis(100), signal.draining())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_millis(100), signal.forced())
            .await
            .unwrap();
    }
}
