//! Cancellation of in-progress convergence.
//!
//! A [`CancelToken`] is observed by the poller while it sleeps between
//! probes. Tripping the paired [`CancelTrigger`] wakes every sleeping poll
//! loop holding a clone of the token; a probe already in flight is always
//! allowed to finish first.

use tokio::sync::watch;
use tracing::{info, warn};

/// The receiving half: cheap to clone, handed to every poll loop.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// The sending half: cancels every token created from it.
#[derive(Debug)]
pub struct CancelTrigger {
    tx: watch::Sender<bool>,
}

/// Create a connected trigger/token pair.
pub fn cancel_pair() -> (CancelTrigger, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelTrigger { tx }, CancelToken { rx })
}

impl CancelTrigger {
    /// Cancel all tokens. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Another token connected to this trigger.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    /// A token that is cancelled when the process receives SIGTERM or
    /// SIGINT (CTRL+C on Windows).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn on_shutdown_signal() -> Self {
        let (trigger, token) = cancel_pair();
        tokio::spawn(async move {
            if wait_for_shutdown_signal().await {
                trigger.cancel();
            }
        });
        token
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Never resolves if the
    /// trigger is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Trigger gone without cancelling: nothing can wake us.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::never()
    }
}

/// Wait for a shutdown signal. Returns false if no handler could be installed.
async fn wait_for_shutdown_signal() -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(error = %e, "Failed to install shutdown signal handlers");
                    return false;
                },
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, cancelling in-progress convergence");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, cancelling in-progress convergence");
            }
        }
        true
    }

    #[cfg(windows)]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install CTRL+C handler");
            return false;
        }
        info!("Received CTRL+C, cancelling in-progress convergence");
        true
    }

    #[cfg(not(any(unix, windows)))]
    {
        std::future::pending::<bool>().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_cancel_pair() {
        let (trigger, token) = cancel_pair();
        let other = trigger.token();
        assert!(!token.is_cancelled());

        trigger.cancel();
        assert!(token.is_cancelled());
        assert!(other.is_cancelled());

        // Cancelling twice is harmless.
        trigger.cancel();
        assert!(token.clone().is_cancelled());
    }

    #[test]
    fn test_cancelled_wakes_on_cancel() {
        let (trigger, token) = cancel_pair();
        let mut waiter = task::spawn(token.cancelled());
        assert_pending!(waiter.poll());

        trigger.cancel();
        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
    }

    #[test]
    fn test_never_stays_pending() {
        let token = CancelToken::never();
        let mut waiter = task::spawn(token.cancelled());
        assert_pending!(waiter.poll());
        assert_pending!(waiter.poll());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_dropped_trigger_after_cancel_still_cancelled() {
        let (trigger, token) = cancel_pair();
        trigger.cancel();
        drop(trigger);

        let mut waiter = task::spawn(token.cancelled());
        assert_ready!(waiter.poll());
    }
}
