//! One-way cancellation signal shared by the heartbeat monitor (writer) and
//! the command pipeline (reader).

use tokio::sync::watch;

/// Create a connected trigger/signal pair.
pub fn cancel_pair() -> (CancelTrigger, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelTrigger(tx), CancelSignal(rx))
}

/// Write side. Owned by the heartbeat monitor.
#[derive(Debug)]
pub struct CancelTrigger(watch::Sender<bool>);

impl CancelTrigger {
    /// Raise the signal. Returns true only for the call that raised it.
    pub fn fire(&self) -> bool {
        self.0.send_if_modified(|fired| !std::mem::replace(fired, true))
    }
}

/// Read side. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// A signal that is never raised.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the signal is raised. Pends forever if the trigger is
    /// dropped without firing.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|fired| *fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn fires_exactly_once() {
        let (trigger, mut signal) = cancel_pair();
        assert!(!signal.is_cancelled());
        assert!(trigger.fire());
        assert!(!trigger.fire());
        assert!(signal.is_cancelled());
        signal.cancelled().await;
    }

    #[tokio::test]
    async fn dropped_trigger_never_resolves() {
        let (trigger, mut signal) = cancel_pair();
        drop(trigger);
        let waited = tokio::time::timeout(Duration::from_millis(50), signal.cancelled()).await;
        assert!(waited.is_err());
        assert!(!signal.is_cancelled());
    }

    #[tokio::test]
    async fn clones_observe_the_same_signal() {
        let (trigger, signal) = cancel_pair();
        let mut other = signal.clone();
        let waiter = tokio::spawn(async move { other.cancelled().await });
        trigger.fire();
        waiter.await.unwrap();
        assert!(signal.is_cancelled());
    }
}
