//! Cooperative shutdown signalling.

use futures::{Stream, StreamExt};
use tokio::sync::watch;

/// Fires the shutdown signal, e.g. from a SIGINT handler.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn new() -> (Self, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, Shutdown { rx })
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Turns process signals into a graceful shutdown. The first signal fires
/// `trigger` so the in-flight transaction can resolve. Returns `true` once a
/// second signal arrives, after which the caller should exit immediately.
/// Returns `false` if the signal source ends first.
pub async fn escalate_signals(trigger: &ShutdownTrigger, signals: impl Stream<Item = ()>) -> bool {
    let mut signals = std::pin::pin!(signals);

    if signals.next().await.is_none() {
        return false;
    }
    log::info!("Finishing the in-flight transaction before shutting down, signal again to force exit");
    trigger.trigger();

    if signals.next().await.is_none() {
        return false;
    }
    log::warn!("Second shutdown signal received, exiting without waiting");
    true
}

/// Observes the shutdown signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// A handle that is never triggered.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been triggered. Pends forever if the
    /// trigger is dropped without firing.
    pub async fn triggered(&mut self) {
        if self.rx.wait_for(|triggered| *triggered).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_is_observed_by_all_handles() {
        let (trigger, shutdown) = ShutdownTrigger::new();
        let mut other = shutdown.clone();

        assert!(!shutdown.is_triggered());
        trigger.trigger();

        assert!(shutdown.is_triggered());
        tokio::time::timeout(Duration::from_secs(1), other.triggered())
            .await
            .expect("triggered() should resolve");
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_does_not_resolve() {
        let mut shutdown = Shutdown::never();
        assert!(!shutdown.is_triggered());
        assert!(
            tokio::time::timeout(Duration::from_secs(5), shutdown.triggered())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_first_signal_triggers_second_forces_exit() {
        let (trigger, shutdown) = ShutdownTrigger::new();

        let forced = escalate_signals(&trigger, futures::stream::iter([(), ()])).await;

        assert!(forced);
        assert!(shutdown.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_signal_only_triggers() {
        let (trigger, shutdown) = ShutdownTrigger::new();

        // One signal, then the source stays silent
        let signals = futures::stream::iter([()]).chain(futures::stream::pending());
        let escalation = escalate_signals(&trigger, signals);

        assert!(
            tokio::time::timeout(Duration::from_secs(60), escalation)
                .await
                .is_err()
        );
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_closed_signal_source_never_triggers() {
        let (trigger, shutdown) = ShutdownTrigger::new();

        let forced = escalate_signals(&trigger, futures::stream::empty()).await;

        assert!(!forced);
        assert!(!shutdown.is_triggered());
    }
}
