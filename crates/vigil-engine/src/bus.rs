//! Outcome event bus.
//!
//! A thin wrapper over [`tokio::sync::broadcast`]. Owners and the executor
//! publish [`OutcomeEvent`]s; the alerting service and the CLI subscribe.
//! Publishing never blocks. Receivers that fall behind see
//! `RecvError::Lagged(n)` and skip the `n` oldest events.

use tokio::sync::broadcast;
use vigil_core::event::OutcomeEvent;

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<OutcomeEvent>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Bus {
    /// Capacity is shared by all receivers and clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Events published with no live receiver are dropped.
    pub fn publish(&self, ev: OutcomeEvent) {
        tracing::trace!(event = ev.name(), "publish");
        let _ = self.tx.send(ev);
    }

    /// A receiver only sees events sent after it subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<OutcomeEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn recovered(id: &str) -> OutcomeEvent {
        OutcomeEvent::IntegrationRecovered {
            integration_id: id.into(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscribers_each_get_a_copy() {
        let bus = Bus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(recovered("github"));
        assert_eq!(a.recv().await.unwrap().name(), "integration_recovered");
        assert_eq!(b.recv().await.unwrap().name(), "integration_recovered");
    }

    #[tokio::test]
    async fn lagging_receiver_skips_oldest() {
        let bus = Bus::new(1);
        let mut rx = bus.subscribe();
        bus.publish(recovered("a"));
        bus.publish(recovered("b"));
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
        match rx.recv().await.unwrap() {
            OutcomeEvent::IntegrationRecovered { integration_id, .. } => {
                assert_eq!(integration_id, "b")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn publish_without_receivers_is_fine() {
        Bus::new(0).publish(recovered("x"));
    }
}
