//! Publish/subscribe surface between the orchestrator and the UI layer.

use crate::types::{Statistics, StatusChange};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

/// Events published to observers. Payloads are owned snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum VpnEvent {
    StatusChanged(StatusChange),
    StatsUpdate(Statistics),
    /// Tunnel address reported by the engine.
    AddressAssigned(String),
    /// One line of engine output, for log panes.
    EngineLog(String),
}

impl VpnEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            VpnEvent::StatusChanged(_) => "vpn:status",
            VpnEvent::StatsUpdate(_) => "vpn:stats",
            VpnEvent::AddressAssigned(_) => "vpn:address",
            VpnEvent::EngineLog(_) => "vpn:log",
        }
    }
}

/// Cloneable broadcast bus. Slow subscribers lose the oldest events
/// rather than stalling the publisher.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<VpnEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current subscriber; returns how many received it.
    pub fn publish(&self, event: VpnEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(ev)) => {
                log::trace!("no subscribers for {}", ev.event_name());
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VpnEvent> {
        self.tx.subscribe()
    }

    /// Subscription as a stream; lagged gaps are skipped with a warning.
    pub fn stream(&self) -> impl Stream<Item = VpnEvent> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|item| match item {
            Ok(ev) => Some(ev),
            Err(e) => {
                log::warn!("event subscriber lagged: {e}");
                None
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConnectionState, TransitionCause};
    use chrono::Utc;

    fn change(state: ConnectionState) -> VpnEvent {
        VpnEvent::StatusChanged(StatusChange {
            state,
            previous: ConnectionState::Idle,
            reason: None,
            cause: TransitionCause::UserRequest,
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.publish(change(ConnectionState::Connecting)), 2);

        assert!(matches!(a.recv().await.unwrap(), VpnEvent::StatusChanged(_)));
        assert!(matches!(b.recv().await.unwrap(), VpnEvent::StatusChanged(_)));
    }

    #[test]
    fn publish_without_subscribers_is_harmless() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(VpnEvent::EngineLog("hello".into())), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn stream_skips_lagged_gap() {
        let bus = EventBus::new(2);
        let mut stream = Box::pin(bus.stream());
        for i in 0..5 {
            bus.publish(VpnEvent::EngineLog(format!("line {i}")));
        }
        let first = stream.next().await.unwrap();
        assert_eq!(first, VpnEvent::EngineLog("line 3".into()));
    }

    #[test]
    fn event_serde_shape() {
        let json = serde_json::to_value(VpnEvent::AddressAssigned("10.8.0.2".into())).unwrap();
        assert_eq!(json["type"], "address_assigned");
        assert_eq!(json["payload"], "10.8.0.2");
    }
}
