//! Event notifications for observers such as metrics or reporting subsystems.
//!
//! Each [`EventCategory`] has its own broadcast channel. Subscribers see the
//! events of their category in emission order; a subscriber that falls more
//! than the channel capacity behind skips the oldest events.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::routing::CircuitState;

/// Default per-category channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Connection,
    Message,
    Routing,
    Circuit,
    Security,
}

impl EventCategory {
    pub const ALL: [EventCategory; 5] = [
        EventCategory::Connection,
        EventCategory::Message,
        EventCategory::Routing,
        EventCategory::Circuit,
        EventCategory::Security,
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ProtocolEvent {
    ConnectionEstablished {
        connection_id: String,
        target_id: String,
        protocol: String,
    },
    ConnectionClosed {
        connection_id: String,
    },
    Heartbeat {
        connection_id: String,
    },
    MessageSent {
        message_id: String,
        destination_id: String,
        protocol: String,
        latency_ms: u64,
        bytes: usize,
    },
    MessageReceived {
        message_id: String,
        source_id: String,
    },
    RoutingRuleMatched {
        rule_id: String,
        message_id: String,
    },
    CircuitStateChanged {
        source_id: String,
        destination_id: String,
        from: CircuitState,
        to: CircuitState,
    },
    KeyRotated {
        agent_id: String,
        old_key_id: String,
        new_key_id: String,
    },
    KeyRevoked {
        key_id: String,
        reason: String,
    },
    AuthenticationSucceeded {
        agent_id: String,
    },
    AuthenticationFailed {
        agent_id: String,
        reason: String,
    },
}

impl ProtocolEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            ProtocolEvent::ConnectionEstablished { .. }
            | ProtocolEvent::ConnectionClosed { .. }
            | ProtocolEvent::Heartbeat { .. } => EventCategory::Connection,
            ProtocolEvent::MessageSent { .. } | ProtocolEvent::MessageReceived { .. } => {
                EventCategory::Message
            }
            ProtocolEvent::RoutingRuleMatched { .. } => EventCategory::Routing,
            ProtocolEvent::CircuitStateChanged { .. } => EventCategory::Circuit,
            ProtocolEvent::KeyRotated { .. }
            | ProtocolEvent::KeyRevoked { .. }
            | ProtocolEvent::AuthenticationSucceeded { .. }
            | ProtocolEvent::AuthenticationFailed { .. } => EventCategory::Security,
        }
    }
}

/// A registered subscriber to one event category.
pub struct Subscription {
    category: EventCategory,
    rx: broadcast::Receiver<ProtocolEvent>,
}

impl Subscription {
    pub fn category(&self) -> EventCategory {
        self.category
    }

    /// Waits for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<ProtocolEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(category = ?self.category, skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<ProtocolEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Cloneable handle to the per-category broadcast channels.
#[derive(Clone)]
pub struct EventBus {
    channels: Arc<HashMap<EventCategory, broadcast::Sender<ProtocolEvent>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let channels = EventCategory::ALL
            .iter()
            .map(|category| (*category, broadcast::channel(capacity).0))
            .collect();
        Self {
            channels: Arc::new(channels),
        }
    }

    pub fn subscribe(&self, category: EventCategory) -> Subscription {
        Subscription {
            category,
            rx: self.sender(category).subscribe(),
        }
    }

    /// Unregisters a subscriber. Events emitted afterwards are not retained for it.
    pub fn unsubscribe(&self, subscription: Subscription) {
        debug!(category = ?subscription.category, "Event subscriber removed");
        drop(subscription);
    }

    pub fn subscriber_count(&self, category: EventCategory) -> usize {
        self.sender(category).receiver_count()
    }

    /// Delivers the event to every current subscriber of its category.
    pub fn emit(&self, event: ProtocolEvent) {
        // No subscribers is the normal case, not an error.
        let _ = self.sender(event.category()).send(event);
    }

    fn sender(&self, category: EventCategory) -> &broadcast::Sender<ProtocolEvent> {
        // Every category is inserted in `new`.
        &self.channels[&category]
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed(id: &str) -> ProtocolEvent {
        ProtocolEvent::ConnectionClosed {
            connection_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_events_reach_only_their_category() {
        let bus = EventBus::default();
        let mut connections = bus.subscribe(EventCategory::Connection);
        let mut security = bus.subscribe(EventCategory::Security);

        bus.emit(closed("a:http"));

        assert_eq!(connections.recv().await, Some(closed("a:http")));
        assert!(security.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_delivery_is_fifo_per_subscriber() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(EventCategory::Connection);

        for id in ["1", "2", "3"] {
            bus.emit(closed(id));
        }

        assert_eq!(sub.try_recv(), Some(closed("1")));
        assert_eq!(sub.try_recv(), Some(closed("2")));
        assert_eq!(sub.try_recv(), Some(closed("3")));
    }

    #[test]
    fn test_unsubscribe_drops_receiver() {
        let bus = EventBus::default();
        let sub = bus.subscribe(EventCategory::Routing);
        assert_eq!(bus.subscriber_count(EventCategory::Routing), 1);

        bus.unsubscribe(sub);
        assert_eq!(bus.subscriber_count(EventCategory::Routing), 0);
    }
}
