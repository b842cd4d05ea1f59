//! Message bus for lifecycle and security notifications
//!
//! The orchestrator publishes a notification whenever a plugin is installed,
//! reviewed, uninstalled, has its permissions changed, trips or recovers its
//! circuit breaker, or causes a security event. Hosts subscribe to forward
//! these to dashboards or alerting without polling the read APIs.
//!
//! Every subscriber gets its own bounded channel. Publishing never waits on a
//! subscriber: a full channel drops the notification and a closed one is
//! pruned.

use crate::circuit_breaker::BreakerTransition;
use crate::events::{SecurityEventType, Severity};
use crate::review::ReviewDecision;
use sdk::permissions::Permission;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 100;

/// Event types that can be published on the message bus
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventType {
    PluginInstalled,
    ReviewPending,
    ReviewDecided,
    PluginUninstalled,
    PermissionChanged,
    CircuitOpened,
    CircuitClosed,
    SecurityEventRaised,
    /// Subscribe to all event types
    All,
}

/// Which administrative path changed a permission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionChange {
    Granted,
    Revoked,
    Escalated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    PluginInstalled {
        plugin_id: String,
        version: String,
    },
    ReviewPending {
        plugin_id: String,
        risk_score: f64,
    },
    ReviewDecided {
        plugin_id: String,
        decision: ReviewDecision,
        reviewer: Option<String>,
    },
    PluginUninstalled {
        plugin_id: String,
    },
    PermissionChanged {
        plugin_id: String,
        permission: Permission,
        change: PermissionChange,
        actor: String,
    },
    CircuitOpened {
        plugin_id: String,
        transition: BreakerTransition,
    },
    CircuitClosed {
        plugin_id: String,
    },
    SecurityEventRaised {
        event_id: String,
        plugin_id: String,
        event_type: SecurityEventType,
        severity: Severity,
    },
}

impl Event {
    /// Get the event type for this event
    pub fn event_type(&self) -> EventType {
        match self {
            Event::PluginInstalled { .. } => EventType::PluginInstalled,
            Event::ReviewPending { .. } => EventType::ReviewPending,
            Event::ReviewDecided { .. } => EventType::ReviewDecided,
            Event::PluginUninstalled { .. } => EventType::PluginUninstalled,
            Event::PermissionChanged { .. } => EventType::PermissionChanged,
            Event::CircuitOpened { .. } => EventType::CircuitOpened,
            Event::CircuitClosed { .. } => EventType::CircuitClosed,
            Event::SecurityEventRaised { .. } => EventType::SecurityEventRaised,
        }
    }

    pub fn plugin_id(&self) -> &str {
        match self {
            Event::PluginInstalled { plugin_id, .. }
            | Event::ReviewPending { plugin_id, .. }
            | Event::ReviewDecided { plugin_id, .. }
            | Event::PluginUninstalled { plugin_id }
            | Event::PermissionChanged { plugin_id, .. }
            | Event::CircuitOpened { plugin_id, .. }
            | Event::CircuitClosed { plugin_id }
            | Event::SecurityEventRaised { plugin_id, .. } => plugin_id,
        }
    }
}

/// Message bus for pub/sub notifications
///
/// Subscribers pick a single event type or `EventType::All`.
pub struct MessageBus {
    channels: Arc<Mutex<HashMap<EventType, Vec<mpsc::Sender<Event>>>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to a specific event type, or `EventType::All`
    ///
    /// The channel is bounded with `CHANNEL_BUFFER_SIZE` capacity.
    pub async fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut channels = self.channels.lock().await;
        channels.entry(event_type).or_default().push(tx);
        rx
    }

    /// Publish an event to its subscribers and to `All` subscribers
    ///
    /// Returns how many subscribers received it.
    pub async fn publish(&self, event: Event) -> usize {
        let mut channels = self.channels.lock().await;
        let mut delivered = 0;

        for key in [event.event_type(), EventType::All] {
            let Some(subscribers) = channels.get_mut(&key) else {
                continue;
            };
            subscribers.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(
                        plugin_id = event.plugin_id(),
                        event_type = ?key,
                        "Subscriber is full, notification dropped"
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
        }

        delivered
    }

    pub async fn subscriber_count(&self) -> usize {
        self.channels.lock().await.values().map(Vec::len).sum()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed(id: &str) -> Event {
        Event::PluginInstalled {
            plugin_id: id.to_string(),
            version: "1.0.0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_publish() {
        let bus = MessageBus::new();
        let mut rx = bus.subscribe(EventType::PluginInstalled).await;

        assert_eq!(bus.publish(installed("p1")).await, 1);

        match rx.recv().await.unwrap() {
            Event::PluginInstalled { plugin_id, version } => {
                assert_eq!(plugin_id, "p1");
                assert_eq!(version, "1.0.0");
            }
            other => panic!("Wrong event received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_all_subscribers_see_everything() {
        let bus = MessageBus::new();
        let mut rx_all = bus.subscribe(EventType::All).await;
        let mut rx_closed = bus.subscribe(EventType::CircuitClosed).await;

        bus.publish(installed("p1")).await;
        bus.publish(Event::CircuitClosed {
            plugin_id: "p2".to_string(),
        })
        .await;

        assert_eq!(rx_all.recv().await.unwrap().plugin_id(), "p1");
        assert_eq!(rx_all.recv().await.unwrap().plugin_id(), "p2");
        assert_eq!(rx_closed.recv().await.unwrap().plugin_id(), "p2");
        assert!(rx_closed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_subscriber_never_blocks_publish() {
        let bus = MessageBus::new();
        let mut rx = bus.subscribe(EventType::PluginInstalled).await;

        for i in 0..CHANNEL_BUFFER_SIZE + 10 {
            bus.publish(installed(&format!("p{}", i))).await;
        }

        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, CHANNEL_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let bus = MessageBus::new();
        let rx = bus.subscribe(EventType::PluginUninstalled).await;
        drop(rx);

        let delivered = bus
            .publish(Event::PluginUninstalled {
                plugin_id: "p1".to_string(),
            })
            .await;
        assert_eq!(delivered, 0);
        assert_eq!(bus.subscriber_count().await, 0);
    }
}
