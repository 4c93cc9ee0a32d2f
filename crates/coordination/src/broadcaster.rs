//! Topic fan-out
//!
//! Each resource actor owns one [`Topic`]: the set of connections subscribed
//! to its key and their outbound channels. Delivery is fire-and-forget over
//! unbounded channels, so a slow or vanished subscriber never blocks the
//! publisher and never affects delivery to the others.

use std::collections::HashMap;

use huddle_shared::{ConnectionId, ResourceKey};
use tokio::sync::mpsc;

use crate::events::ServerEvent;

/// Channel carrying events to one connection
pub type Outbound = mpsc::UnboundedSender<ServerEvent>;

/// Subscribers of one resource key
#[derive(Debug)]
pub struct Topic {
    key: ResourceKey,
    subscribers: HashMap<ConnectionId, Outbound>,
}

impl Topic {
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            subscribers: HashMap::new(),
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Add a subscriber. Returns false if it was already subscribed, in
    /// which case its outbound channel is refreshed.
    pub fn subscribe(&mut self, connection_id: ConnectionId, outbound: Outbound) -> bool {
        let added = self.subscribers.insert(connection_id, outbound).is_none();
        if added {
            tracing::debug!(
                resource = %self.key,
                connection_id = %connection_id,
                subscribers = self.subscribers.len(),
                "Connection subscribed to topic"
            );
        }
        added
    }

    /// Remove a subscriber. Unknown connections are ignored.
    pub fn unsubscribe(&mut self, connection_id: &ConnectionId) -> bool {
        let removed = self.subscribers.remove(connection_id).is_some();
        if removed {
            tracing::debug!(
                resource = %self.key,
                connection_id = %connection_id,
                subscribers = self.subscribers.len(),
                "Connection unsubscribed from topic"
            );
        } else {
            tracing::debug!(
                resource = %self.key,
                connection_id = %connection_id,
                "Ignoring unsubscribe from topic without that subscriber"
            );
        }
        removed
    }

    pub fn is_subscribed(&self, connection_id: &ConnectionId) -> bool {
        self.subscribers.contains_key(connection_id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Deliver to every subscriber; returns how many accepted the event
    pub fn publish(&self, event: ServerEvent) -> usize {
        self.deliver(event, None)
    }

    /// Deliver to every subscriber except the originating connection
    pub fn publish_excluding(&self, event: ServerEvent, exclude: ConnectionId) -> usize {
        self.deliver(event, Some(exclude))
    }

    fn deliver(&self, event: ServerEvent, exclude: Option<ConnectionId>) -> usize {
        if self.subscribers.is_empty() {
            return 0;
        }

        let mut success_count = 0;
        let mut failed_count = 0;

        for (connection_id, outbound) in &self.subscribers {
            if Some(*connection_id) == exclude {
                continue;
            }
            match outbound.send(event.clone()) {
                Ok(()) => success_count += 1,
                Err(_) => {
                    failed_count += 1;
                    tracing::debug!(
                        resource = %self.key,
                        connection_id = %connection_id,
                        "Dropped event for closed connection"
                    );
                }
            }
        }

        tracing::trace!(
            resource = %self.key,
            event = event.name(),
            recipients = success_count,
            failed = failed_count,
            "Published event to topic"
        );

        success_count
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn topic() -> Topic {
        Topic::new(ResourceKey::new("ticket", "T1").unwrap())
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let mut topic = topic();
        let connection_id = ConnectionId::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        assert_eq!(topic.subscriber_count(), 0);
        assert!(topic.subscribe(connection_id, tx.clone()));
        assert!(!topic.subscribe(connection_id, tx));
        assert_eq!(topic.subscriber_count(), 1);
        assert!(topic.is_subscribed(&connection_id));

        assert!(topic.unsubscribe(&connection_id));
        assert!(!topic.unsubscribe(&connection_id));
        assert_eq!(topic.subscriber_count(), 0);
    }

    #[test]
    fn test_publish_reaches_every_subscriber_in_order() {
        let mut topic = topic();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        topic.subscribe(ConnectionId::new(), tx1);
        topic.subscribe(ConnectionId::new(), tx2);

        assert_eq!(topic.publish(ServerEvent::Pong), 2);
        assert_eq!(
            topic.publish(ServerEvent::Error {
                message: "second".to_string()
            }),
            2
        );

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(rx.try_recv().unwrap(), ServerEvent::Pong);
            assert!(matches!(rx.try_recv().unwrap(), ServerEvent::Error { .. }));
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let topic = topic();
        assert_eq!(topic.publish(ServerEvent::Pong), 0);
    }

    #[test]
    fn test_publish_excluding_skips_origin() {
        let mut topic = topic();
        let origin = ConnectionId::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        topic.subscribe(origin, tx1);
        topic.subscribe(ConnectionId::new(), tx2);

        assert_eq!(topic.publish_excluding(ServerEvent::Pong, origin), 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_closed_subscriber_does_not_affect_others() {
        let mut topic = topic();
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        topic.subscribe(ConnectionId::new(), tx1);
        topic.subscribe(ConnectionId::new(), tx2);
        drop(rx1);

        assert_eq!(topic.publish(ServerEvent::Pong), 1);
        assert_eq!(rx2.try_recv().unwrap(), ServerEvent::Pong);
    }
}
