//! Cursor tracking
//!
//! Last-write-wins positions per actor on one resource. Nothing is kept
//! beyond the latest position.

use std::collections::HashMap;
use std::time::Duration;

use huddle_shared::{ActorId, ConnectionId};
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::broadcaster::Topic;
use crate::events::ServerEvent;

#[derive(Debug, Clone)]
pub struct CursorEntry {
    pub actor_id: ActorId,
    pub position: serde_json::Value,
    pub updated_at: OffsetDateTime,
    pub last_update: Instant,
    pub connection_id: ConnectionId,
}

#[derive(Debug, Default)]
pub struct CursorTracker {
    cursors: HashMap<ActorId, CursorEntry>,
}

impl CursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the actor's position and tell everyone but the mover
    pub fn update(
        &mut self,
        topic: &Topic,
        actor_id: &ActorId,
        connection_id: ConnectionId,
        position: serde_json::Value,
        now: Instant,
    ) {
        let updated_at = OffsetDateTime::now_utc();
        self.cursors.insert(
            actor_id.clone(),
            CursorEntry {
                actor_id: actor_id.clone(),
                position: position.clone(),
                updated_at,
                last_update: now,
                connection_id,
            },
        );

        topic.publish_excluding(
            ServerEvent::CursorUpdated {
                resource: topic.key().clone(),
                actor_id: actor_id.clone(),
                position,
                at: updated_at,
            },
            connection_id,
        );
    }

    pub fn remove(&mut self, topic: &Topic, actor_id: &ActorId) -> bool {
        if self.cursors.remove(actor_id).is_none() {
            return false;
        }
        publish_removed(topic, actor_id);
        true
    }

    pub fn holds_connection(&self, connection_id: ConnectionId) -> bool {
        self.cursors
            .values()
            .any(|cursor| cursor.connection_id == connection_id)
    }

    /// Drop cursors last moved from a closing connection
    pub fn remove_connection(&mut self, topic: &Topic, connection_id: ConnectionId) -> usize {
        self.remove_where(topic, |cursor| cursor.connection_id == connection_id)
    }

    /// Drop cursors idle beyond `staleness` whose owner is no longer
    /// present. Present actors keep their cursor until they leave.
    pub fn evict_stale(
        &mut self,
        topic: &Topic,
        now: Instant,
        staleness: Duration,
        is_present: impl Fn(&ActorId) -> bool,
    ) -> usize {
        self.remove_where(topic, |cursor| {
            !is_present(&cursor.actor_id)
                && now.saturating_duration_since(cursor.last_update) > staleness
        })
    }

    pub fn get(&self, actor_id: &ActorId) -> Option<&CursorEntry> {
        self.cursors.get(actor_id)
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    fn remove_where(&mut self, topic: &Topic, predicate: impl Fn(&CursorEntry) -> bool) -> usize {
        let doomed: Vec<ActorId> = self
            .cursors
            .values()
            .filter(|cursor| predicate(cursor))
            .map(|cursor| cursor.actor_id.clone())
            .collect();

        for actor_id in &doomed {
            self.cursors.remove(actor_id);
            publish_removed(topic, actor_id);
        }
        doomed.len()
    }
}

fn publish_removed(topic: &Topic, actor_id: &ActorId) {
    topic.publish(ServerEvent::CursorRemoved {
        resource: topic.key().clone(),
        actor_id: actor_id.clone(),
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use huddle_shared::ResourceKey;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[test]
    fn test_update_overwrites_and_skips_origin() {
        let mut topic = Topic::new(ResourceKey::new("canvas", "P1").unwrap());
        let mover = ConnectionId::new();
        let watcher = ConnectionId::new();
        let (mover_tx, mut mover_rx) = mpsc::unbounded_channel();
        let (watcher_tx, mut watcher_rx) = mpsc::unbounded_channel();
        topic.subscribe(mover, mover_tx);
        topic.subscribe(watcher, watcher_tx);

        let mut cursors = CursorTracker::new();
        let alice = ActorId::from("alice");
        let now = Instant::now();
        cursors.update(&topic, &alice, mover, json!({"x": 1, "y": 2}), now);
        cursors.update(&topic, &alice, mover, json!({"x": 5, "y": 8}), now);

        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors.get(&alice).unwrap().position, json!({"x": 5, "y": 8}));
        assert!(mover_rx.try_recv().is_err());

        let mut positions = Vec::new();
        while let Ok(event) = watcher_rx.try_recv() {
            if let ServerEvent::CursorUpdated { position, .. } = event {
                positions.push(position);
            }
        }
        assert_eq!(positions, vec![json!({"x": 1, "y": 2}), json!({"x": 5, "y": 8})]);
    }

    #[test]
    fn test_remove_broadcasts_once() {
        let mut topic = Topic::new(ResourceKey::new("canvas", "P1").unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        topic.subscribe(ConnectionId::new(), tx);

        let mut cursors = CursorTracker::new();
        let alice = ActorId::from("alice");
        cursors.update(&topic, &alice, ConnectionId::new(), json!(3), Instant::now());
        while rx.try_recv().is_ok() {}

        assert!(cursors.remove(&topic, &alice));
        assert!(!cursors.remove(&topic, &alice));
        assert_eq!(rx.try_recv().unwrap().name(), "cursor.removed");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_evict_stale_keeps_present_actors() {
        let topic = Topic::new(ResourceKey::new("canvas", "P1").unwrap());
        let mut cursors = CursorTracker::new();
        let start = Instant::now();
        let present = ActorId::from("alice");
        let orphan = ActorId::from("bob");

        cursors.update(&topic, &present, ConnectionId::new(), json!(1), start);
        cursors.update(&topic, &orphan, ConnectionId::new(), json!(2), start);

        let later = start + Duration::from_secs(61);
        let evicted = cursors.evict_stale(&topic, later, Duration::from_secs(60), |actor_id| {
            actor_id == &present
        });

        assert_eq!(evicted, 1);
        assert!(cursors.get(&present).is_some());
        assert!(cursors.get(&orphan).is_none());
    }
}
