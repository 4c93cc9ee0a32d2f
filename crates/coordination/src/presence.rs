//! Presence tracking
//!
//! Who is currently attending a resource, and whether they are viewing or
//! typing. One entry per actor; a second connection from the same actor
//! takes over the existing entry instead of adding another.

use std::collections::HashMap;
use std::time::Duration;

use huddle_shared::{Actor, ActorId, ConnectionId};
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::broadcaster::Topic;
use crate::events::{LeaveReason, PresenceStatus, RosterEntry, ServerEvent};

/// An actor present on a resource
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub actor: Actor,
    pub status: PresenceStatus,
    pub joined_at: OffsetDateTime,
    pub status_since: OffsetDateTime,
    pub last_seen: Instant,
    pub connection_id: ConnectionId,
    join_order: u64,
}

impl PresenceEntry {
    fn to_roster_entry(&self) -> RosterEntry {
        RosterEntry {
            actor_id: self.actor.id.clone(),
            actor_name: self.actor.name.clone(),
            status: self.status,
            since: self.status_since,
            joined_at: self.joined_at,
        }
    }

    fn is_stale(&self, now: Instant, staleness: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > staleness
    }
}

/// Result of a join
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Everyone else already present, in join order
    pub others: Vec<RosterEntry>,
    /// The actor already had an entry and only its connection was refreshed
    pub reconnected: bool,
}

impl JoinOutcome {
    /// Joining an occupied resource warrants a warning, never a rejection
    pub fn has_collision(&self) -> bool {
        !self.others.is_empty()
    }
}

/// Presence entries of one resource
#[derive(Debug, Default)]
pub struct PresenceTracker {
    entries: HashMap<ActorId, PresenceEntry>,
    next_join_order: u64,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(
        &mut self,
        topic: &Topic,
        actor: &Actor,
        connection_id: ConnectionId,
        now: Instant,
    ) -> JoinOutcome {
        let reconnected = match self.entries.get_mut(&actor.id) {
            Some(entry) => {
                entry.connection_id = connection_id;
                entry.last_seen = now;
                entry.actor.name = actor.name.clone();
                true
            }
            None => {
                let joined_at = OffsetDateTime::now_utc();
                let join_order = self.next_join_order;
                self.next_join_order += 1;
                self.entries.insert(
                    actor.id.clone(),
                    PresenceEntry {
                        actor: actor.clone(),
                        status: PresenceStatus::Viewing,
                        joined_at,
                        status_since: joined_at,
                        last_seen: now,
                        connection_id,
                        join_order,
                    },
                );
                false
            }
        };

        let others: Vec<RosterEntry> = self
            .roster()
            .into_iter()
            .filter(|entry| entry.actor_id != actor.id)
            .collect();

        if !reconnected {
            topic.publish(ServerEvent::PresenceJoined {
                resource: topic.key().clone(),
                actor_id: actor.id.clone(),
                actor_name: actor.name.clone(),
                at: OffsetDateTime::now_utc(),
            });
        }
        self.publish_roster(topic);

        tracing::debug!(
            resource = %topic.key(),
            actor_id = %actor.id,
            connection_id = %connection_id,
            reconnected,
            occupants = others.len(),
            "Actor joined resource"
        );

        JoinOutcome {
            others,
            reconnected,
        }
    }

    /// Change status of an existing entry. Returns false when the actor is
    /// not present; status changes never create presence.
    pub fn set_status(
        &mut self,
        topic: &Topic,
        actor_id: &ActorId,
        status: PresenceStatus,
        now: Instant,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(actor_id) else {
            tracing::debug!(
                resource = %topic.key(),
                actor_id = %actor_id,
                "Ignoring status change for absent actor"
            );
            return false;
        };

        entry.last_seen = now;
        if entry.status == status {
            return true;
        }
        entry.status = status;
        entry.status_since = OffsetDateTime::now_utc();

        let event = match status {
            PresenceStatus::Typing => ServerEvent::TypingStarted {
                resource: topic.key().clone(),
                actor_id: actor_id.clone(),
                actor_name: entry.actor.name.clone(),
                collision_risk: status.is_collision_risk(),
            },
            PresenceStatus::Viewing => ServerEvent::TypingStopped {
                resource: topic.key().clone(),
                actor_id: actor_id.clone(),
            },
        };
        topic.publish(event);
        true
    }

    /// Refresh an entry's idle clock without changing anything else
    pub fn touch(&mut self, actor_id: &ActorId, now: Instant) {
        if let Some(entry) = self.entries.get_mut(actor_id) {
            entry.last_seen = now;
        }
    }

    pub fn leave(
        &mut self,
        topic: &Topic,
        actor_id: &ActorId,
        reason: LeaveReason,
    ) -> Option<PresenceEntry> {
        let Some(entry) = self.entries.remove(actor_id) else {
            tracing::debug!(
                resource = %topic.key(),
                actor_id = %actor_id,
                "Ignoring leave for absent actor"
            );
            return None;
        };

        publish_left(topic, actor_id, reason);
        self.publish_roster(topic);
        Some(entry)
    }

    /// Remove every entry owned by a closing connection
    pub fn remove_connection(&mut self, topic: &Topic, connection_id: ConnectionId) -> Vec<ActorId> {
        let removed = self.remove_where(|entry| entry.connection_id == connection_id);
        self.announce_removals(topic, &removed, LeaveReason::Disconnect);
        removed
    }

    /// Evict entries idle for longer than `staleness`, judged at `now`
    pub fn evict_stale(&mut self, topic: &Topic, now: Instant, staleness: Duration) -> Vec<ActorId> {
        let removed = self.remove_where(|entry| entry.is_stale(now, staleness));
        self.announce_removals(topic, &removed, LeaveReason::Stale);
        removed
    }

    /// Current entries in join order
    pub fn roster(&self) -> Vec<RosterEntry> {
        let mut entries: Vec<&PresenceEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.join_order);
        entries.into_iter().map(PresenceEntry::to_roster_entry).collect()
    }

    pub fn get(&self, actor_id: &ActorId) -> Option<&PresenceEntry> {
        self.entries.get(actor_id)
    }

    /// Whether an entry was last joined from `connection_id`
    pub fn holds_connection(&self, connection_id: ConnectionId) -> bool {
        self.entries
            .values()
            .any(|entry| entry.connection_id == connection_id)
    }

    pub fn contains(&self, actor_id: &ActorId) -> bool {
        self.entries.contains_key(actor_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn typing_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.status == PresenceStatus::Typing)
            .count()
    }

    fn remove_where(&mut self, predicate: impl Fn(&PresenceEntry) -> bool) -> Vec<ActorId> {
        let mut doomed: Vec<(u64, ActorId)> = self
            .entries
            .values()
            .filter(|entry| predicate(entry))
            .map(|entry| (entry.join_order, entry.actor.id.clone()))
            .collect();
        doomed.sort();

        doomed
            .into_iter()
            .map(|(_, actor_id)| {
                self.entries.remove(&actor_id);
                actor_id
            })
            .collect()
    }

    fn announce_removals(&self, topic: &Topic, removed: &[ActorId], reason: LeaveReason) {
        if removed.is_empty() {
            return;
        }
        for actor_id in removed {
            publish_left(topic, actor_id, reason);
        }
        self.publish_roster(topic);
    }

    fn publish_roster(&self, topic: &Topic) {
        topic.publish(ServerEvent::PresenceRoster {
            resource: topic.key().clone(),
            entries: self.roster(),
        });
    }
}

fn publish_left(topic: &Topic, actor_id: &ActorId, reason: LeaveReason) {
    topic.publish(ServerEvent::PresenceLeft {
        resource: topic.key().clone(),
        actor_id: actor_id.clone(),
        reason,
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use huddle_shared::ResourceKey;
    use tokio::sync::mpsc;

    fn alice() -> Actor {
        Actor::new("alice", "Alice")
    }

    fn bob() -> Actor {
        Actor::new("bob", "Bob")
    }

    fn watched_topic() -> (Topic, mpsc::UnboundedReceiver<ServerEvent>) {
        let mut topic = Topic::new(ResourceKey::new("ticket", "T1").unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        topic.subscribe(ConnectionId::new(), tx);
        (topic, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn names(events: &[ServerEvent]) -> Vec<&'static str> {
        events.iter().map(ServerEvent::name).collect()
    }

    #[test]
    fn test_join_reports_existing_occupants() {
        let (topic, mut rx) = watched_topic();
        let mut tracker = PresenceTracker::new();
        let now = Instant::now();

        let first = tracker.join(&topic, &alice(), ConnectionId::new(), now);
        assert!(!first.has_collision());
        assert!(!first.reconnected);

        let second = tracker.join(&topic, &bob(), ConnectionId::new(), now);
        assert!(second.has_collision());
        assert_eq!(second.others.len(), 1);
        assert_eq!(second.others[0].actor_id, ActorId::from("alice"));

        let roster: Vec<String> = tracker
            .roster()
            .into_iter()
            .map(|entry| entry.actor_name)
            .collect();
        assert_eq!(roster, vec!["Alice", "Bob"]);

        assert_eq!(
            names(&drain(&mut rx)),
            vec![
                "presence.joined",
                "presence.roster",
                "presence.joined",
                "presence.roster"
            ]
        );
    }

    #[test]
    fn test_rejoin_from_new_connection_updates_in_place() {
        let (topic, mut rx) = watched_topic();
        let mut tracker = PresenceTracker::new();
        let now = Instant::now();
        let first_connection = ConnectionId::new();
        let second_connection = ConnectionId::new();

        tracker.join(&topic, &alice(), first_connection, now);
        drain(&mut rx);

        let outcome = tracker.join(&topic, &alice(), second_connection, now);
        assert!(outcome.reconnected);
        assert_eq!(tracker.len(), 1);
        assert_eq!(
            tracker.get(&ActorId::from("alice")).unwrap().connection_id,
            second_connection
        );

        // Reconnects refresh the roster but do not announce a new join
        assert_eq!(names(&drain(&mut rx)), vec!["presence.roster"]);
    }

    #[test]
    fn test_status_change_requires_presence() {
        let (topic, mut rx) = watched_topic();
        let mut tracker = PresenceTracker::new();

        assert!(!tracker.set_status(
            &topic,
            &ActorId::from("ghost"),
            PresenceStatus::Typing,
            Instant::now()
        ));
        assert!(tracker.is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_typing_transitions_broadcast_once() {
        let (topic, mut rx) = watched_topic();
        let mut tracker = PresenceTracker::new();
        let now = Instant::now();
        tracker.join(&topic, &alice(), ConnectionId::new(), now);
        drain(&mut rx);

        let alice_id = ActorId::from("alice");
        assert!(tracker.set_status(&topic, &alice_id, PresenceStatus::Typing, now));
        assert!(tracker.set_status(&topic, &alice_id, PresenceStatus::Typing, now));
        assert_eq!(tracker.typing_count(), 1);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::TypingStarted {
                actor_name,
                collision_risk,
                ..
            } => {
                assert_eq!(actor_name, "Alice");
                assert!(collision_risk);
            }
            other => panic!("Expected typing.started, got {:?}", other),
        }

        assert!(tracker.set_status(&topic, &alice_id, PresenceStatus::Viewing, now));
        assert_eq!(names(&drain(&mut rx)), vec!["typing.stopped"]);
        assert_eq!(tracker.typing_count(), 0);
    }

    #[test]
    fn test_leave_is_noop_when_absent() {
        let (topic, mut rx) = watched_topic();
        let mut tracker = PresenceTracker::new();
        tracker.join(&topic, &alice(), ConnectionId::new(), Instant::now());
        drain(&mut rx);

        assert!(tracker
            .leave(&topic, &ActorId::from("alice"), LeaveReason::Explicit)
            .is_some());
        assert!(tracker
            .leave(&topic, &ActorId::from("alice"), LeaveReason::Explicit)
            .is_none());

        let events = drain(&mut rx);
        assert_eq!(names(&events), vec!["presence.left", "presence.roster"]);
        assert!(matches!(
            &events[0],
            ServerEvent::PresenceLeft {
                reason: LeaveReason::Explicit,
                ..
            }
        ));
    }

    #[test]
    fn test_remove_connection_only_drops_its_entries() {
        let (topic, _rx) = watched_topic();
        let mut tracker = PresenceTracker::new();
        let now = Instant::now();
        let closing = ConnectionId::new();

        tracker.join(&topic, &alice(), closing, now);
        tracker.join(&topic, &bob(), ConnectionId::new(), now);

        let removed = tracker.remove_connection(&topic, closing);
        assert_eq!(removed, vec![ActorId::from("alice")]);
        assert!(tracker.contains(&ActorId::from("bob")));
        assert!(tracker.remove_connection(&topic, closing).is_empty());
    }

    #[test]
    fn test_evict_stale_respects_recent_activity() {
        let (topic, mut rx) = watched_topic();
        let mut tracker = PresenceTracker::new();
        let start = Instant::now();
        let staleness = Duration::from_secs(1800);

        tracker.join(&topic, &alice(), ConnectionId::new(), start);
        tracker.join(&topic, &bob(), ConnectionId::new(), start);
        tracker.touch(&ActorId::from("bob"), start + Duration::from_secs(1000));
        drain(&mut rx);

        let evicted = tracker.evict_stale(&topic, start + Duration::from_secs(1801), staleness);
        assert_eq!(evicted, vec![ActorId::from("alice")]);
        assert!(tracker.contains(&ActorId::from("bob")));

        let events = drain(&mut rx);
        assert!(matches!(
            &events[0],
            ServerEvent::PresenceLeft {
                reason: LeaveReason::Stale,
                ..
            }
        ));
        assert_eq!(events[1].name(), "presence.roster");
    }
}
