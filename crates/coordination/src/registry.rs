//! Connection registry
//!
//! Knows every live connection, the actor behind it, and which resource
//! keys it has touched, so a disconnect only visits the resources that can
//! hold state for it. A key is forgotten again once the connection holds
//! nothing there. It also counts live connections per actor: an actor's
//! leases are released on disconnect only when its last connection closes.

use std::collections::{BTreeSet, HashMap, HashSet};

use huddle_shared::{Actor, ActorId, ConnectionId, ResourceKey};
use time::OffsetDateTime;

use crate::broadcaster::Outbound;

/// A live connection
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub actor: Actor,
    pub outbound: Outbound,
    pub connected_at: OffsetDateTime,
    /// Touched keys with the generation of their latest touch
    touched: HashMap<ResourceKey, u64>,
    touches: u64,
}

impl ConnectionRecord {
    pub fn has_touched(&self, key: &ResourceKey) -> bool {
        self.touched.contains_key(key)
    }
}

/// Cleanup work for one closed connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectPlan {
    pub connection_id: ConnectionId,
    pub actor_id: ActorId,
    /// Every resource that may hold state for the connection or, when
    /// `release_lease_of` is set, a lease of its actor
    pub keys: BTreeSet<ResourceKey>,
    /// Set when this was the actor's last live connection
    pub release_lease_of: Option<ActorId>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionRecord>,
    actor_connections: HashMap<ActorId, HashSet<ConnectionId>>,
    actor_leases: HashMap<ActorId, HashSet<ResourceKey>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, actor: Actor, outbound: Outbound) -> ConnectionId {
        let connection_id = ConnectionId::new();
        self.actor_connections
            .entry(actor.id.clone())
            .or_default()
            .insert(connection_id);
        self.connections.insert(
            connection_id,
            ConnectionRecord {
                actor,
                outbound,
                connected_at: OffsetDateTime::now_utc(),
                touched: HashMap::new(),
                touches: 0,
            },
        );
        connection_id
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<&ConnectionRecord> {
        self.connections.get(connection_id)
    }

    /// Note that the connection may now own state on `key`
    pub fn touch(&mut self, connection_id: &ConnectionId, key: &ResourceKey) -> bool {
        match self.connections.get_mut(connection_id) {
            Some(record) => {
                record.touches += 1;
                record.touched.insert(key.clone(), record.touches);
                true
            }
            None => false,
        }
    }

    /// Generation of the latest touch of `key` by the connection
    pub fn touch_generation(&self, connection_id: &ConnectionId, key: &ResourceKey) -> Option<u64> {
        self.connections.get(connection_id)?.touched.get(key).copied()
    }

    /// Forget `key` for the connection unless it was touched again after
    /// `generation`
    pub fn untouch(&mut self, connection_id: &ConnectionId, key: &ResourceKey, generation: u64) -> bool {
        let Some(record) = self.connections.get_mut(connection_id) else {
            return false;
        };
        if record.touched.get(key) != Some(&generation) {
            return false;
        }
        record.touched.remove(key);
        true
    }

    /// Note that the actor may hold the lease on `key`
    pub fn record_lease(&mut self, actor_id: &ActorId, key: &ResourceKey) {
        self.actor_leases
            .entry(actor_id.clone())
            .or_default()
            .insert(key.clone());
    }

    pub fn forget_lease(&mut self, actor_id: &ActorId, key: &ResourceKey) {
        if let Some(keys) = self.actor_leases.get_mut(actor_id) {
            keys.remove(key);
            if keys.is_empty() {
                self.actor_leases.remove(actor_id);
            }
        }
    }

    /// Drop a connection. Returns `None` if it was already gone, which
    /// makes repeated disconnects harmless.
    pub fn remove(&mut self, connection_id: &ConnectionId) -> Option<DisconnectPlan> {
        let record = self.connections.remove(connection_id)?;
        let actor_id = record.actor.id;

        let last_connection = match self.actor_connections.get_mut(&actor_id) {
            Some(live) => {
                live.remove(connection_id);
                live.is_empty()
            }
            None => true,
        };

        let mut keys: BTreeSet<ResourceKey> = record.touched.into_keys().collect();
        let release_lease_of = if last_connection {
            self.actor_connections.remove(&actor_id);
            if let Some(leases) = self.actor_leases.remove(&actor_id) {
                keys.extend(leases);
            }
            Some(actor_id.clone())
        } else {
            None
        };

        Some(DisconnectPlan {
            connection_id: *connection_id,
            actor_id,
            keys,
            release_lease_of,
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn actor_connection_count(&self, actor_id: &ActorId) -> usize {
        self.actor_connections.get(actor_id).map_or(0, HashSet::len)
    }

    /// Live connection ids, used at shutdown
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }
}
