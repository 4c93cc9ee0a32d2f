//! Resource leases
//!
//! A [`LeaseSlot`] holds at most one lease for its resource. Expiry is
//! judged lazily against a monotonic deadline: on the next acquire, status
//! peek or sweep, never by a per-lease timer.

use std::time::Duration;

use huddle_shared::{Actor, ActorId};
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::broadcaster::Topic;
use crate::config::MAX_DURATION;
use crate::events::{LockInfo, ServerEvent};

#[derive(Debug, Clone)]
pub struct Lease {
    pub holder: Actor,
    pub acquired_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    deadline: Instant,
}

impl Lease {
    fn new(holder: Actor, ttl: Duration, now: Instant) -> Self {
        let acquired_at = OffsetDateTime::now_utc();
        let (expires_at, deadline) = expiry(acquired_at, now, ttl);
        Self {
            holder,
            acquired_at,
            expires_at,
            deadline,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    fn extend(&mut self, ttl: Duration, now: Instant) {
        (self.expires_at, self.deadline) = expiry(OffsetDateTime::now_utc(), now, ttl);
    }

    fn info(&self, topic: &Topic) -> LockInfo {
        LockInfo {
            resource: topic.key().clone(),
            locked: true,
            holder: Some(self.holder.id.clone()),
            holder_name: Some(self.holder.name.clone()),
            acquired_at: Some(self.acquired_at),
            expires_at: Some(self.expires_at),
        }
    }
}

/// Wall-clock and monotonic expiry of a lease taken at `wall`/`now`
fn expiry(wall: OffsetDateTime, now: Instant, ttl: Duration) -> (OffsetDateTime, Instant) {
    let ttl = ttl.min(MAX_DURATION);
    let expires_at = time::Duration::try_from(ttl)
        .ok()
        .and_then(|ttl| wall.checked_add(ttl))
        .unwrap_or(wall);
    let deadline = now.checked_add(ttl).unwrap_or(now);
    (expires_at, deadline)
}

/// Result of an acquire. Contention is an answer, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted { lease: LockInfo, renewed: bool },
    Denied {
        holder: ActorId,
        expires_at: OffsetDateTime,
    },
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireOutcome::Granted { .. })
    }
}

#[derive(Debug, Default)]
pub struct LeaseSlot {
    current: Option<Lease>,
}

impl LeaseSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, topic: &Topic, actor: &Actor, ttl: Duration, now: Instant) -> AcquireOutcome {
        self.expire(topic, now);

        if let Some(lease) = self.current.as_ref().filter(|lease| lease.holder.id != actor.id) {
            tracing::debug!(
                resource = %topic.key(),
                actor_id = %actor.id,
                holder = %lease.holder.id,
                "Lease contended"
            );
            return AcquireOutcome::Denied {
                holder: lease.holder.id.clone(),
                expires_at: lease.expires_at,
            };
        }

        let renewed = self.current.is_some();
        let lease = self
            .current
            .get_or_insert_with(|| Lease::new(actor.clone(), ttl, now));
        if renewed {
            lease.extend(ttl, now);
        }

        topic.publish(ServerEvent::LockAcquired {
            resource: topic.key().clone(),
            holder: lease.holder.id.clone(),
            holder_name: lease.holder.name.clone(),
            expires_at: lease.expires_at,
            renewed,
        });

        tracing::debug!(
            resource = %topic.key(),
            actor_id = %actor.id,
            ttl_secs = ttl.as_secs(),
            renewed,
            "Lease granted"
        );

        AcquireOutcome::Granted {
            lease: lease.info(topic),
            renewed,
        }
    }

    /// Release only if `actor_id` is the current holder
    pub fn release(&mut self, topic: &Topic, actor_id: &ActorId) -> bool {
        match &self.current {
            Some(lease) if &lease.holder.id == actor_id => {
                self.current = None;
                topic.publish(ServerEvent::LockReleased {
                    resource: topic.key().clone(),
                    holder: actor_id.clone(),
                });
                tracing::debug!(resource = %topic.key(), actor_id = %actor_id, "Lease released");
                true
            }
            Some(lease) => {
                tracing::debug!(
                    resource = %topic.key(),
                    actor_id = %actor_id,
                    holder = %lease.holder.id,
                    "Ignoring release by non-holder"
                );
                false
            }
            None => {
                tracing::debug!(
                    resource = %topic.key(),
                    actor_id = %actor_id,
                    "Ignoring release of unlocked resource"
                );
                false
            }
        }
    }

    /// Peek at the lease, reclaiming it first if it has run out
    pub fn status(&mut self, topic: &Topic, now: Instant) -> LockInfo {
        self.expire(topic, now);
        self.snapshot(topic, now)
    }

    /// Current view at `now`, leaving an expired lease for the next
    /// acquire, status peek or sweep to reclaim
    pub fn snapshot(&self, topic: &Topic, now: Instant) -> LockInfo {
        match &self.current {
            Some(lease) if !lease.is_expired(now) => lease.info(topic),
            _ => LockInfo::unlocked(topic.key().clone()),
        }
    }

    /// Drop the lease if its deadline has passed at `now`
    pub fn expire(&mut self, topic: &Topic, now: Instant) -> Option<ActorId> {
        if !self.current.as_ref().is_some_and(|lease| lease.is_expired(now)) {
            return None;
        }
        let lease = self.current.take()?;

        topic.publish(ServerEvent::LockExpired {
            resource: topic.key().clone(),
            holder: lease.holder.id.clone(),
        });
        tracing::debug!(
            resource = %topic.key(),
            holder = %lease.holder.id,
            "Lease expired"
        );
        Some(lease.holder.id)
    }

    pub fn holder(&self) -> Option<&ActorId> {
        self.current.as_ref().map(|lease| &lease.holder.id)
    }

    pub fn is_locked(&self) -> bool {
        self.current.is_some()
    }
}
