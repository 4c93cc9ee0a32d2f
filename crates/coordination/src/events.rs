//! Outbound event types and serialization
//!
//! Every event the core emits, either broadcast on a resource topic or sent
//! directly to one connection. Events are tagged with their dotted name
//! (`presence.joined`, `lock.expired`, ...) under the `event` field.

use huddle_shared::{ActorId, ConnectionId, ResourceKey};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

// =============================================================================
// Event Data Structures
// =============================================================================

/// What an actor present on a resource is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Viewing,
    #[serde(alias = "editing")]
    Typing,
}

impl PresenceStatus {
    /// Whether concurrent edits are likely while an actor is in this state
    pub fn is_collision_risk(self) -> bool {
        matches!(self, Self::Typing)
    }
}

/// Why a presence entry went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    Explicit,
    Disconnect,
    Stale,
}

/// One roster line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub actor_id: ActorId,
    pub actor_name: String,
    pub status: PresenceStatus,
    /// When the current status began
    #[serde(with = "time::serde::rfc3339")]
    pub since: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: OffsetDateTime,
}

/// Read-only view of a resource's lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub resource: ResourceKey,
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<ActorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_name: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub acquired_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<OffsetDateTime>,
}

impl LockInfo {
    pub fn unlocked(resource: ResourceKey) -> Self {
        Self {
            resource,
            locked: false,
            holder: None,
            holder_name: None,
            acquired_at: None,
            expires_at: None,
        }
    }
}

/// Kind of domain mutation an activity event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    New,
    Updated,
    Deleted,
    Bulk,
    Refresh,
}

/// A domain mutation re-broadcast to a timeline-style topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub resource: ResourceKey,
    pub item_id: String,
    pub kind: ActivityKind,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

// =============================================================================
// Server-to-Client Events
// =============================================================================

/// Events delivered to connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerEvent {
    /// Connection acknowledged
    #[serde(rename = "connected")]
    Connected { connection_id: ConnectionId },

    /// Heartbeat response
    #[serde(rename = "pong")]
    Pong,

    /// Rejected inbound frame
    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "topic.subscribed")]
    Subscribed {
        resource: ResourceKey,
        subscribers: usize,
    },

    /// A connection stopped listening on a topic
    #[serde(rename = "topic.unsubscribed")]
    Unsubscribed {
        resource: ResourceKey,
        connection_id: ConnectionId,
        subscribers: usize,
    },

    #[serde(rename = "presence.joined")]
    PresenceJoined {
        resource: ResourceKey,
        actor_id: ActorId,
        actor_name: String,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },

    #[serde(rename = "presence.left")]
    PresenceLeft {
        resource: ResourceKey,
        actor_id: ActorId,
        reason: LeaveReason,
    },

    /// Full roster after any membership change, or as a direct reply
    #[serde(rename = "presence.roster")]
    PresenceRoster {
        resource: ResourceKey,
        entries: Vec<RosterEntry>,
    },

    /// Sent only to a joining connection when others are already present
    #[serde(rename = "presence.collision")]
    PresenceCollision {
        resource: ResourceKey,
        occupants: Vec<RosterEntry>,
    },

    #[serde(rename = "cursor.updated")]
    CursorUpdated {
        resource: ResourceKey,
        actor_id: ActorId,
        position: serde_json::Value,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },

    #[serde(rename = "cursor.removed")]
    CursorRemoved {
        resource: ResourceKey,
        actor_id: ActorId,
    },

    #[serde(rename = "typing.started")]
    TypingStarted {
        resource: ResourceKey,
        actor_id: ActorId,
        actor_name: String,
        collision_risk: bool,
    },

    #[serde(rename = "typing.stopped")]
    TypingStopped {
        resource: ResourceKey,
        actor_id: ActorId,
    },

    #[serde(rename = "lock.acquired")]
    LockAcquired {
        resource: ResourceKey,
        holder: ActorId,
        holder_name: String,
        #[serde(with = "time::serde::rfc3339")]
        expires_at: OffsetDateTime,
        renewed: bool,
    },

    /// Direct reply to a contended acquire
    #[serde(rename = "lock.denied")]
    LockDenied {
        resource: ResourceKey,
        holder: ActorId,
        #[serde(with = "time::serde::rfc3339")]
        expires_at: OffsetDateTime,
    },

    #[serde(rename = "lock.released")]
    LockReleased {
        resource: ResourceKey,
        holder: ActorId,
    },

    #[serde(rename = "lock.expired")]
    LockExpired {
        resource: ResourceKey,
        holder: ActorId,
    },

    /// Direct reply to a status query
    #[serde(rename = "lock.status")]
    LockStatus(LockInfo),

    #[serde(rename = "activity.new")]
    ActivityNew(ActivityEvent),

    #[serde(rename = "activity.updated")]
    ActivityUpdated(ActivityEvent),

    #[serde(rename = "activity.deleted")]
    ActivityDeleted(ActivityEvent),

    #[serde(rename = "activity.bulk")]
    ActivityBulk(ActivityEvent),

    #[serde(rename = "activity.refresh")]
    ActivityRefresh(ActivityEvent),
}

impl ServerEvent {
    /// Wrap an activity in the variant matching its kind
    pub fn activity(event: ActivityEvent) -> Self {
        match event.kind {
            ActivityKind::New => Self::ActivityNew(event),
            ActivityKind::Updated => Self::ActivityUpdated(event),
            ActivityKind::Deleted => Self::ActivityDeleted(event),
            ActivityKind::Bulk => Self::ActivityBulk(event),
            ActivityKind::Refresh => Self::ActivityRefresh(event),
        }
    }

    /// Dotted event name, as found in the `event` field on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
            Self::Subscribed { .. } => "topic.subscribed",
            Self::Unsubscribed { .. } => "topic.unsubscribed",
            Self::PresenceJoined { .. } => "presence.joined",
            Self::PresenceLeft { .. } => "presence.left",
            Self::PresenceRoster { .. } => "presence.roster",
            Self::PresenceCollision { .. } => "presence.collision",
            Self::CursorUpdated { .. } => "cursor.updated",
            Self::CursorRemoved { .. } => "cursor.removed",
            Self::TypingStarted { .. } => "typing.started",
            Self::TypingStopped { .. } => "typing.stopped",
            Self::LockAcquired { .. } => "lock.acquired",
            Self::LockDenied { .. } => "lock.denied",
            Self::LockReleased { .. } => "lock.released",
            Self::LockExpired { .. } => "lock.expired",
            Self::LockStatus(_) => "lock.status",
            Self::ActivityNew(_) => "activity.new",
            Self::ActivityUpdated(_) => "activity.updated",
            Self::ActivityDeleted(_) => "activity.deleted",
            Self::ActivityBulk(_) => "activity.bulk",
            Self::ActivityRefresh(_) => "activity.refresh",
        }
    }
}
