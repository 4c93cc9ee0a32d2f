//! Inbound operation requests
//!
//! The transport decodes each client frame into a [`ClientCommand`] and hands
//! it to [`crate::Coordinator::dispatch`] together with the originating
//! connection.

use huddle_shared::ResourceKey;
use serde::Deserialize;

use crate::events::PresenceStatus;

/// Operations a connected client may request
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Start receiving a resource's events
    Subscribe { resource: ResourceKey },

    /// Stop receiving a resource's events
    Unsubscribe { resource: ResourceKey },

    /// Become present on a resource (implies subscribe)
    Join { resource: ResourceKey },

    /// Stop being present on a resource
    Leave { resource: ResourceKey },

    /// Switch between viewing and typing
    SetStatus {
        resource: ResourceKey,
        status: PresenceStatus,
    },

    /// Move this actor's cursor; the position is opaque to the core
    Cursor {
        resource: ResourceKey,
        position: serde_json::Value,
    },

    /// Drop this actor's cursor
    RemoveCursor { resource: ResourceKey },

    /// Acquire or renew the resource lease
    AcquireLock {
        resource: ResourceKey,
        #[serde(default)]
        ttl_seconds: Option<u64>,
    },

    ReleaseLock { resource: ResourceKey },

    LockStatus { resource: ResourceKey },

    Roster { resource: ResourceKey },

    /// Heartbeat ping
    Ping,
}
