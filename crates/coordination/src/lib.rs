//! Huddle Coordination Core
//!
//! Ephemeral, in-memory coordination state for real-time collaboration:
//! who is present on a resource, where their cursors are, who holds its
//! lease, and which connections receive its events.
//!
//! Every resource key is served by its own actor task, so all operations on
//! one key are applied in order. [`Coordinator`] is the public handle; the
//! transport feeds it [`ClientCommand`]s and forwards the [`ServerEvent`]s
//! it emits on each connection's outbound channel.

pub mod broadcaster;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod events;
pub mod lease;
pub mod presence;
pub mod registry;
pub mod resource;
pub mod sweeper;

pub use broadcaster::Outbound;
pub use command::ClientCommand;
pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, CoordinatorStats};
pub use events::{
    ActivityEvent, ActivityKind, LeaveReason, LockInfo, PresenceStatus, RosterEntry, ServerEvent,
};
pub use lease::AcquireOutcome;
pub use presence::JoinOutcome;
pub use resource::ResourceStats;
pub use sweeper::SweepReport;
