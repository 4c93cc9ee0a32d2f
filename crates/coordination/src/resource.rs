//! Per-resource actors
//!
//! Every resource key with live state is owned by one tokio task. The task
//! holds the key's topic, presence, cursors and lease, and applies
//! [`ResourceCommand`]s one at a time, which serialises all mutations of a
//! key without a lock around the state itself.
//!
//! The [`ResourceTable`] maps keys to actor mailboxes. Commands are sent
//! while holding its read lock; actors are reaped only under its write
//! lock, after confirming they are idle. A command can therefore never be
//! sent to an actor that is about to disappear.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use huddle_shared::{Actor, ActorId, ConnectionId, HuddleError, HuddleResult, ResourceKey};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::broadcaster::{Outbound, Topic};
use crate::cursor::CursorTracker;
use crate::events::{LeaveReason, LockInfo, PresenceStatus, RosterEntry, ServerEvent};
use crate::lease::{AcquireOutcome, LeaseSlot};
use crate::presence::{JoinOutcome, PresenceTracker};

pub(crate) type Reply<T> = oneshot::Sender<T>;

/// Requests handled by a resource actor
#[derive(Debug)]
pub(crate) enum ResourceCommand {
    Subscribe {
        connection_id: ConnectionId,
        outbound: Outbound,
        reply: Reply<usize>,
    },
    Unsubscribe {
        connection_id: ConnectionId,
        reply: Reply<bool>,
    },
    Join {
        actor: Actor,
        connection_id: ConnectionId,
        outbound: Outbound,
        reply: Reply<JoinOutcome>,
    },
    Leave {
        actor_id: ActorId,
        reply: Reply<bool>,
    },
    SetStatus {
        actor_id: ActorId,
        status: PresenceStatus,
        reply: Reply<bool>,
    },
    UpdateCursor {
        actor_id: ActorId,
        connection_id: ConnectionId,
        position: serde_json::Value,
        reply: Reply<()>,
    },
    RemoveCursor {
        actor_id: ActorId,
        reply: Reply<bool>,
    },
    Acquire {
        actor: Actor,
        ttl: Duration,
        reply: Reply<AcquireOutcome>,
    },
    Release {
        actor_id: ActorId,
        reply: Reply<bool>,
    },
    LockStatus {
        reply: Reply<LockInfo>,
    },
    Roster {
        reply: Reply<Vec<RosterEntry>>,
    },
    Publish {
        event: ServerEvent,
        reply: Reply<usize>,
    },
    Stats {
        reply: Reply<ResourceStats>,
    },
    /// Connection cleanup. `release_lease_of` is set when the closing
    /// connection was its actor's last one.
    Disconnect {
        connection_id: ConnectionId,
        release_lease_of: Option<ActorId>,
        reply: Reply<()>,
    },
    /// Whether the connection still has a subscription, presence or a
    /// cursor here
    Holds {
        connection_id: ConnectionId,
        reply: Reply<bool>,
    },
    Sweep {
        reply: Reply<SweepOutcome>,
    },
    /// Stop if idle. Replies whether the actor stopped.
    Reap {
        reply: Reply<bool>,
    },
}

/// Per-resource numbers for the introspection API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceStats {
    pub resource: ResourceKey,
    pub subscribers: usize,
    pub presence: usize,
    pub typing: usize,
    pub cursors: usize,
    pub lock: LockInfo,
}

/// What one sweep pass removed from a resource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub stale_presence: usize,
    pub stale_cursors: usize,
    pub expired_lease: bool,
    pub idle: bool,
}

/// State owned by a single resource actor
#[derive(Debug)]
struct ResourceState {
    topic: Topic,
    presence: PresenceTracker,
    cursors: CursorTracker,
    lease: LeaseSlot,
    staleness: Duration,
}

impl ResourceState {
    fn new(key: ResourceKey, staleness: Duration) -> Self {
        Self {
            topic: Topic::new(key),
            presence: PresenceTracker::new(),
            cursors: CursorTracker::new(),
            lease: LeaseSlot::new(),
            staleness,
        }
    }

    fn is_idle(&self) -> bool {
        self.topic.is_empty()
            && self.presence.is_empty()
            && self.cursors.is_empty()
            && !self.lease.is_locked()
    }

    fn handle(&mut self, command: ResourceCommand) -> ControlFlow<()> {
        let now = Instant::now();

        match command {
            ResourceCommand::Subscribe {
                connection_id,
                outbound,
                reply,
            } => {
                self.subscribe(connection_id, outbound);
                let _ = reply.send(self.topic.subscriber_count());
            }
            ResourceCommand::Unsubscribe {
                connection_id,
                reply,
            } => {
                let _ = reply.send(self.unsubscribe(connection_id));
            }
            ResourceCommand::Join {
                actor,
                connection_id,
                outbound,
                reply,
            } => {
                self.presence.evict_stale(&self.topic, now, self.staleness);
                self.subscribe(connection_id, outbound.clone());
                let outcome = self.presence.join(&self.topic, &actor, connection_id, now);
                if outcome.has_collision() {
                    let _ = outbound.send(ServerEvent::PresenceCollision {
                        resource: self.topic.key().clone(),
                        occupants: outcome.others.clone(),
                    });
                }
                let _ = reply.send(outcome);
            }
            ResourceCommand::Leave { actor_id, reply } => {
                let left = self
                    .presence
                    .leave(&self.topic, &actor_id, LeaveReason::Explicit)
                    .is_some();
                if left {
                    self.cursors.remove(&self.topic, &actor_id);
                }
                let _ = reply.send(left);
            }
            ResourceCommand::SetStatus {
                actor_id,
                status,
                reply,
            } => {
                let changed = self.presence.set_status(&self.topic, &actor_id, status, now);
                let _ = reply.send(changed);
            }
            ResourceCommand::UpdateCursor {
                actor_id,
                connection_id,
                position,
                reply,
            } => {
                self.presence.touch(&actor_id, now);
                self.cursors
                    .update(&self.topic, &actor_id, connection_id, position, now);
                let _ = reply.send(());
            }
            ResourceCommand::RemoveCursor { actor_id, reply } => {
                let _ = reply.send(self.cursors.remove(&self.topic, &actor_id));
            }
            ResourceCommand::Acquire { actor, ttl, reply } => {
                let outcome = self.lease.acquire(&self.topic, &actor, ttl, now);
                let _ = reply.send(outcome);
            }
            ResourceCommand::Release { actor_id, reply } => {
                let _ = reply.send(self.lease.release(&self.topic, &actor_id));
            }
            ResourceCommand::LockStatus { reply } => {
                let _ = reply.send(self.lease.status(&self.topic, now));
            }
            ResourceCommand::Roster { reply } => {
                self.presence.evict_stale(&self.topic, now, self.staleness);
                let _ = reply.send(self.presence.roster());
            }
            ResourceCommand::Publish { event, reply } => {
                let _ = reply.send(self.topic.publish(event));
            }
            ResourceCommand::Stats { reply } => {
                let _ = reply.send(self.stats(now));
            }
            ResourceCommand::Disconnect {
                connection_id,
                release_lease_of,
                reply,
            } => {
                self.disconnect(connection_id, release_lease_of.as_ref(), now);
                let _ = reply.send(());
            }
            ResourceCommand::Holds {
                connection_id,
                reply,
            } => {
                let holds = self.topic.is_subscribed(&connection_id)
                    || self.presence.holds_connection(connection_id)
                    || self.cursors.holds_connection(connection_id);
                let _ = reply.send(holds);
            }
            ResourceCommand::Sweep { reply } => {
                let _ = reply.send(self.sweep(now));
            }
            ResourceCommand::Reap { reply } => {
                let idle = self.is_idle();
                let _ = reply.send(idle);
                if idle {
                    return ControlFlow::Break(());
                }
            }
        }

        ControlFlow::Continue(())
    }

    fn subscribe(&mut self, connection_id: ConnectionId, outbound: Outbound) {
        if self.topic.subscribe(connection_id, outbound) {
            self.topic.publish(ServerEvent::Subscribed {
                resource: self.topic.key().clone(),
                subscribers: self.topic.subscriber_count(),
            });
        }
    }

    fn unsubscribe(&mut self, connection_id: ConnectionId) -> bool {
        if !self.topic.unsubscribe(&connection_id) {
            return false;
        }
        self.topic.publish(ServerEvent::Unsubscribed {
            resource: self.topic.key().clone(),
            connection_id,
            subscribers: self.topic.subscriber_count(),
        });
        true
    }

    fn disconnect(&mut self, connection_id: ConnectionId, release_lease_of: Option<&ActorId>, now: Instant) {
        // The closing connection stops receiving before the cleanup it triggers
        self.unsubscribe(connection_id);

        for actor_id in self.presence.remove_connection(&self.topic, connection_id) {
            self.cursors.remove(&self.topic, &actor_id);
        }
        self.cursors.remove_connection(&self.topic, connection_id);

        if let Some(actor_id) = release_lease_of {
            self.lease.expire(&self.topic, now);
            if self.lease.holder() == Some(actor_id) {
                self.lease.release(&self.topic, actor_id);
            }
        }
    }

    fn sweep(&mut self, now: Instant) -> SweepOutcome {
        let stale = self.presence.evict_stale(&self.topic, now, self.staleness);
        for actor_id in &stale {
            self.cursors.remove(&self.topic, actor_id);
        }
        let expired_lease = self.lease.expire(&self.topic, now).is_some();
        let presence = &self.presence;
        let stale_cursors = self.cursors.evict_stale(&self.topic, now, self.staleness, |actor_id| {
            presence.contains(actor_id)
        });

        SweepOutcome {
            stale_presence: stale.len(),
            stale_cursors,
            expired_lease,
            idle: self.is_idle(),
        }
    }

    fn stats(&self, now: Instant) -> ResourceStats {
        ResourceStats {
            resource: self.topic.key().clone(),
            subscribers: self.topic.subscriber_count(),
            presence: self.presence.len(),
            typing: self.presence.typing_count(),
            cursors: self.cursors.len(),
            lock: self.lease.snapshot(&self.topic, now),
        }
    }
}

async fn run(mut state: ResourceState, mut commands: mpsc::UnboundedReceiver<ResourceCommand>) {
    tracing::debug!(resource = %state.topic.key(), "Resource actor started");

    while let Some(command) = commands.recv().await {
        if state.handle(command).is_break() {
            break;
        }
    }

    tracing::debug!(resource = %state.topic.key(), "Resource actor stopped");
}

#[derive(Debug)]
struct ResourceHandle {
    sender: mpsc::UnboundedSender<ResourceCommand>,
    task: JoinHandle<()>,
}

impl ResourceHandle {
    fn spawn(key: ResourceKey, staleness: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(ResourceState::new(key, staleness), receiver));
        Self { sender, task }
    }
}

#[derive(Debug, Default)]
struct Actors {
    handles: HashMap<ResourceKey, ResourceHandle>,
    closed: bool,
}

/// Mailboxes of all live resource actors
#[derive(Debug, Clone)]
pub(crate) struct ResourceTable {
    actors: Arc<RwLock<Actors>>,
    staleness: Duration,
}

impl ResourceTable {
    pub(crate) fn new(staleness: Duration) -> Self {
        Self {
            actors: Arc::new(RwLock::new(Actors::default())),
            staleness,
        }
    }

    /// Queue a command for `key`, spawning its actor if needed. Returns the
    /// reply receiver without waiting on it.
    pub(crate) async fn enqueue<T>(
        &self,
        key: &ResourceKey,
        build: impl FnOnce(Reply<T>) -> ResourceCommand,
    ) -> HuddleResult<oneshot::Receiver<T>> {
        let (reply, receiver) = oneshot::channel();
        let mut command = build(reply);

        {
            let actors = self.actors.read().await;
            if actors.closed {
                return Err(HuddleError::ShuttingDown);
            }
            if let Some(handle) = actors.handles.get(key) {
                match handle.sender.send(command) {
                    Ok(()) => return Ok(receiver),
                    Err(mpsc::error::SendError(returned)) => command = returned,
                }
            }
        }

        let mut actors = self.actors.write().await;
        if actors.closed {
            return Err(HuddleError::ShuttingDown);
        }
        let staleness = self.staleness;
        let handle = actors
            .handles
            .entry(key.clone())
            .and_modify(|handle| {
                if handle.sender.is_closed() {
                    tracing::warn!(resource = %key, "Replacing stopped resource actor");
                    *handle = ResourceHandle::spawn(key.clone(), staleness);
                }
            })
            .or_insert_with(|| ResourceHandle::spawn(key.clone(), staleness));

        handle
            .sender
            .send(command)
            .map_err(|_| HuddleError::ShuttingDown)?;
        Ok(receiver)
    }

    /// Queue a command only if `key` already has an actor
    pub(crate) async fn enqueue_existing<T>(
        &self,
        key: &ResourceKey,
        build: impl FnOnce(Reply<T>) -> ResourceCommand,
    ) -> HuddleResult<Option<oneshot::Receiver<T>>> {
        {
            let actors = self.actors.read().await;
            if actors.closed {
                return Err(HuddleError::ShuttingDown);
            }
            let Some(handle) = actors.handles.get(key) else {
                return Ok(None);
            };

            let (reply, receiver) = oneshot::channel();
            if handle.sender.send(build(reply)).is_ok() {
                return Ok(Some(receiver));
            }
        }

        // A stopped actor holds no state, so drop its handle and answer as
        // if the key had none
        let mut actors = self.actors.write().await;
        if actors.handles.get(key).is_some_and(|handle| handle.sender.is_closed()) {
            tracing::warn!(resource = %key, "Removing stopped resource actor");
            actors.handles.remove(key);
        }
        Ok(None)
    }

    pub(crate) async fn request<T>(
        &self,
        key: &ResourceKey,
        build: impl FnOnce(Reply<T>) -> ResourceCommand,
    ) -> HuddleResult<T> {
        await_reply(self.enqueue(key, build).await?).await
    }

    pub(crate) async fn request_existing<T>(
        &self,
        key: &ResourceKey,
        build: impl FnOnce(Reply<T>) -> ResourceCommand,
    ) -> HuddleResult<Option<T>> {
        match self.enqueue_existing(key, build).await? {
            Some(receiver) => Ok(Some(await_reply(receiver).await?)),
            None => Ok(None),
        }
    }

    /// Send the same command to every live actor and collect the replies
    pub(crate) async fn broadcast<T>(
        &self,
        build: impl Fn(Reply<T>) -> ResourceCommand,
    ) -> Vec<(ResourceKey, T)> {
        let receivers: Vec<(ResourceKey, oneshot::Receiver<T>)> = {
            let actors = self.actors.read().await;
            actors
                .handles
                .iter()
                .filter_map(|(key, handle)| {
                    let (reply, receiver) = oneshot::channel();
                    handle
                        .sender
                        .send(build(reply))
                        .ok()
                        .map(|()| (key.clone(), receiver))
                })
                .collect()
        };

        let mut replies = Vec::with_capacity(receivers.len());
        for (key, receiver) in receivers {
            if let Ok(value) = receiver.await {
                replies.push((key, value));
            }
        }
        replies.sort_by(|(a, _), (b, _)| a.cmp(b));
        replies
    }

    /// Stop the actors of `candidates` that are still idle. Returns how many
    /// were reaped.
    pub(crate) async fn reap(&self, candidates: &[ResourceKey]) -> usize {
        if candidates.is_empty() {
            return 0;
        }

        let mut actors = self.actors.write().await;
        let mut reaped = 0;

        for key in candidates {
            let Some(handle) = actors.handles.get(key) else {
                continue;
            };
            let (reply, receiver) = oneshot::channel();
            if handle.sender.send(ResourceCommand::Reap { reply }).is_err() {
                actors.handles.remove(key);
                continue;
            }
            // Anything queued before the reap is applied first, so an idle
            // answer is final while the write lock is held.
            if receiver.await.unwrap_or(true) {
                actors.handles.remove(key);
                reaped += 1;
            }
        }

        if reaped > 0 {
            tracing::debug!(reaped, remaining = actors.handles.len(), "Reaped idle resource actors");
        }
        reaped
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.actors.read().await.handles.len()
    }

    /// Refuse new commands and stop every actor after it drains its mailbox
    pub(crate) async fn close(&self) {
        let handles: Vec<ResourceHandle> = {
            let mut actors = self.actors.write().await;
            actors.closed = true;
            actors.handles.drain().map(|(_, handle)| handle).collect()
        };

        let count = handles.len();
        for ResourceHandle { sender, task } in handles {
            drop(sender);
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Resource actor ended abnormally");
            }
        }
        tracing::debug!(actors = count, "Resource actors stopped");
    }
}

async fn await_reply<T>(receiver: oneshot::Receiver<T>) -> HuddleResult<T> {
    receiver.await.map_err(|_| HuddleError::ShuttingDown)
}
