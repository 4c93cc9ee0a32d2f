//! Coordination facade
//!
//! [`Coordinator`] is the only entry point into the core. It is a cheap,
//! cloneable handle over explicitly owned state: the connection registry,
//! the table of resource actors and the sweeper task. Create one with
//! [`Coordinator::new`] and stop it with [`Coordinator::shutdown`].
//!
//! Commands for a resource are queued while the registry lock is held, so
//! everything a connection asked for is applied before its disconnect
//! cleanup reaches the same resource.

use std::sync::Arc;

use huddle_shared::{Actor, ConnectionId, HuddleError, HuddleResult, ResourceKey};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broadcaster::Outbound;
use crate::command::ClientCommand;
use crate::config::CoordinatorConfig;
use crate::events::{ActivityEvent, ActivityKind, LockInfo, PresenceStatus, RosterEntry, ServerEvent};
use crate::lease::AcquireOutcome;
use crate::presence::JoinOutcome;
use crate::registry::ConnectionRegistry;
use crate::resource::{Reply, ResourceCommand, ResourceStats, ResourceTable};
use crate::sweeper::{self, SweepReport};

/// Snapshot for operational tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub connections: usize,
    pub resources: Vec<ResourceStats>,
}

/// The connection a command came from
struct Caller {
    connection_id: ConnectionId,
    actor: Actor,
    outbound: Outbound,
}

/// How a connection command interacts with the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// Only reaches an existing actor
    Existing,
    /// May create state for the connection on the resource
    Touch,
    /// May create a lease for the caller's actor
    Lease,
    /// Drops the caller's lease on the resource
    Unlease,
}

impl Scope {
    fn spawns_actor(self) -> bool {
        matches!(self, Scope::Touch | Scope::Lease)
    }
}

#[derive(Clone)]
pub struct Coordinator {
    config: Arc<CoordinatorConfig>,
    registry: Arc<RwLock<ConnectionRegistry>>,
    resources: ResourceTable,
    shutdown: CancellationToken,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Coordinator {
    /// Create an idle coordinator. The sweeper is started separately with
    /// [`Coordinator::spawn_sweeper`].
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            resources: ResourceTable::new(config.presence_staleness),
            config: Arc::new(config),
            registry: Arc::new(RwLock::new(ConnectionRegistry::new())),
            shutdown: CancellationToken::new(),
            sweeper: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ==================== Connections ====================

    pub async fn register(&self, actor: Actor, outbound: Outbound) -> HuddleResult<ConnectionId> {
        if self.is_shut_down() {
            return Err(HuddleError::ShuttingDown);
        }

        let mut registry = self.registry.write().await;
        let actor_id = actor.id.clone();
        let connection_id = registry.register(actor, outbound);

        tracing::info!(
            connection_id = %connection_id,
            actor_id = %actor_id,
            actor_connections = registry.actor_connection_count(&actor_id),
            total_connections = registry.connection_count(),
            "Connection registered"
        );

        Ok(connection_id)
    }

    /// Remove a connection and everything it owns. Returns false if it was
    /// already gone.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> HuddleResult<bool> {
        let (plan, receivers) = {
            let mut registry = self.registry.write().await;
            let Some(plan) = registry.remove(&connection_id) else {
                tracing::debug!(connection_id = %connection_id, "Ignoring disconnect of unknown connection");
                return Ok(false);
            };

            let mut receivers = Vec::with_capacity(plan.keys.len());
            for key in &plan.keys {
                let release_lease_of = plan.release_lease_of.clone();
                let receiver = self
                    .resources
                    .enqueue_existing(key, |reply| ResourceCommand::Disconnect {
                        connection_id,
                        release_lease_of,
                        reply,
                    })
                    .await?;
                receivers.extend(receiver);
            }
            (plan, receivers)
        };

        for receiver in receivers {
            let _ = receiver.await;
        }

        tracing::info!(
            connection_id = %connection_id,
            actor_id = %plan.actor_id,
            resources = plan.keys.len(),
            released_leases = plan.release_lease_of.is_some(),
            "Connection removed"
        );

        Ok(true)
    }

    // ==================== Topics ====================

    /// Returns the subscriber count, or `None` for an unknown connection
    pub async fn subscribe(
        &self,
        connection_id: ConnectionId,
        key: &ResourceKey,
    ) -> HuddleResult<Option<usize>> {
        self.send(connection_id, key, Scope::Touch, |caller, reply| {
            ResourceCommand::Subscribe {
                connection_id: caller.connection_id,
                outbound: caller.outbound,
                reply,
            }
        })
        .await
    }

    pub async fn unsubscribe(&self, connection_id: ConnectionId, key: &ResourceKey) -> HuddleResult<bool> {
        let removed = self
            .send(connection_id, key, Scope::Existing, |caller, reply| {
                ResourceCommand::Unsubscribe {
                    connection_id: caller.connection_id,
                    reply,
                }
            })
            .await?;
        self.prune(connection_id, key).await;
        Ok(removed.unwrap_or(false))
    }

    /// Publish a domain mutation to the resource's subscribers. A key
    /// nobody is subscribed to has no actor, so this is then a no-op.
    pub async fn publish_activity(
        &self,
        key: &ResourceKey,
        item_id: impl Into<String>,
        kind: ActivityKind,
        payload: serde_json::Value,
    ) -> HuddleResult<usize> {
        let event = ServerEvent::activity(ActivityEvent {
            resource: key.clone(),
            item_id: item_id.into(),
            kind,
            payload,
            timestamp: OffsetDateTime::now_utc(),
        });

        let delivered = self
            .resources
            .request_existing(key, |reply| ResourceCommand::Publish { event, reply })
            .await?
            .unwrap_or(0);

        tracing::debug!(resource = %key, kind = ?kind, delivered, "Activity published");
        Ok(delivered)
    }

    // ==================== Presence ====================

    /// Become present on a resource, subscribing to it as well. Returns
    /// `None` for an unknown connection.
    pub async fn join(
        &self,
        connection_id: ConnectionId,
        key: &ResourceKey,
    ) -> HuddleResult<Option<JoinOutcome>> {
        self.send(connection_id, key, Scope::Touch, |caller, reply| ResourceCommand::Join {
            actor: caller.actor,
            connection_id: caller.connection_id,
            outbound: caller.outbound,
            reply,
        })
        .await
    }

    pub async fn leave(&self, connection_id: ConnectionId, key: &ResourceKey) -> HuddleResult<bool> {
        let left = self
            .send(connection_id, key, Scope::Existing, |caller, reply| ResourceCommand::Leave {
                actor_id: caller.actor.id,
                reply,
            })
            .await?;
        self.prune(connection_id, key).await;
        Ok(left.unwrap_or(false))
    }

    /// Returns false when the actor is not present on the resource
    pub async fn set_status(
        &self,
        connection_id: ConnectionId,
        key: &ResourceKey,
        status: PresenceStatus,
    ) -> HuddleResult<bool> {
        let applied = self
            .send(connection_id, key, Scope::Existing, |caller, reply| {
                ResourceCommand::SetStatus {
                    actor_id: caller.actor.id,
                    status,
                    reply,
                }
            })
            .await?;
        Ok(applied.unwrap_or(false))
    }

    pub async fn roster(&self, key: &ResourceKey) -> HuddleResult<Vec<RosterEntry>> {
        let roster = self
            .resources
            .request_existing(key, |reply| ResourceCommand::Roster { reply })
            .await?;
        Ok(roster.unwrap_or_default())
    }

    // ==================== Cursors ====================

    pub async fn update_cursor(
        &self,
        connection_id: ConnectionId,
        key: &ResourceKey,
        position: serde_json::Value,
    ) -> HuddleResult<bool> {
        let applied = self
            .send(connection_id, key, Scope::Touch, |caller, reply| {
                ResourceCommand::UpdateCursor {
                    actor_id: caller.actor.id,
                    connection_id: caller.connection_id,
                    position,
                    reply,
                }
            })
            .await?;
        Ok(applied.is_some())
    }

    pub async fn remove_cursor(&self, connection_id: ConnectionId, key: &ResourceKey) -> HuddleResult<bool> {
        let removed = self
            .send(connection_id, key, Scope::Existing, |caller, reply| {
                ResourceCommand::RemoveCursor {
                    actor_id: caller.actor.id,
                    reply,
                }
            })
            .await?;
        self.prune(connection_id, key).await;
        Ok(removed.unwrap_or(false))
    }

    // ==================== Leases ====================

    /// Acquire or renew the lease on `key` for the connection's actor.
    /// `ttl_secs` of `None` uses the default TTL; zero is rejected.
    pub async fn acquire(
        &self,
        connection_id: ConnectionId,
        key: &ResourceKey,
        ttl_secs: Option<u64>,
    ) -> HuddleResult<Option<AcquireOutcome>> {
        let ttl = self.config.lock_ttl(ttl_secs)?;
        self.send(connection_id, key, Scope::Lease, |caller, reply| ResourceCommand::Acquire {
            actor: caller.actor,
            ttl,
            reply,
        })
        .await
    }

    /// Release the lease if the connection's actor holds it
    pub async fn release(&self, connection_id: ConnectionId, key: &ResourceKey) -> HuddleResult<bool> {
        let released = self
            .send(connection_id, key, Scope::Unlease, |caller, reply| ResourceCommand::Release {
                actor_id: caller.actor.id,
                reply,
            })
            .await?;
        Ok(released.unwrap_or(false))
    }

    pub async fn lock_status(&self, key: &ResourceKey) -> HuddleResult<LockInfo> {
        let info = self
            .resources
            .request_existing(key, |reply| ResourceCommand::LockStatus { reply })
            .await?;
        Ok(info.unwrap_or_else(|| LockInfo::unlocked(key.clone())))
    }

    // ==================== Transport entry point ====================

    /// Apply a decoded client frame. Direct replies (lock answers, roster,
    /// pong, rejected TTLs) go to the connection's own outbound channel.
    pub async fn dispatch(&self, connection_id: ConnectionId, command: ClientCommand) -> HuddleResult<()> {
        let reply = match command {
            ClientCommand::Subscribe { resource } => {
                self.subscribe(connection_id, &resource).await?;
                None
            }
            ClientCommand::Unsubscribe { resource } => {
                self.unsubscribe(connection_id, &resource).await?;
                None
            }
            ClientCommand::Join { resource } => {
                self.join(connection_id, &resource).await?;
                None
            }
            ClientCommand::Leave { resource } => {
                self.leave(connection_id, &resource).await?;
                None
            }
            ClientCommand::SetStatus { resource, status } => {
                self.set_status(connection_id, &resource, status).await?;
                None
            }
            ClientCommand::Cursor { resource, position } => {
                self.update_cursor(connection_id, &resource, position).await?;
                None
            }
            ClientCommand::RemoveCursor { resource } => {
                self.remove_cursor(connection_id, &resource).await?;
                None
            }
            ClientCommand::AcquireLock {
                resource,
                ttl_seconds,
            } => match self.acquire(connection_id, &resource, ttl_seconds).await {
                Ok(Some(AcquireOutcome::Granted { lease, .. })) => Some(ServerEvent::LockStatus(lease)),
                Ok(Some(AcquireOutcome::Denied { holder, expires_at })) => Some(ServerEvent::LockDenied {
                    resource,
                    holder,
                    expires_at,
                }),
                Ok(None) => None,
                Err(HuddleError::InvalidTtl(message)) => Some(ServerEvent::Error { message }),
                Err(e) => return Err(e),
            },
            ClientCommand::ReleaseLock { resource } => {
                self.release(connection_id, &resource).await?;
                None
            }
            ClientCommand::LockStatus { resource } => {
                Some(ServerEvent::LockStatus(self.lock_status(&resource).await?))
            }
            ClientCommand::Roster { resource } => Some(ServerEvent::PresenceRoster {
                entries: self.roster(&resource).await?,
                resource,
            }),
            ClientCommand::Ping => Some(ServerEvent::Pong),
        };

        if let Some(event) = reply {
            self.reply(connection_id, event).await;
        }
        Ok(())
    }

    // ==================== Introspection ====================

    pub async fn stats(&self) -> CoordinatorStats {
        let connections = self.registry.read().await.connection_count();
        let resources = self
            .resources
            .broadcast(|reply| ResourceCommand::Stats { reply })
            .await
            .into_iter()
            .map(|(_, stats)| stats)
            .collect();

        CoordinatorStats {
            connections,
            resources,
        }
    }

    // ==================== Lifecycle ====================

    /// Run one sweep pass now
    pub async fn sweep_now(&self) -> SweepReport {
        sweeper::sweep_once(&self.resources).await
    }

    /// Start the periodic sweeper. Calling it again is a no-op.
    pub async fn spawn_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_some() || self.is_shut_down() {
            return;
        }
        *sweeper = Some(sweeper::spawn(
            self.resources.clone(),
            self.config.sweep_interval,
            self.shutdown.child_token(),
        ));
    }

    /// Stop the sweeper and every resource actor. Further calls fail with
    /// [`HuddleError::ShuttingDown`].
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        if let Some(handle) = self.sweeper.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Sweeper task ended abnormally");
            }
        }

        self.resources.close().await;

        let mut registry = self.registry.write().await;
        let remaining = registry.connection_ids();
        for connection_id in &remaining {
            registry.remove(connection_id);
        }

        tracing::info!(dropped_connections = remaining.len(), "Coordinator shut down");
    }

    // ==================== Internals ====================

    /// Queue a command on behalf of a connection and wait for its answer.
    /// `None` means the connection is unknown or, for [`Scope::Existing`]
    /// and [`Scope::Unlease`], the resource has no state.
    async fn send<T>(
        &self,
        connection_id: ConnectionId,
        key: &ResourceKey,
        scope: Scope,
        build: impl FnOnce(Caller, Reply<T>) -> ResourceCommand,
    ) -> HuddleResult<Option<T>> {
        let receiver = {
            let mut registry = self.registry.write().await;
            let Some(record) = registry.get(&connection_id) else {
                tracing::debug!(
                    connection_id = %connection_id,
                    resource = %key,
                    "Ignoring command from unknown connection"
                );
                return Ok(None);
            };
            let caller = Caller {
                connection_id,
                actor: record.actor.clone(),
                outbound: record.outbound.clone(),
            };

            match scope {
                Scope::Existing => {}
                Scope::Touch => {
                    registry.touch(&connection_id, key);
                }
                Scope::Lease => {
                    registry.touch(&connection_id, key);
                    registry.record_lease(&caller.actor.id, key);
                }
                Scope::Unlease => registry.forget_lease(&caller.actor.id, key),
            }

            let command = |reply| build(caller, reply);
            if scope.spawns_actor() {
                Some(self.resources.enqueue(key, command).await?)
            } else {
                self.resources.enqueue_existing(key, command).await?
            }
        };

        match receiver {
            Some(receiver) => receiver
                .await
                .map(Some)
                .map_err(|_| HuddleError::ShuttingDown),
            None => Ok(None),
        }
    }

    /// Forget `key` for the connection once it holds nothing there. A touch
    /// racing with the check bumps the generation and keeps the key.
    async fn prune(&self, connection_id: ConnectionId, key: &ResourceKey) {
        let Some(generation) = self.registry.read().await.touch_generation(&connection_id, key) else {
            return;
        };

        let holds = self
            .resources
            .request_existing(key, |reply| ResourceCommand::Holds {
                connection_id,
                reply,
            })
            .await;
        match holds {
            Ok(Some(true)) => {}
            Ok(Some(false) | None) => {
                if self.registry.write().await.untouch(&connection_id, key, generation) {
                    tracing::debug!(connection_id = %connection_id, resource = %key, "Resource forgotten for connection");
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, connection_id = %connection_id, resource = %key, "Skipping prune");
            }
        }
    }

    async fn reply(&self, connection_id: ConnectionId, event: ServerEvent) {
        let registry = self.registry.read().await;
        let Some(record) = registry.get(&connection_id) else {
            tracing::debug!(connection_id = %connection_id, "Dropping reply to unknown connection");
            return;
        };
        if record.outbound.send(event).is_err() {
            tracing::debug!(connection_id = %connection_id, "Dropping reply to closed connection");
        }
    }
}
