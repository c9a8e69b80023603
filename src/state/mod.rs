//! Room synchronization state.
//!
//! This module provides the core state types and the [`Hub`] that ties
//! them together:
//!
//! - `world` - Entity world with live component indices
//! - `machine` - Mailbox-driven state machine engine
//! - `connection` - Per-client connection machine (auth, device, liveness)
//! - `club` - Parent rooms that game rooms are created from
//! - `room` - Per-game room machine and snapshot broadcast
//! - `registry` - Live actors by id and type
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                                Hub                                   │
//! │                                                                      │
//! │  ┌──────────────────┐   ┌──────────────────────────────────────────┐ │
//! │  │      World       │   │            SharedCollection              │ │
//! │  │                  │   │                                          │ │
//! │  │ id → Entity      │   │ connection-<id> → ConnectionController   │ │
//! │  │                  │   │ room-<id>       → RoomController         │ │
//! │  │ userId → Session │   │                                          │ │
//! │  │   (index)        │   │ by type (memoized)                       │ │
//! │  └──────────────────┘   └──────────────────────────────────────────┘ │
//! │           ▲                          │                               │
//! │           │ components               │ events                        │
//! │  ┌────────┴─────────────────────────▼────────────────────────────┐  │
//! │  │          Machines: one task + mailbox per controller           │  │
//! │  └────────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use room_sync::{Config, Hub, InitializeInput, MemoryAuthProvider};
//!
//! let hub = Hub::new(Config::default(), MemoryAuthProvider::new());
//! let conn = hub.connect()?;
//! let response = hub
//!     .initialize(conn.entity_id(), InitializeInput {
//!         initial_location: "/".into(),
//!         ..Default::default()
//!     })
//!     .await?;
//! ```

pub mod auth;
pub mod club;
pub mod connection;
pub mod ids;
pub mod machine;
pub mod registry;
pub mod room;
pub mod world;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;

// Re-export commonly used types
pub use auth::{AuthError, AuthProvider, AuthSession, AuthTokens, MemoryAuthProvider};
pub use club::{Club, ClubError, ClubMember, MAX_CLUB_MEMBERS};
pub use connection::{
    ConnectionController, ConnectionError, ConnectionEvent, ConnectionMachine, Initialized, InitializeError,
    InitializeInput, InitializeResponse, Liveness,
};
pub use ids::{Snowflake, SnowflakeGenerator};
pub use machine::{InvalidTransition, Machine, MachineError, MachineHandle, Snapshot, StateVector, Step};
pub use registry::{ActorId, ActorRef, ActorType, RegistryError, SharedCollection};
pub use room::{
    GameCommand, GameCommandKind, GameRules, Player, RoomController, RoomError, RoomEvent, RoomOptions, RoomPhase,
    RoomSnapshot, TurnRotation,
};
pub use world::{Component, ComponentName, Components, Entity, EntityId, Index, Schema, World, WorldError};

/// Errors from hub operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Room(#[from] RoomError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    World(#[from] WorldError),

    #[error("unknown connection: {0}")]
    UnknownConnection(EntityId),

    #[error("unknown room: {0}")]
    UnknownRoom(String),

    #[error("room already exists: {0}")]
    RoomExists(String),

    #[error("connection {0} is not initialized")]
    NotInitialized(EntityId),
}

impl HubError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Connection(err) if err.is_timeout())
    }

    pub fn auth_error(&self) -> Option<&AuthError> {
        match self {
            Self::Connection(err) => err.auth_error(),
            _ => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        match self {
            Self::Connection(ConnectionError::Machine(MachineError::Rejected(_))) => true,
            Self::Room(err) => err.is_rejected(),
            _ => false,
        }
    }
}

/// Combined state for one node: the entity world, the live actor registry
/// and the collaborators the machines need.
pub struct Hub<A: AuthProvider> {
    config: Config,
    world: World,
    /// Session entities by user id
    sessions: Index,
    registry: Arc<SharedCollection>,
    auth: Arc<A>,
}

impl<A: AuthProvider> std::fmt::Debug for Hub<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("entities", &self.world.len())
            .field("sessions", &self.sessions.len())
            .field("registry", &self.registry)
            .finish()
    }
}

impl<A: AuthProvider> Hub<A> {
    pub fn new(config: Config, auth: A) -> Self {
        let world = World::new(config.node_id);
        let sessions = world.create_schema_index(Schema::Session, ComponentName::UserId);
        let registry = Arc::new(SharedCollection::new());
        // Nothing is restored on startup; the empty set is the first set.
        registry.mark_initialized();

        Self {
            config,
            world,
            sessions,
            registry,
            auth: Arc::new(auth),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn registry(&self) -> &Arc<SharedCollection> {
        &self.registry
    }

    pub fn auth(&self) -> &Arc<A> {
        &self.auth
    }

    /// Session entity for `user_id`, if one exists.
    pub fn session_for(&self, user_id: &str) -> Option<EntityId> {
        self.sessions.get(user_id)
    }

    /// Attach a new client: create its connection entity and machine.
    pub fn connect(&self) -> Result<ConnectionController, HubError> {
        let entity_id = self.world.spawn(Components::of(Schema::Connection));
        let initializer =
            connection::session_initializer(self.world.clone(), self.sessions.clone(), Arc::clone(&self.auth));
        let machine = ConnectionMachine::new(
            entity_id,
            self.world.clone(),
            initializer,
            self.config.heartbeat_timeout(),
        );
        let controller = ConnectionController::spawn(machine, self.config.mailbox_capacity);
        self.registry.register(controller.clone())?;
        debug!(connection = %entity_id, "connection attached");
        Ok(controller)
    }

    pub fn connection(&self, entity_id: EntityId) -> Result<ConnectionController, HubError> {
        self.registry
            .connection(entity_id)
            .ok_or(HubError::UnknownConnection(entity_id))
    }

    /// INITIALIZE a connection and wait for it to settle.
    pub async fn initialize(
        &self,
        entity_id: EntityId,
        input: InitializeInput,
    ) -> Result<InitializeResponse, HubError> {
        let conn = self.connection(entity_id)?;
        Ok(conn.initialize(input, self.config.initialize_timeout()).await?)
    }

    pub async fn heartbeat(&self, entity_id: EntityId) -> Result<(), HubError> {
        Ok(self.connection(entity_id)?.heartbeat().await?)
    }

    pub async fn navigate(&self, entity_id: EntityId, location: impl Into<String>) -> Result<(), HubError> {
        Ok(self.connection(entity_id)?.navigate(location).await?)
    }

    /// Detach a client. An initialized connection keeps its entity, stamped
    /// with `disconnectedAt`, until the reconnect grace period runs out; an
    /// uninitialized one is removed now. An initialize still in flight is
    /// given up to the initialize timeout to settle first, so its session
    /// link is not lost. If this was the user's last live connection, the
    /// user leaves every room they are connected in.
    pub async fn disconnect(&self, entity_id: EntityId) -> Result<(), HubError> {
        let conn = self.connection(entity_id)?;
        self.registry.unregister(&ActorId::connection(entity_id))?;

        if conn.snapshot().state.initialized == Initialized::Initializing {
            let settled = conn
                .machine()
                .wait_for(|s| s.state.initialized.is_settled(), self.config.initialize_timeout())
                .await;
            if let Err(err) = settled {
                warn!(connection = %entity_id, error = %err, "initialize unsettled at disconnect");
            }
        }
        conn.stop().await;

        let snapshot = conn.snapshot();
        let resumable = snapshot.state.initialized == Initialized::True && snapshot.context.auth_tokens.is_some();
        if resumable {
            self.world
                .add_component(entity_id, Component::DisconnectedAt(Utc::now()))?;
        } else {
            self.world.remove(entity_id)?;
        }
        info!(connection = %entity_id, resumable, "connection detached");

        if let Some(user_id) = &snapshot.context.user_id {
            if !self.user_has_live_connection(user_id) {
                self.leave_all_rooms(user_id).await;
            }
        }
        Ok(())
    }

    fn user_has_live_connection(&self, user_id: &str) -> bool {
        self.registry
            .connections()
            .iter()
            .any(|c| c.snapshot().context.user_id.as_deref() == Some(user_id))
    }

    async fn leave_all_rooms(&self, user_id: &str) {
        for room in self.registry.rooms() {
            let connected = room
                .snapshot()
                .context
                .player(user_id)
                .is_some_and(|p| p.connected);
            if connected {
                if let Err(err) = room.leave(user_id).await {
                    warn!(room = %room.room_id(), user = user_id, error = %err, "leave on disconnect failed");
                }
            }
        }
    }

    /// Remove detached connection entities past the grace period and check
    /// liveness on every live connection.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> CleanupResult {
        let mut result = CleanupResult::default();

        let grace = self.config.reconnect_grace();
        for entity in self.world.entities_of(Schema::Connection) {
            let Some(disconnected_at) = entity.components.disconnected_at else {
                continue;
            };
            let expired = now
                .signed_duration_since(disconnected_at)
                .to_std()
                .map(|detached| detached > grace)
                .unwrap_or(false);
            if expired && self.world.remove(entity.id).is_ok() {
                result.expired_connections.push(entity.id);
            }
        }

        for conn in self.registry.connections() {
            match conn.check_liveness(now).await {
                Ok(true) => result.stale_connections.push(conn.entity_id()),
                Ok(false) => {}
                Err(err) => debug!(connection = %conn.entity_id(), error = %err, "liveness check skipped"),
            }
        }

        if !result.is_empty() {
            info!(
                expired = result.expired_connections.len(),
                stale = result.stale_connections.len(),
                "cleanup pass"
            );
        }
        result
    }

    /// Run [`expire_stale`](Self::expire_stale) every heartbeat interval
    /// until the hub is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::downgrade(self);
        let period = self.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                hub.expire_stale(Utc::now()).await;
            }
        })
    }

    /// Create a room from `club` with the built-in turn rotation rules.
    pub fn create_room(&self, room_id: impl Into<String>, club: &Club) -> Result<RoomController, HubError> {
        self.create_room_with_rules(room_id, club, TurnRotation::default())
    }

    pub fn create_room_with_rules(
        &self,
        room_id: impl Into<String>,
        club: &Club,
        rules: impl GameRules,
    ) -> Result<RoomController, HubError> {
        let room_id = room_id.into();
        if self.registry.contains(&ActorId::room(&room_id)) {
            return Err(HubError::RoomExists(room_id));
        }
        let options = RoomOptions {
            mailbox_capacity: self.config.mailbox_capacity,
            min_players: self.config.min_players_to_start,
        };
        let room = RoomController::create(room_id.clone(), club, rules, &self.world, options)?;

        if let Err(err) = self.registry.register(room.clone()) {
            // Lost a race with another create for the same id.
            self.world.remove(room.entity_id())?;
            return Err(match err {
                RegistryError::Duplicate(_) => HubError::RoomExists(room_id),
                other => other.into(),
            });
        }
        Ok(room)
    }

    pub fn room(&self, room_id: &str) -> Option<RoomController> {
        self.registry.room(room_id)
    }

    /// Join a room as the user behind `connection`.
    pub async fn join_room(&self, room_id: &str, connection: EntityId) -> Result<RoomSnapshot, HubError> {
        let user_id = self.user_of(connection)?;
        let room = self.room(room_id).ok_or_else(|| HubError::UnknownRoom(room_id.to_string()))?;
        Ok(room.join(user_id).await?)
    }

    pub async fn leave_room(&self, room_id: &str, connection: EntityId) -> Result<RoomSnapshot, HubError> {
        let user_id = self.user_of(connection)?;
        let room = self.room(room_id).ok_or_else(|| HubError::UnknownRoom(room_id.to_string()))?;
        Ok(room.leave(user_id).await?)
    }

    fn user_of(&self, connection: EntityId) -> Result<String, HubError> {
        self.connection(connection)?
            .snapshot()
            .context
            .user_id
            .clone()
            .ok_or(HubError::NotInitialized(connection))
    }

    /// Stop a room and forget it.
    pub async fn dispose_room(&self, room_id: &str) -> Result<(), HubError> {
        let actor = self
            .registry
            .unregister(&ActorId::room(room_id))
            .map_err(|_| HubError::UnknownRoom(room_id.to_string()))?;
        if let ActorRef::Room(room) = actor {
            room.dispose().await?;
        }
        Ok(())
    }
}

/// Result of a cleanup pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupResult {
    /// Detached connection entities removed after the grace period
    pub expired_connections: Vec<EntityId>,
    /// Live connections found silent past the heartbeat timeout
    pub stale_connections: Vec<EntityId>,
}

impl CleanupResult {
    pub fn is_empty(&self) -> bool {
        self.expired_connections.is_empty() && self.stale_connections.is_empty()
    }
}
