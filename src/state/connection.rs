//! Connection state machine.
//!
//! One machine per attached client. It authenticates the client, links the
//! connection entity to a long-lived session entity, and tracks heartbeat
//! liveness.
//!
//! # State Diagram
//!
//! ```text
//! Initialized region                      Liveness region
//!
//! ┌───────┐ INITIALIZE ┌──────────────┐   ┌───────┐ CHECK_LIVENESS ┌───────┐
//! │ False │───────────▶│ Initializing │   │ Alive │───────────────▶│ Stale │
//! └───────┘            └──────┬───────┘   └───────┘  (initialized, └───┬───┘
//!     ▲               task ok │ task err      ▲       timed out)       │
//!     │                       ▼     │         └────── HEARTBEAT ───────┘
//!     │                 ┌──────┐    ▼
//!     │                 │ True │ ┌───────┐
//!     │                 └──────┘ │ Error │── INITIALIZE ──▶ Initializing
//!     │                          └───────┘
//! ```
//!
//! INITIALIZE while `Initializing` or `True` is accepted as a no-op: the
//! running task is not restarted and callers observe the same result.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::auth::{resolve_or_create_session, AuthError, AuthProvider, AuthTokens};
use super::machine::{
    region_paths, BoxFuture, Machine, MachineError, MachineHandle, Snapshot, StateVector, Step,
};
use super::world::{Component, Components, EntityId, Index, Schema, World, WorldError};

/// The `Initialized` region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Initialized {
    #[default]
    False,
    Initializing,
    True,
    Error,
}

impl Initialized {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::False => "False",
            Self::Initializing => "Initializing",
            Self::True => "True",
            Self::Error => "Error",
        }
    }

    /// Settled means no task is in flight.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::True | Self::Error)
    }
}

/// The `Liveness` region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Liveness {
    #[default]
    Alive,
    Stale,
}

impl Liveness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alive => "Alive",
            Self::Stale => "Stale",
        }
    }
}

/// Connection state vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub initialized: Initialized,
    pub liveness: Liveness,
}

impl StateVector for ConnectionState {
    fn paths(&self) -> BTreeSet<String> {
        region_paths("Initialized", &[self.initialized.as_str()])
            .into_iter()
            .chain(region_paths("Liveness", &[self.liveness.as_str()]))
            .collect()
    }
}

/// Payload of INITIALIZE.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeInput {
    #[serde(default)]
    pub auth_tokens: Option<AuthTokens>,
    pub initial_location: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Events accepted by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Initialize(InitializeInput),
    Heartbeat,
    Navigate { location: String },
    CheckLiveness { now: DateTime<Utc> },
}

/// What the INITIALIZE task produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializedConnection {
    pub user_id: String,
    pub session_id: EntityId,
    pub auth_tokens: AuthTokens,
    pub device_id: String,
    pub location: String,
}

/// Why the INITIALIZE task failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitializeError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    World(#[from] WorldError),
}

/// Machine context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub entity_id: EntityId,
    pub user_id: Option<String>,
    pub session_id: Option<EntityId>,
    pub device_id: Option<String>,
    pub auth_tokens: Option<AuthTokens>,
    pub location: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub error: Option<InitializeError>,
}

/// The response returned to the client once initialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    pub device_id: String,
    pub auth_tokens: AuthTokens,
}

/// Runs the INITIALIZE task for a connection entity.
pub type Initializer =
    Arc<dyn Fn(EntityId, InitializeInput) -> BoxFuture<Result<InitializedConnection, InitializeError>> + Send + Sync>;

/// The standard INITIALIZE task: authenticate (or create an anonymous
/// user), resolve or create the user's session entity through `sessions`,
/// and write session, device, tokens and location onto the connection.
pub fn session_initializer<A: AuthProvider>(world: World, sessions: Index, auth: Arc<A>) -> Initializer {
    Arc::new(move |connection_id: EntityId, input: InitializeInput| -> BoxFuture<Result<InitializedConnection, InitializeError>> {
        let world = world.clone();
        let sessions = sessions.clone();
        let auth = Arc::clone(&auth);
        Box::pin(async move {
            let session = resolve_or_create_session(auth.as_ref(), input.auth_tokens).await?;

            let user_id = session.user_id.clone();
            let (session_id, created) = world.get_or_insert_indexed(&sessions, &user_id, || {
                Components::of(Schema::Session).with(Component::UserId(user_id.clone()))
            })?;
            if created {
                info!(user = %session.user_id, session = %session_id, "session created");
            }

            let device_id = input
                .device_id
                .unwrap_or_else(|| world.next_id().to_string());

            world.add_components(
                connection_id,
                [
                    Component::SessionId(session_id),
                    Component::DeviceId(device_id.clone()),
                    Component::AuthTokens(session.tokens.clone()),
                    Component::Location(input.initial_location.clone()),
                ],
            )?;

            Ok(InitializedConnection {
                user_id: session.user_id,
                session_id,
                auth_tokens: session.tokens,
                device_id,
                location: input.initial_location,
            })
        })
    })
}

/// Connection machine behaviour.
pub struct ConnectionMachine {
    entity_id: EntityId,
    world: World,
    initializer: Initializer,
    heartbeat_timeout: Duration,
}

impl ConnectionMachine {
    pub fn new(entity_id: EntityId, world: World, initializer: Initializer, heartbeat_timeout: Duration) -> Self {
        Self {
            entity_id,
            world,
            initializer,
            heartbeat_timeout,
        }
    }
}

impl Machine for ConnectionMachine {
    type State = ConnectionState;
    type Context = ConnectionContext;
    type Event = ConnectionEvent;
    type Output = InitializedConnection;
    type Failure = InitializeError;

    fn name(&self) -> String {
        format!("connection-{}", self.entity_id)
    }

    fn initial(&self) -> (ConnectionState, ConnectionContext) {
        let now = Utc::now();
        (
            ConnectionState::default(),
            ConnectionContext {
                entity_id: self.entity_id,
                user_id: None,
                session_id: None,
                device_id: None,
                auth_tokens: None,
                location: None,
                connected_at: now,
                last_heartbeat: now,
                error: None,
            },
        )
    }

    fn on_event(
        &mut self,
        state: &ConnectionState,
        context: &ConnectionContext,
        event: ConnectionEvent,
    ) -> Result<Option<Step<Self>>, &'static str> {
        use ConnectionEvent::*;

        match event {
            Initialize(input) => match state.initialized {
                Initialized::False | Initialized::Error => {
                    let task = (self.initializer)(self.entity_id, input);
                    let next = ConnectionState {
                        initialized: Initialized::Initializing,
                        ..*state
                    };
                    let context = ConnectionContext {
                        error: None,
                        ..context.clone()
                    };
                    Ok(Some(Step::new(next, context).invoke(task)))
                }
                // Re-entrant INITIALIZE: keep the running task / existing result.
                Initialized::Initializing | Initialized::True => Ok(None),
            },

            Heartbeat => {
                if state.initialized != Initialized::True {
                    return Err("connection not initialized");
                }
                let next = ConnectionState {
                    liveness: Liveness::Alive,
                    ..*state
                };
                let context = ConnectionContext {
                    last_heartbeat: Utc::now(),
                    ..context.clone()
                };
                Ok(Some(Step::new(next, context)))
            }

            Navigate { location } => {
                if state.initialized != Initialized::True {
                    return Err("connection not initialized");
                }
                self.world
                    .add_component(self.entity_id, Component::Location(location.clone()))
                    .map_err(|_| "connection entity missing")?;
                let context = ConnectionContext {
                    location: Some(location),
                    ..context.clone()
                };
                Ok(Some(Step::new(*state, context)))
            }

            CheckLiveness { now } => {
                // Only initialized connections are expected to heartbeat.
                if state.initialized != Initialized::True || state.liveness == Liveness::Stale {
                    return Ok(None);
                }
                let silent = now.signed_duration_since(context.last_heartbeat);
                let timed_out = silent
                    .to_std()
                    .map(|silent| silent > self.heartbeat_timeout)
                    .unwrap_or(false);
                if !timed_out {
                    return Ok(None);
                }
                let next = ConnectionState {
                    liveness: Liveness::Stale,
                    ..*state
                };
                Ok(Some(Step::new(next, context.clone())))
            }
        }
    }

    fn on_done(
        &mut self,
        state: &ConnectionState,
        context: &ConnectionContext,
        result: Result<InitializedConnection, InitializeError>,
    ) -> Option<Step<Self>> {
        if state.initialized != Initialized::Initializing {
            return None;
        }
        Some(match result {
            Ok(done) => {
                info!(connection = %self.entity_id, user = %done.user_id, "connection initialized");
                let next = ConnectionState {
                    initialized: Initialized::True,
                    liveness: Liveness::Alive,
                };
                let context = ConnectionContext {
                    user_id: Some(done.user_id),
                    session_id: Some(done.session_id),
                    device_id: Some(done.device_id),
                    auth_tokens: Some(done.auth_tokens),
                    location: Some(done.location),
                    last_heartbeat: Utc::now(),
                    error: None,
                    ..context.clone()
                };
                Step::new(next, context)
            }
            Err(error) => {
                let next = ConnectionState {
                    initialized: Initialized::Error,
                    ..*state
                };
                let context = ConnectionContext {
                    error: Some(error),
                    ..context.clone()
                };
                Step::new(next, context)
            }
        })
    }
}

/// Errors surfaced to connection callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error(transparent)]
    Machine(#[from] MachineError),

    #[error("initialization failed: {0}")]
    Initialize(InitializeError),
}

impl ConnectionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Machine(MachineError::Timeout { .. }))
    }

    pub fn auth_error(&self) -> Option<&AuthError> {
        match self {
            Self::Initialize(InitializeError::Auth(err)) => Some(err),
            _ => None,
        }
    }
}

pub type ConnectionSnapshot = Snapshot<ConnectionMachine>;

/// Controller for one client connection.
#[derive(Clone)]
pub struct ConnectionController {
    entity_id: EntityId,
    machine: MachineHandle<ConnectionMachine>,
}

impl fmt::Debug for ConnectionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionController")
            .field("entity_id", &self.entity_id)
            .field("paths", &self.machine.snapshot().paths)
            .finish()
    }
}

impl ConnectionController {
    pub fn spawn(machine: ConnectionMachine, capacity: usize) -> Self {
        let entity_id = machine.entity_id;
        Self {
            entity_id,
            machine: MachineHandle::spawn(machine, capacity),
        }
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn snapshot(&self) -> Arc<ConnectionSnapshot> {
        self.machine.snapshot()
    }

    pub fn machine(&self) -> &MachineHandle<ConnectionMachine> {
        &self.machine
    }

    pub fn is_initialized(&self) -> bool {
        self.snapshot().state.initialized == Initialized::True
    }

    /// Send INITIALIZE and wait, at most `timeout`, for the connection to
    /// settle in `Initialized.True` or `Error`.
    pub async fn initialize(
        &self,
        input: InitializeInput,
        timeout: Duration,
    ) -> Result<InitializeResponse, ConnectionError> {
        // Dispatch first so a stale Error from an earlier attempt is not
        // mistaken for the outcome of this one.
        self.machine.dispatch(ConnectionEvent::Initialize(input)).await?;
        let settled = self
            .machine
            .wait_for(|s| s.state.initialized.is_settled(), timeout)
            .await?;

        let context = &settled.context;
        match (settled.state.initialized, &context.device_id, &context.auth_tokens) {
            (Initialized::True, Some(device_id), Some(auth_tokens)) => Ok(InitializeResponse {
                device_id: device_id.clone(),
                auth_tokens: auth_tokens.clone(),
            }),
            _ => Err(ConnectionError::Initialize(context.error.clone().unwrap_or_else(|| {
                InitializeError::World(WorldError::UnknownEntity(self.entity_id))
            }))),
        }
    }

    pub async fn heartbeat(&self) -> Result<(), ConnectionError> {
        self.machine.dispatch(ConnectionEvent::Heartbeat).await?;
        Ok(())
    }

    pub async fn navigate(&self, location: impl Into<String>) -> Result<(), ConnectionError> {
        self.machine
            .dispatch(ConnectionEvent::Navigate {
                location: location.into(),
            })
            .await?;
        Ok(())
    }

    /// Returns true if the connection is stale after the check.
    pub async fn check_liveness(&self, now: DateTime<Utc>) -> Result<bool, ConnectionError> {
        let snapshot = self
            .machine
            .dispatch(ConnectionEvent::CheckLiveness { now })
            .await?;
        Ok(snapshot.state.liveness == Liveness::Stale)
    }

    pub async fn stop(&self) {
        self.machine.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::auth::MemoryAuthProvider;
    use crate::state::world::ComponentName;
    use pretty_assertions::assert_eq;

    const WAIT: Duration = Duration::from_secs(2);

    struct Fixture {
        world: World,
        sessions: Index,
        auth: Arc<MemoryAuthProvider>,
    }

    impl Fixture {
        fn new(auth: MemoryAuthProvider) -> Self {
            let world = World::new(1);
            let sessions = world.create_schema_index(Schema::Session, ComponentName::UserId);
            Self {
                world,
                sessions,
                auth: Arc::new(auth),
            }
        }

        fn connect(&self) -> ConnectionController {
            let entity_id = self.world.spawn(Components::of(Schema::Connection));
            let initializer =
                session_initializer(self.world.clone(), self.sessions.clone(), Arc::clone(&self.auth));
            ConnectionController::spawn(
                ConnectionMachine::new(entity_id, self.world.clone(), initializer, Duration::from_secs(45)),
                16,
            )
        }
    }

    fn input() -> InitializeInput {
        InitializeInput {
            auth_tokens: None,
            initial_location: "https://example.test/".into(),
            device_id: None,
        }
    }

    #[tokio::test]
    async fn test_initial_state() {
        let fixture = Fixture::new(MemoryAuthProvider::new());
        let conn = fixture.connect();
        let snapshot = conn.snapshot();

        assert!(snapshot.matches("Initialized.False"));
        assert!(snapshot.matches("Liveness.Alive"));
        assert!(!conn.is_initialized());
    }

    #[tokio::test]
    async fn test_anonymous_initialize() {
        let fixture = Fixture::new(MemoryAuthProvider::new());
        let conn = fixture.connect();

        let response = conn.initialize(input(), WAIT).await.unwrap();
        let snapshot = conn.snapshot();
        assert!(snapshot.matches("Initialized.True"));

        let user_id = snapshot.context.user_id.clone().unwrap();
        let session_id = fixture.sessions.get(&user_id).unwrap();
        assert_eq!(snapshot.context.session_id, Some(session_id));

        let entity = fixture.world.get(conn.entity_id()).unwrap();
        assert_eq!(entity.components.session_id, Some(session_id));
        assert_eq!(entity.components.device_id, Some(response.device_id));
        assert_eq!(entity.components.auth_tokens, Some(response.auth_tokens));
        assert_eq!(entity.components.location.as_deref(), Some("https://example.test/"));
    }

    #[tokio::test]
    async fn test_supplied_device_id_reused() {
        let fixture = Fixture::new(MemoryAuthProvider::new());
        let conn = fixture.connect();
        let response = conn
            .initialize(
                InitializeInput {
                    device_id: Some("device-42".into()),
                    ..input()
                },
                WAIT,
            )
            .await
            .unwrap();
        assert_eq!(response.device_id, "device-42");
    }

    #[tokio::test]
    async fn test_duplicate_initialize_runs_task_once() {
        let fixture = Fixture::new(MemoryAuthProvider::new().with_latency(Duration::from_millis(50)));
        let conn = fixture.connect();

        let (first, second) = tokio::join!(conn.initialize(input(), WAIT), conn.initialize(input(), WAIT));
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.device_id, second.device_id);
        assert_eq!(fixture.auth.calls(), 1);
    }

    #[tokio::test]
    async fn test_initialize_after_true_is_noop() {
        let fixture = Fixture::new(MemoryAuthProvider::new());
        let conn = fixture.connect();

        let first = conn.initialize(input(), WAIT).await.unwrap();
        let again = conn
            .initialize(
                InitializeInput {
                    device_id: Some("other".into()),
                    ..input()
                },
                WAIT,
            )
            .await
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(fixture.auth.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_tokens_drive_error() {
        let fixture = Fixture::new(MemoryAuthProvider::new());
        let conn = fixture.connect();

        let err = conn
            .initialize(
                InitializeInput {
                    auth_tokens: Some(AuthTokens {
                        access_token: "bogus".into(),
                        refresh_token: "bogus".into(),
                    }),
                    ..input()
                },
                WAIT,
            )
            .await
            .unwrap_err();
        assert_eq!(err.auth_error(), Some(&AuthError::InvalidTokens));
        assert!(conn.snapshot().matches("Initialized.Error"));

        // Error accepts a fresh INITIALIZE
        conn.initialize(input(), WAIT).await.unwrap();
        assert!(conn.is_initialized());
    }

    #[tokio::test]
    async fn test_initialize_timeout() {
        let fixture = Fixture::new(MemoryAuthProvider::new().with_latency(Duration::from_millis(500)));
        let conn = fixture.connect();

        let err = conn
            .initialize(input(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        // The task still lands
        conn.machine()
            .wait_for(|s| s.state.initialized == Initialized::True, WAIT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_requires_initialization() {
        let fixture = Fixture::new(MemoryAuthProvider::new());
        let conn = fixture.connect();

        let err = conn.heartbeat().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Machine(MachineError::Rejected(_))));

        conn.initialize(input(), WAIT).await.unwrap();
        conn.heartbeat().await.unwrap();
    }

    #[tokio::test]
    async fn test_navigate_updates_entity() {
        let fixture = Fixture::new(MemoryAuthProvider::new());
        let conn = fixture.connect();
        conn.initialize(input(), WAIT).await.unwrap();

        conn.navigate("https://example.test/rooms/1").await.unwrap();

        assert_eq!(
            conn.snapshot().context.location.as_deref(),
            Some("https://example.test/rooms/1")
        );
        assert_eq!(
            fixture.world.component(conn.entity_id(), ComponentName::Location),
            Some(Component::Location("https://example.test/rooms/1".into()))
        );
    }

    #[tokio::test]
    async fn test_liveness() {
        let fixture = Fixture::new(MemoryAuthProvider::new());
        let conn = fixture.connect();

        // Uninitialized connections never go stale
        let later = Utc::now() + chrono::Duration::minutes(5);
        assert!(!conn.check_liveness(later).await.unwrap());

        conn.initialize(input(), WAIT).await.unwrap();
        assert!(!conn.check_liveness(Utc::now()).await.unwrap());
        assert!(conn.check_liveness(later).await.unwrap());
        assert!(conn.snapshot().matches("Liveness.Stale"));
        // Initialized region untouched
        assert!(conn.snapshot().matches("Initialized.True"));

        conn.heartbeat().await.unwrap();
        assert!(conn.snapshot().matches("Liveness.Alive"));
    }
}
