//! Entity world and live indexes.
//!
//! The world is the single owner of every entity. An entity is an id plus a
//! bag of optional components; its "schema" is whichever components are
//! currently present. Controllers hold ids, never copies, and mutate one
//! component at a time.
//!
//! Indexes are maintained inside the same lock as the entity table, so a
//! lookup that starts after a mutation returns always observes it.
//!
//! ```text
//! World ──▶ entities: id → Components
//!       └─▶ indexes:  [ (schema?, component) → key → {ids} ]
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use super::auth::AuthTokens;
use super::ids::{Snowflake, SnowflakeGenerator};
use super::room::Player;

/// Entity identifier.
pub type EntityId = Snowflake;

/// What kind of record an entity represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schema {
    Connection,
    Session,
    Room,
}

impl Schema {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Session => "session",
            Self::Room => "room",
        }
    }
}

/// Component names, used to remove components and to build indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentName {
    Schema,
    UserId,
    DeviceId,
    AuthTokens,
    Location,
    SessionId,
    RoomId,
    DisconnectedAt,
    HostUserIds,
    Players,
    CurrentStates,
    Game,
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Schema => "schema",
            Self::UserId => "userId",
            Self::DeviceId => "deviceId",
            Self::AuthTokens => "authTokens",
            Self::Location => "location",
            Self::SessionId => "sessionId",
            Self::RoomId => "roomId",
            Self::DisconnectedAt => "disconnectedAt",
            Self::HostUserIds => "hostUserIds",
            Self::Players => "players",
            Self::CurrentStates => "currentStates",
            Self::Game => "game",
        };
        f.write_str(name)
    }
}

/// A single component value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    Schema(Schema),
    UserId(String),
    DeviceId(String),
    AuthTokens(AuthTokens),
    Location(String),
    SessionId(EntityId),
    RoomId(String),
    DisconnectedAt(DateTime<Utc>),
    HostUserIds(BTreeSet<String>),
    /// Room participants by user id
    Players(BTreeMap<String, Player>),
    CurrentStates(BTreeSet<String>),
    /// Game-specific room fields
    Game(Map<String, Value>),
}

impl Component {
    pub fn name(&self) -> ComponentName {
        match self {
            Self::Schema(_) => ComponentName::Schema,
            Self::UserId(_) => ComponentName::UserId,
            Self::DeviceId(_) => ComponentName::DeviceId,
            Self::AuthTokens(_) => ComponentName::AuthTokens,
            Self::Location(_) => ComponentName::Location,
            Self::SessionId(_) => ComponentName::SessionId,
            Self::RoomId(_) => ComponentName::RoomId,
            Self::DisconnectedAt(_) => ComponentName::DisconnectedAt,
            Self::HostUserIds(_) => ComponentName::HostUserIds,
            Self::Players(_) => ComponentName::Players,
            Self::CurrentStates(_) => ComponentName::CurrentStates,
            Self::Game(_) => ComponentName::Game,
        }
    }
}

/// The fixed-shape component record of one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Components {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_tokens: Option<AuthTokens>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<EntityId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_user_ids: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub players: Option<BTreeMap<String, Player>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_states: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game: Option<Map<String, Value>>,
}

impl Components {
    /// Components of a fresh entity of the given schema.
    pub fn of(schema: Schema) -> Self {
        Self {
            schema: Some(schema),
            ..Self::default()
        }
    }

    pub fn with(mut self, component: Component) -> Self {
        self.set(component);
        self
    }

    pub fn get(&self, name: ComponentName) -> Option<Component> {
        match name {
            ComponentName::Schema => self.schema.map(Component::Schema),
            ComponentName::UserId => self.user_id.clone().map(Component::UserId),
            ComponentName::DeviceId => self.device_id.clone().map(Component::DeviceId),
            ComponentName::AuthTokens => self.auth_tokens.clone().map(Component::AuthTokens),
            ComponentName::Location => self.location.clone().map(Component::Location),
            ComponentName::SessionId => self.session_id.map(Component::SessionId),
            ComponentName::RoomId => self.room_id.clone().map(Component::RoomId),
            ComponentName::DisconnectedAt => self.disconnected_at.map(Component::DisconnectedAt),
            ComponentName::HostUserIds => self.host_user_ids.clone().map(Component::HostUserIds),
            ComponentName::Players => self.players.clone().map(Component::Players),
            ComponentName::CurrentStates => self.current_states.clone().map(Component::CurrentStates),
            ComponentName::Game => self.game.clone().map(Component::Game),
        }
    }

    pub fn has(&self, name: ComponentName) -> bool {
        self.index_key(name).is_some()
    }

    /// Set a component, returning the previous value.
    pub fn set(&mut self, component: Component) -> Option<Component> {
        let previous = self.take(component.name());
        match component {
            Component::Schema(v) => self.schema = Some(v),
            Component::UserId(v) => self.user_id = Some(v),
            Component::DeviceId(v) => self.device_id = Some(v),
            Component::AuthTokens(v) => self.auth_tokens = Some(v),
            Component::Location(v) => self.location = Some(v),
            Component::SessionId(v) => self.session_id = Some(v),
            Component::RoomId(v) => self.room_id = Some(v),
            Component::DisconnectedAt(v) => self.disconnected_at = Some(v),
            Component::HostUserIds(v) => self.host_user_ids = Some(v),
            Component::Players(v) => self.players = Some(v),
            Component::CurrentStates(v) => self.current_states = Some(v),
            Component::Game(v) => self.game = Some(v),
        }
        previous
    }

    /// Remove a component, returning it.
    pub fn take(&mut self, name: ComponentName) -> Option<Component> {
        match name {
            ComponentName::Schema => self.schema.take().map(Component::Schema),
            ComponentName::UserId => self.user_id.take().map(Component::UserId),
            ComponentName::DeviceId => self.device_id.take().map(Component::DeviceId),
            ComponentName::AuthTokens => self.auth_tokens.take().map(Component::AuthTokens),
            ComponentName::Location => self.location.take().map(Component::Location),
            ComponentName::SessionId => self.session_id.take().map(Component::SessionId),
            ComponentName::RoomId => self.room_id.take().map(Component::RoomId),
            ComponentName::DisconnectedAt => self.disconnected_at.take().map(Component::DisconnectedAt),
            ComponentName::HostUserIds => self.host_user_ids.take().map(Component::HostUserIds),
            ComponentName::Players => self.players.take().map(Component::Players),
            ComponentName::CurrentStates => self.current_states.take().map(Component::CurrentStates),
            ComponentName::Game => self.game.take().map(Component::Game),
        }
    }

    /// The string key an index over `name` files this record under.
    pub fn index_key(&self, name: ComponentName) -> Option<String> {
        match name {
            ComponentName::Schema => self.schema.map(|s| s.as_str().to_string()),
            ComponentName::UserId => self.user_id.clone(),
            ComponentName::DeviceId => self.device_id.clone(),
            ComponentName::AuthTokens => self.auth_tokens.as_ref().map(|t| t.access_token.clone()),
            ComponentName::Location => self.location.clone(),
            ComponentName::SessionId => self.session_id.map(|id| id.to_string()),
            ComponentName::RoomId => self.room_id.clone(),
            ComponentName::DisconnectedAt => self.disconnected_at.map(|t| t.to_rfc3339()),
            ComponentName::HostUserIds => self.host_user_ids.as_ref().map(|ids| join_keys(ids.iter())),
            ComponentName::Players => self.players.as_ref().map(|players| join_keys(players.keys())),
            ComponentName::CurrentStates => self.current_states.as_ref().map(|paths| join_keys(paths.iter())),
            ComponentName::Game => self.game.as_ref().map(|game| Value::Object(game.clone()).to_string()),
        }
    }
}

fn join_keys<'a>(keys: impl Iterator<Item = &'a String>) -> String {
    keys.map(String::as_str).collect::<Vec<_>>().join(",")
}

/// An entity: id plus components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(flatten)]
    pub components: Components,
}

impl Entity {
    pub fn new(id: EntityId, components: Components) -> Self {
        Self { id, components }
    }
}

/// World errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorldError {
    #[error("unknown entity: {0}")]
    UnknownEntity(EntityId),

    #[error("entity already exists: {0}")]
    DuplicateEntity(EntityId),

    #[error("index belongs to another world")]
    ForeignIndex,
}

pub type WorldResult<T> = Result<T, WorldError>;

#[derive(Debug)]
struct IndexTable {
    component: ComponentName,
    schema: Option<Schema>,
    entries: HashMap<String, BTreeSet<EntityId>>,
}

impl IndexTable {
    fn key_for(&self, components: &Components) -> Option<String> {
        if let Some(schema) = self.schema {
            if components.schema != Some(schema) {
                return None;
            }
        }
        components.index_key(self.component)
    }

    fn first(&self, key: &str) -> Option<EntityId> {
        self.entries.get(key).and_then(|ids| ids.first().copied())
    }

    fn insert(&mut self, id: EntityId, components: &Components) {
        if let Some(key) = self.key_for(components) {
            self.entries.entry(key).or_default().insert(id);
        }
    }

    fn remove(&mut self, id: EntityId, components: &Components) {
        if let Some(key) = self.key_for(components) {
            if let Some(ids) = self.entries.get_mut(&key) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct WorldInner {
    entities: HashMap<EntityId, Components>,
    indexes: Vec<IndexTable>,
}

impl WorldInner {
    fn insert(&mut self, id: EntityId, components: Components) {
        for index in &mut self.indexes {
            index.insert(id, &components);
        }
        self.entities.insert(id, components);
    }

    /// Run `f` on one entity's components, keeping every index current.
    fn mutate<R>(
        &mut self,
        id: EntityId,
        f: impl FnOnce(&mut Components) -> R,
    ) -> WorldResult<R> {
        let components = self
            .entities
            .get_mut(&id)
            .ok_or(WorldError::UnknownEntity(id))?;
        for index in &mut self.indexes {
            index.remove(id, components);
        }
        let result = f(components);
        for index in &mut self.indexes {
            index.insert(id, components);
        }
        Ok(result)
    }
}

#[derive(Debug)]
struct Shared {
    ids: SnowflakeGenerator,
    inner: RwLock<WorldInner>,
}

/// Handle to the entity world. Cloning shares the same world.
#[derive(Debug, Clone)]
pub struct World {
    shared: Arc<Shared>,
}

impl World {
    /// Create an empty world minting ids for the given node.
    pub fn new(node_id: u16) -> Self {
        Self {
            shared: Arc::new(Shared {
                ids: SnowflakeGenerator::new(node_id),
                inner: RwLock::new(WorldInner::default()),
            }),
        }
    }

    /// Mint a fresh id from the world's generator.
    pub fn next_id(&self) -> Snowflake {
        self.shared.ids.next_id()
    }

    /// Create and add a new entity, returning its id.
    pub fn spawn(&self, components: Components) -> EntityId {
        let id = self.next_id();
        self.shared.inner.write().insert(id, components);
        debug!(entity = %id, "entity spawned");
        id
    }

    /// Add an entity built elsewhere.
    pub fn add(&self, entity: Entity) -> WorldResult<EntityId> {
        let mut inner = self.shared.inner.write();
        if inner.entities.contains_key(&entity.id) {
            return Err(WorldError::DuplicateEntity(entity.id));
        }
        inner.insert(entity.id, entity.components);
        debug!(entity = %entity.id, "entity added");
        Ok(entity.id)
    }

    /// Remove an entity and drop it from every index.
    pub fn remove(&self, id: EntityId) -> WorldResult<Entity> {
        let mut inner = self.shared.inner.write();
        let components = inner
            .entities
            .remove(&id)
            .ok_or(WorldError::UnknownEntity(id))?;
        for index in &mut inner.indexes {
            index.remove(id, &components);
        }
        debug!(entity = %id, "entity removed");
        Ok(Entity::new(id, components))
    }

    /// Set a component on an existing entity, returning the previous value.
    pub fn add_component(&self, id: EntityId, component: Component) -> WorldResult<Option<Component>> {
        self.shared
            .inner
            .write()
            .mutate(id, |components| components.set(component))
    }

    /// Set several components at once; either all apply or, for an unknown
    /// entity, none do.
    pub fn add_components(
        &self,
        id: EntityId,
        components: impl IntoIterator<Item = Component>,
    ) -> WorldResult<()> {
        self.shared.inner.write().mutate(id, |current| {
            for component in components {
                current.set(component);
            }
        })
    }

    /// Remove a component from an existing entity.
    pub fn remove_component(&self, id: EntityId, name: ComponentName) -> WorldResult<Option<Component>> {
        self.shared
            .inner
            .write()
            .mutate(id, |components| components.take(name))
    }

    pub fn get(&self, id: EntityId) -> Option<Entity> {
        self.shared
            .inner
            .read()
            .entities
            .get(&id)
            .map(|c| Entity::new(id, c.clone()))
    }

    pub fn component(&self, id: EntityId, name: ComponentName) -> Option<Component> {
        self.shared.inner.read().entities.get(&id)?.get(name)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.shared.inner.read().entities.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.shared.inner.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entities of a schema, ordered by id.
    pub fn entities_of(&self, schema: Schema) -> Vec<Entity> {
        let inner = self.shared.inner.read();
        let mut entities: Vec<Entity> = inner
            .entities
            .iter()
            .filter(|(_, c)| c.schema == Some(schema))
            .map(|(id, c)| Entity::new(*id, c.clone()))
            .collect();
        entities.sort_by_key(|e| e.id);
        entities
    }

    /// Create a live index over a component of every entity.
    pub fn create_index(&self, component: ComponentName) -> Index {
        self.build_index(None, component)
    }

    /// Create a live index over a component of entities of one schema.
    pub fn create_schema_index(&self, schema: Schema, component: ComponentName) -> Index {
        self.build_index(Some(schema), component)
    }

    fn build_index(&self, schema: Option<Schema>, component: ComponentName) -> Index {
        let mut inner = self.shared.inner.write();
        let mut table = IndexTable {
            component,
            schema,
            entries: HashMap::new(),
        };
        for (id, components) in &inner.entities {
            table.insert(*id, components);
        }
        inner.indexes.push(table);
        let slot = inner.indexes.len() - 1;
        debug!(%component, ?schema, "index created");
        Index {
            shared: Arc::clone(&self.shared),
            slot,
        }
    }

    /// Resolve the entity filed under `key` in `index`, or spawn one from
    /// `make` if there is none. Lookup and insert happen under one lock, so
    /// concurrent callers for the same key agree on a single entity.
    ///
    /// Returns the id and whether it was created.
    pub fn get_or_insert_indexed(
        &self,
        index: &Index,
        key: &str,
        make: impl FnOnce() -> Components,
    ) -> WorldResult<(EntityId, bool)> {
        if !Arc::ptr_eq(&index.shared, &self.shared) {
            return Err(WorldError::ForeignIndex);
        }
        let mut inner = self.shared.inner.write();
        let table = inner.indexes.get(index.slot).ok_or(WorldError::ForeignIndex)?;
        if let Some(id) = table.first(key) {
            return Ok((id, false));
        }
        let id = self.shared.ids.next_id();
        inner.insert(id, make());
        debug!(entity = %id, key, "entity created for index key");
        Ok((id, true))
    }
}

/// A live mapping from a component's value to the entities holding it.
///
/// When several entities share a key the oldest (lowest id) is returned.
#[derive(Debug, Clone)]
pub struct Index {
    shared: Arc<Shared>,
    slot: usize,
}

impl Index {
    pub fn get(&self, key: &str) -> Option<EntityId> {
        self.shared.inner.read().indexes.get(self.slot)?.first(key)
    }

    pub fn get_all(&self, key: &str) -> Vec<EntityId> {
        self.shared
            .inner
            .read()
            .indexes
            .get(self.slot)
            .and_then(|table| table.entries.get(key))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn get_entity(&self, key: &str) -> Option<Entity> {
        let inner = self.shared.inner.read();
        let id = inner.indexes.get(self.slot)?.first(key)?;
        inner.entities.get(&id).map(|c| Entity::new(id, c.clone()))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.shared
            .inner
            .read()
            .indexes
            .get(self.slot)
            .map_or(0, |table| table.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
