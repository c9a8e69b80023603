//! Shared collection of live actors.
//!
//! Any part of the hub can resolve a live room or connection by id without
//! holding a direct reference to it. The table is copy-on-write: each
//! register/unregister swaps in a new map, and the per-type views are
//! memoized against the identity of the map they were computed from, so a
//! swap invalidates them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

use super::connection::ConnectionController;
use super::room::RoomController;
use super::world::EntityId;

/// Kinds of actor tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActorType {
    Room,
    Connection,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Room => "room",
            Self::Connection => "connection",
        }
    }
}

impl fmt::Display for ActorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActorType {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "room" => Ok(Self::Room),
            "connection" => Ok(Self::Connection),
            other => Err(RegistryError::UnknownType(other.to_string())),
        }
    }
}

/// Actor id of the form `<type>-<key>`. The type is always recoverable
/// from the id alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(actor_type: ActorType, key: impl fmt::Display) -> Self {
        Self(format!("{}-{}", actor_type.as_str(), key))
    }

    pub fn room(room_id: &str) -> Self {
        Self::new(ActorType::Room, room_id)
    }

    pub fn connection(entity_id: EntityId) -> Self {
        Self::new(ActorType::Connection, entity_id)
    }

    pub fn actor_type(&self) -> Option<ActorType> {
        let (prefix, _) = self.0.split_once('-')?;
        prefix.parse().ok()
    }

    /// The part after the type prefix.
    pub fn key(&self) -> &str {
        self.0.split_once('-').map(|(_, key)| key).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ActorId {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, key) = s
            .split_once('-')
            .ok_or_else(|| RegistryError::UnknownType(s.to_string()))?;
        let actor_type: ActorType = prefix.parse()?;
        Ok(Self::new(actor_type, key))
    }
}

/// A live actor.
#[derive(Debug, Clone)]
pub enum ActorRef {
    Room(RoomController),
    Connection(ConnectionController),
}

impl ActorRef {
    pub fn actor_type(&self) -> ActorType {
        match self {
            Self::Room(_) => ActorType::Room,
            Self::Connection(_) => ActorType::Connection,
        }
    }

    pub fn id(&self) -> ActorId {
        match self {
            Self::Room(room) => ActorId::room(room.room_id()),
            Self::Connection(conn) => ActorId::connection(conn.entity_id()),
        }
    }

    pub fn as_room(&self) -> Option<&RoomController> {
        match self {
            Self::Room(room) => Some(room),
            _ => None,
        }
    }

    pub fn as_connection(&self) -> Option<&ConnectionController> {
        match self {
            Self::Connection(conn) => Some(conn),
            _ => None,
        }
    }
}

impl From<RoomController> for ActorRef {
    fn from(room: RoomController) -> Self {
        Self::Room(room)
    }
}

impl From<ConnectionController> for ActorRef {
    fn from(conn: ConnectionController) -> Self {
        Self::Connection(conn)
    }
}

/// Registry errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("actor already registered: {0}")]
    Duplicate(ActorId),

    #[error("unknown actor: {0}")]
    Unknown(ActorId),

    #[error("unknown actor type: {0}")]
    UnknownType(String),
}

type ActorMap = HashMap<ActorId, ActorRef>;
type TypeViews = BTreeMap<ActorType, Arc<[ActorRef]>>;

#[derive(Default)]
struct Table {
    actors: Arc<ActorMap>,
    initialized: bool,
}

/// Live, queryable index of actors by id and type.
#[derive(Default)]
pub struct SharedCollection {
    table: RwLock<Table>,
    // Views plus the map they were computed from. Holding the Arc keeps its
    // address from being reused, so pointer equality is a sound identity.
    views: Mutex<Option<(Arc<ActorMap>, TypeViews)>>,
}

impl fmt::Debug for SharedCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.read();
        f.debug_struct("SharedCollection")
            .field("actors", &table.actors.len())
            .field("initialized", &table.initialized)
            .finish()
    }
}

impl SharedCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live actor. Controllers publish their initial state on
    /// spawn, so anything passed here is already fully constructed.
    pub fn register(&self, actor: impl Into<ActorRef>) -> Result<ActorId, RegistryError> {
        let actor = actor.into();
        let id = actor.id();
        let mut table = self.table.write();
        if table.actors.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        let mut next = ActorMap::clone(&table.actors);
        next.insert(id.clone(), actor);
        table.actors = Arc::new(next);
        debug!(actor = %id, "actor registered");
        Ok(id)
    }

    /// Remove an actor.
    pub fn unregister(&self, id: &ActorId) -> Result<ActorRef, RegistryError> {
        let mut table = self.table.write();
        let mut next = ActorMap::clone(&table.actors);
        let actor = next.remove(id).ok_or_else(|| RegistryError::Unknown(id.clone()))?;
        table.actors = Arc::new(next);
        debug!(actor = %id, "actor unregistered");
        Ok(actor)
    }

    pub fn get(&self, id: &ActorId) -> Option<ActorRef> {
        self.table.read().actors.get(id).cloned()
    }

    pub fn contains(&self, id: &ActorId) -> bool {
        self.table.read().actors.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.table.read().actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().actors.is_empty()
    }

    /// Every actor of `actor_type`, ordered by id.
    pub fn get_all_by_type(&self, actor_type: ActorType) -> Arc<[ActorRef]> {
        let actors = Arc::clone(&self.table.read().actors);
        let mut views = self.views.lock();

        let fresh = matches!(&*views, Some((source, _)) if Arc::ptr_eq(source, &actors));
        if !fresh {
            *views = Some((Arc::clone(&actors), Self::compute_views(&actors)));
        }

        views
            .as_ref()
            .and_then(|(_, by_type)| by_type.get(&actor_type).cloned())
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    pub fn rooms(&self) -> Vec<RoomController> {
        self.get_all_by_type(ActorType::Room)
            .iter()
            .filter_map(|a| a.as_room().cloned())
            .collect()
    }

    pub fn connections(&self) -> Vec<ConnectionController> {
        self.get_all_by_type(ActorType::Connection)
            .iter()
            .filter_map(|a| a.as_connection().cloned())
            .collect()
    }

    pub fn room(&self, room_id: &str) -> Option<RoomController> {
        self.get(&ActorId::room(room_id))?.as_room().cloned()
    }

    pub fn connection(&self, entity_id: EntityId) -> Option<ConnectionController> {
        self.get(&ActorId::connection(entity_id))?.as_connection().cloned()
    }

    /// Mark the collection as populated with its first actor set. Readers
    /// that need a complete view wait on this before trusting an empty
    /// lookup.
    pub fn mark_initialized(&self) {
        self.table.write().initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.table.read().initialized
    }

    fn compute_views(actors: &ActorMap) -> TypeViews {
        let mut grouped: BTreeMap<ActorType, Vec<(&ActorId, &ActorRef)>> = BTreeMap::new();
        for (id, actor) in actors {
            // The id prefix decides the type; no lookup into the actor.
            if let Some(actor_type) = id.actor_type() {
                grouped.entry(actor_type).or_default().push((id, actor));
            }
        }
        grouped
            .into_iter()
            .map(|(actor_type, mut entries)| {
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let refs: Vec<ActorRef> = entries.into_iter().map(|(_, a)| a.clone()).collect();
                (actor_type, Arc::from(refs))
            })
            .collect()
    }

    #[cfg(test)]
    fn views_source(&self) -> Option<Arc<ActorMap>> {
        self.views.lock().as_ref().map(|(source, _)| Arc::clone(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::club::{Club, ClubMember};
    use crate::state::room::{RoomOptions, TurnRotation};
    use crate::state::world::World;
    use pretty_assertions::assert_eq;

    fn make_room(world: &World, room_id: &str) -> RoomController {
        let mut club = Club::new("club-1");
        club.add_member(ClubMember::new("u1", "Alice")).unwrap();
        RoomController::create(room_id, &club, TurnRotation::default(), world, RoomOptions::default()).unwrap()
    }

    #[test]
    fn test_actor_id_encodes_type() {
        let id = ActorId::room("abc-123");
        assert_eq!(id.as_str(), "room-abc-123");
        assert_eq!(id.actor_type(), Some(ActorType::Room));
        assert_eq!(id.key(), "abc-123");

        let parsed: ActorId = "connection-42".parse().unwrap();
        assert_eq!(parsed.actor_type(), Some(ActorType::Connection));
        assert!("widget-1".parse::<ActorId>().is_err());
        assert!("nodash".parse::<ActorId>().is_err());
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let world = World::new(0);
        let registry = SharedCollection::new();
        let room = make_room(&world, "r1");

        let id = registry.register(room.clone()).unwrap();
        assert_eq!(id, ActorId::room("r1"));
        assert_eq!(registry.room("r1").unwrap().room_id(), "r1");
        assert!(registry.connection(room.entity_id()).is_none());

        assert_eq!(registry.register(room), Err(RegistryError::Duplicate(id)));
    }

    #[tokio::test]
    async fn test_views_follow_membership() {
        let world = World::new(0);
        let registry = SharedCollection::new();
        registry.register(make_room(&world, "b")).unwrap();
        registry.register(make_room(&world, "a")).unwrap();

        let ids: Vec<String> = registry.rooms().iter().map(|r| r.room_id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(registry.get_all_by_type(ActorType::Connection).is_empty());

        registry.unregister(&ActorId::room("a")).unwrap();
        let ids: Vec<String> = registry.rooms().iter().map(|r| r.room_id().to_string()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn test_views_memoized_until_change() {
        let world = World::new(0);
        let registry = SharedCollection::new();
        registry.register(make_room(&world, "a")).unwrap();

        let first = registry.get_all_by_type(ActorType::Room);
        let second = registry.get_all_by_type(ActorType::Room);
        assert!(Arc::ptr_eq(&first, &second));
        let source = registry.views_source().unwrap();

        registry.register(make_room(&world, "b")).unwrap();
        let third = registry.get_all_by_type(ActorType::Room);
        assert_eq!(third.len(), 2);
        assert!(!Arc::ptr_eq(&source, &registry.views_source().unwrap()));
    }

    #[tokio::test]
    async fn test_initialized_flag() {
        let world = World::new(0);
        let registry = SharedCollection::new();
        assert!(!registry.is_initialized());

        let id = registry.register(make_room(&world, "a")).unwrap();
        registry.mark_initialized();
        assert!(registry.is_initialized());

        registry.unregister(&id).unwrap();
        assert!(registry.is_initialized());
        assert_eq!(registry.unregister(&id).unwrap_err(), RegistryError::Unknown(id));
    }
}
