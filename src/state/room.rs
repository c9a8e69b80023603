//! Room state machine.
//!
//! A room is one running game spun off from a club. Its players, scores
//! and game fields live in the machine's context; every change goes through
//! the machine, so phase rules (no joining a finished room, only hosts
//! start) are enforced in one place.
//!
//! # State Diagram
//!
//! ```text
//! Phase region                                   Roster region
//!
//! ┌───────┐ START (host) ┌────────────────────┐  ┌─────────┐   all joined   ┌──────────────┐
//! │ Lobby │─────────────▶│ InProgress.<stage> │  │ Waiting │◀──────────────▶│ AllConnected │
//! └───┬───┘              └─────────┬──────────┘  └─────────┘   someone left └──────────────┘
//!     │ END (host)                 │ END / rules finish
//!     ▼                            ▼
//! ┌──────────────────────────────────┐
//! │             Finished             │
//! └──────────────────────────────────┘
//! ```
//!
//! Each commit writes the room's roster, game fields and `currentStates` onto
//! its world entity from the same state vector it committed, and pushes a JSON snapshot to subscribers when the
//! client-visible view changed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::club::Club;
use super::machine::{region_paths, Machine, MachineError, MachineHandle, Observer, Snapshot, StateVector, Step};
use super::world::{Component, Components, EntityId, Schema, World, WorldError};

/// Default number of rounds for [`TurnRotation`].
pub const DEFAULT_MAX_ROUNDS: u64 = 3;

/// The `Phase` region.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RoomPhase {
    #[default]
    Lobby,
    /// Playing; `stage` is the game rules' own sub-state.
    InProgress { stage: String },
    Finished,
}

impl RoomPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lobby => "Lobby",
            Self::InProgress { .. } => "InProgress",
            Self::Finished => "Finished",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress { .. })
    }
}

/// The `Roster` region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RosterState {
    #[default]
    Waiting,
    AllConnected,
}

impl RosterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::AllConnected => "AllConnected",
        }
    }
}

/// Room state vector.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoomState {
    pub phase: RoomPhase,
    pub roster: RosterState,
}

impl StateVector for RoomState {
    fn paths(&self) -> BTreeSet<String> {
        let phase = match &self.phase {
            RoomPhase::InProgress { stage } => region_paths("Phase", &["InProgress", stage.as_str()]),
            other => region_paths("Phase", &[other.as_str()]),
        };
        phase
            .into_iter()
            .chain(region_paths("Roster", &[self.roster.as_str()]))
            .collect()
    }
}

/// A player in the room. Players are never removed; leaving only clears
/// `connected`, so score and identity survive reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub user_id: String,
    pub name: String,
    pub connected: bool,
    pub score: i64,
    pub turn_order: usize,
}

impl Player {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, turn_order: usize) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            connected: false,
            score: 0,
            turn_order,
        }
    }
}

/// Room machine context.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomContext {
    pub room_id: String,
    pub entity_id: EntityId,
    pub host_user_ids: BTreeSet<String>,
    pub players: BTreeMap<String, Player>,
    /// User ids in turn order.
    pub turn_order: Vec<String>,
    /// Game-specific fields, owned by the rules.
    pub game: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl RoomContext {
    pub fn player(&self, user_id: &str) -> Option<&Player> {
        self.players.get(user_id)
    }

    pub fn player_mut(&mut self, user_id: &str) -> Option<&mut Player> {
        self.players.get_mut(user_id)
    }

    pub fn is_host(&self, user_id: &str) -> bool {
        self.host_user_ids.contains(user_id)
    }

    pub fn connected_count(&self) -> usize {
        self.players.values().filter(|p| p.connected).count()
    }

    fn roster_state(&self) -> RosterState {
        if self.players.values().all(|p| p.connected) {
            RosterState::AllConnected
        } else {
            RosterState::Waiting
        }
    }
}

/// Game-domain commands forwarded from clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameCommandKind {
    Clue,
    Highlight,
    Guess,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameCommand {
    #[serde(rename = "type")]
    pub kind: GameCommandKind,
    pub user_id: String,
    #[serde(default)]
    pub payload: Value,
}

/// Events accepted by a room.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Join { user_id: String },
    Leave { user_id: String },
    Start { user_id: String },
    End { user_id: String },
    Game(GameCommand),
}

/// Game-specific rules plugged into a room.
///
/// Rules work on a scratch copy of the context; if they return an error
/// the copy is thrown away.
pub trait GameRules: Send + Sync + 'static {
    /// Set up game fields and return the first stage.
    fn start(&self, context: &mut RoomContext) -> Result<String, &'static str>;

    /// Apply a command in `stage`. Returns the next stage, or `None` when the
    /// game is over.
    fn apply(
        &self,
        stage: &str,
        command: &GameCommand,
        context: &mut RoomContext,
    ) -> Result<Option<String>, &'static str>;
}

/// Room machine behaviour.
pub struct RoomMachine {
    seed: RoomContext,
    min_players: usize,
    rules: Box<dyn GameRules>,
}

impl Machine for RoomMachine {
    type State = RoomState;
    type Context = RoomContext;
    type Event = RoomEvent;
    type Output = ();
    type Failure = String;

    fn name(&self) -> String {
        format!("room-{}", self.seed.room_id)
    }

    fn initial(&self) -> (RoomState, RoomContext) {
        let state = RoomState {
            phase: RoomPhase::Lobby,
            roster: self.seed.roster_state(),
        };
        (state, self.seed.clone())
    }

    fn on_event(
        &mut self,
        state: &RoomState,
        context: &RoomContext,
        event: RoomEvent,
    ) -> Result<Option<Step<Self>>, &'static str> {
        match event {
            RoomEvent::Join { user_id } => {
                if state.phase == RoomPhase::Finished {
                    return Err("room is finished");
                }
                let player = context.player(&user_id).ok_or("not in roster")?;
                if player.connected {
                    return Ok(None);
                }
                Ok(Some(self.set_connected(state, context, &user_id, true)))
            }

            RoomEvent::Leave { user_id } => {
                let player = context.player(&user_id).ok_or("not in roster")?;
                if !player.connected {
                    return Ok(None);
                }
                Ok(Some(self.set_connected(state, context, &user_id, false)))
            }

            RoomEvent::Start { user_id } => {
                if state.phase != RoomPhase::Lobby {
                    return Err("game already started");
                }
                if !context.is_host(&user_id) {
                    return Err("only a host can start the game");
                }
                if context.connected_count() < self.min_players {
                    return Err("not enough connected players");
                }
                let mut next = context.clone();
                let stage = self.rules.start(&mut next)?;
                next.started_at = Some(Utc::now());
                info!(room = %context.room_id, %stage, "game started");
                Ok(Some(Step::new(
                    RoomState {
                        phase: RoomPhase::InProgress { stage },
                        ..state.clone()
                    },
                    next,
                )))
            }

            RoomEvent::End { user_id } => {
                if state.phase == RoomPhase::Finished {
                    return Err("room is finished");
                }
                if !context.is_host(&user_id) {
                    return Err("only a host can end the game");
                }
                Ok(Some(self.finish(state, context.clone())))
            }

            RoomEvent::Game(command) => {
                let RoomPhase::InProgress { stage } = &state.phase else {
                    return Err("game not in progress");
                };
                if context.player(&command.user_id).is_none() {
                    return Err("not in roster");
                }
                let mut next = context.clone();
                match self.rules.apply(stage, &command, &mut next)? {
                    Some(stage) => Ok(Some(Step::new(
                        RoomState {
                            phase: RoomPhase::InProgress { stage },
                            ..state.clone()
                        },
                        next,
                    ))),
                    None => Ok(Some(self.finish(state, next))),
                }
            }
        }
    }

    fn on_done(&mut self, _state: &RoomState, _context: &RoomContext, _result: Result<(), String>) -> Option<Step<Self>> {
        None
    }
}

impl RoomMachine {
    fn set_connected(&self, state: &RoomState, context: &RoomContext, user_id: &str, connected: bool) -> Step<Self> {
        let mut next = context.clone();
        if let Some(player) = next.player_mut(user_id) {
            player.connected = connected;
            info!(room = %context.room_id, user = user_id, connected, "player presence changed");
        }
        let roster = next.roster_state();
        Step::new(
            RoomState {
                roster,
                ..state.clone()
            },
            next,
        )
    }

    fn finish(&self, state: &RoomState, mut context: RoomContext) -> Step<Self> {
        context.ended_at = Some(Utc::now());
        info!(room = %context.room_id, "game finished");
        Step::new(
            RoomState {
                phase: RoomPhase::Finished,
                ..state.clone()
            },
            context,
        )
    }
}

/// The client-facing view of a room, pushed on every visible change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: String,
    pub version: u64,
    pub phase: String,
    pub host_user_ids: Vec<String>,
    pub players: BTreeMap<String, Player>,
    pub current_states: Vec<String>,
    pub game: Value,
}

impl RoomSnapshot {
    pub fn from_snapshot(snapshot: &Snapshot<RoomMachine>) -> Self {
        let context = &snapshot.context;
        Self {
            room_id: context.room_id.clone(),
            version: snapshot.version,
            phase: snapshot.state.phase.as_str().to_string(),
            host_user_ids: context.host_user_ids.iter().cloned().collect(),
            players: context.players.clone(),
            current_states: snapshot.paths.iter().cloned().collect(),
            game: Value::Object(context.game.clone()),
        }
    }

    /// Equal apart from the version counter.
    pub fn same_view(&self, other: &RoomSnapshot) -> bool {
        self.room_id == other.room_id
            && self.phase == other.phase
            && self.host_user_ids == other.host_user_ids
            && self.players == other.players
            && self.current_states == other.current_states
            && self.game == other.game
    }

    pub fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

/// Room errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error(transparent)]
    Machine(#[from] MachineError),

    #[error(transparent)]
    World(#[from] WorldError),

    #[error("cannot create a room without players")]
    EmptyRoster,
}

impl RoomError {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Machine(MachineError::Rejected(_)))
    }
}

/// Options for [`RoomController::create`].
#[derive(Debug, Clone, Copy)]
pub struct RoomOptions {
    pub mailbox_capacity: usize,
    pub min_players: usize,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
            min_players: 1,
        }
    }
}

/// Controller for one room.
#[derive(Clone)]
pub struct RoomController {
    room_id: String,
    entity_id: EntityId,
    world: World,
    machine: MachineHandle<RoomMachine>,
    snapshots: broadcast::Sender<Arc<str>>,
}

impl fmt::Debug for RoomController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomController")
            .field("room_id", &self.room_id)
            .field("entity_id", &self.entity_id)
            .field("paths", &self.machine.snapshot().paths)
            .finish()
    }
}

impl RoomController {
    /// Create a room from a club's current members. The first member hosts.
    /// The roster is fixed before the machine starts, so it never observes
    /// an empty room.
    pub fn create(
        room_id: impl Into<String>,
        club: &Club,
        rules: impl GameRules,
        world: &World,
        options: RoomOptions,
    ) -> Result<Self, RoomError> {
        let room_id = room_id.into();
        let members = club.members();
        let host = members.first().ok_or(RoomError::EmptyRoster)?;

        let players: BTreeMap<String, Player> = members
            .iter()
            .enumerate()
            .map(|(order, m)| (m.user_id.clone(), Player::new(m.user_id.clone(), m.name.clone(), order)))
            .collect();
        let turn_order = members.iter().map(|m| m.user_id.clone()).collect();

        let entity_id = world.spawn(Components::of(Schema::Room).with(Component::RoomId(room_id.clone())));

        let seed = RoomContext {
            room_id: room_id.clone(),
            entity_id,
            host_user_ids: BTreeSet::from([host.user_id.clone()]),
            players,
            turn_order,
            game: Map::new(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };

        let (snapshots, _) = broadcast::channel(options.mailbox_capacity.max(1));
        let machine = RoomMachine {
            seed,
            min_players: options.min_players,
            rules: Box::new(rules),
        };
        let machine = MachineHandle::spawn_observed(
            machine,
            options.mailbox_capacity,
            Some(snapshot_publisher(snapshots.clone(), world.clone(), entity_id)),
        );
        info!(room = %room_id, players = members.len(), "room created");

        Ok(Self {
            room_id,
            entity_id,
            world: world.clone(),
            machine,
            snapshots,
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn machine(&self) -> &MachineHandle<RoomMachine> {
        &self.machine
    }

    pub fn snapshot(&self) -> Arc<Snapshot<RoomMachine>> {
        self.machine.snapshot()
    }

    /// The current client-facing view.
    pub fn view(&self) -> RoomSnapshot {
        RoomSnapshot::from_snapshot(&self.machine.snapshot())
    }

    /// Receive serialized snapshots as they are pushed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.snapshots.subscribe()
    }

    /// Deliver an event and wait for it to commit.
    pub async fn dispatch(&self, event: RoomEvent) -> Result<RoomSnapshot, RoomError> {
        let snapshot = self.machine.dispatch(event).await?;
        Ok(RoomSnapshot::from_snapshot(&snapshot))
    }

    pub async fn join(&self, user_id: impl Into<String>) -> Result<RoomSnapshot, RoomError> {
        self.dispatch(RoomEvent::Join {
            user_id: user_id.into(),
        })
        .await
    }

    pub async fn leave(&self, user_id: impl Into<String>) -> Result<RoomSnapshot, RoomError> {
        self.dispatch(RoomEvent::Leave {
            user_id: user_id.into(),
        })
        .await
    }

    pub async fn start(&self, user_id: impl Into<String>) -> Result<RoomSnapshot, RoomError> {
        self.dispatch(RoomEvent::Start {
            user_id: user_id.into(),
        })
        .await
    }

    pub async fn end(&self, user_id: impl Into<String>) -> Result<RoomSnapshot, RoomError> {
        self.dispatch(RoomEvent::End {
            user_id: user_id.into(),
        })
        .await
    }

    /// Forward a game command verbatim.
    pub async fn command(&self, command: GameCommand) -> Result<RoomSnapshot, RoomError> {
        self.dispatch(RoomEvent::Game(command)).await
    }

    /// Stop the room's machine and remove its entity.
    pub async fn dispose(&self) -> Result<(), RoomError> {
        self.machine.stop().await;
        self.world.remove(self.entity_id)?;
        info!(room = %self.room_id, "room disposed");
        Ok(())
    }
}

fn room_components(snapshot: &Snapshot<RoomMachine>) -> [Component; 4] {
    let context = &snapshot.context;
    [
        Component::HostUserIds(context.host_user_ids.clone()),
        Component::Players(context.players.clone()),
        Component::CurrentStates(snapshot.paths.clone()),
        Component::Game(context.game.clone()),
    ]
}

fn snapshot_publisher(sender: broadcast::Sender<Arc<str>>, world: World, entity_id: EntityId) -> Observer<RoomMachine> {
    let last: Mutex<Option<RoomSnapshot>> = Mutex::new(None);
    Box::new(move |snapshot: &Snapshot<RoomMachine>| {
        if let Err(err) = world.add_components(entity_id, room_components(snapshot)) {
            warn!(room = %snapshot.context.room_id, error = %err, "failed to update room entity");
        }

        let view = RoomSnapshot::from_snapshot(snapshot);
        let mut last = last.lock();
        if last.as_ref().is_some_and(|prev| prev.same_view(&view)) {
            return;
        }
        match serde_json::to_string(&view) {
            Ok(json) => {
                // No subscribers is not an error.
                let _ = sender.send(Arc::from(json));
                *last = Some(view);
            }
            Err(err) => warn!(room = %view.room_id, error = %err, "failed to serialize room snapshot"),
        }
    })
}

/// Rotating clue-giver rules.
///
/// Each turn one player gives a clue, the others highlight and guess, and
/// the clue giver continues to the next turn. A correct guess scores for
/// both guesser and clue giver. After every player has given a clue the
/// round advances; the game ends after `max_rounds`.
///
/// Stages: `AwaitingClue` → `Guessing` → `Reveal`.
#[derive(Debug, Clone)]
pub struct TurnRotation {
    pub max_rounds: u64,
}

impl Default for TurnRotation {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }
}

const AWAITING_CLUE: &str = "AwaitingClue";
const GUESSING: &str = "Guessing";
const REVEAL: &str = "Reveal";

impl TurnRotation {
    fn clue_giver(context: &RoomContext) -> Option<&str> {
        context.game.get("clueGiver").and_then(Value::as_str)
    }

    fn reset_turn(context: &mut RoomContext, clue_giver: &str) {
        context.game.insert("clueGiver".into(), Value::from(clue_giver));
        context.game.insert("clue".into(), Value::Null);
        context.game.insert("highlighted".into(), Value::Array(Vec::new()));
        context.game.insert("guesses".into(), Value::Object(Map::new()));
    }

    fn add_score(context: &mut RoomContext, user_id: &str, points: i64) {
        if let Some(player) = context.player_mut(user_id) {
            player.score += points;
        }
    }
}

impl GameRules for TurnRotation {
    fn start(&self, context: &mut RoomContext) -> Result<String, &'static str> {
        let first = context.turn_order.first().cloned().ok_or("no players")?;
        context.game.insert("round".into(), Value::from(1u64));
        context.game.insert("maxRounds".into(), Value::from(self.max_rounds));
        Self::reset_turn(context, &first);
        Ok(AWAITING_CLUE.to_string())
    }

    fn apply(
        &self,
        stage: &str,
        command: &GameCommand,
        context: &mut RoomContext,
    ) -> Result<Option<String>, &'static str> {
        let clue_giver = Self::clue_giver(context).ok_or("no clue giver")?.to_string();
        let is_clue_giver = command.user_id == clue_giver;

        match (command.kind, stage) {
            (GameCommandKind::Clue, AWAITING_CLUE) => {
                if !is_clue_giver {
                    return Err("only the clue giver may give a clue");
                }
                let word = command
                    .payload
                    .get("word")
                    .and_then(Value::as_str)
                    .filter(|w| !w.trim().is_empty())
                    .ok_or("clue requires a word")?;
                context.game.insert("clue".into(), Value::from(word));
                Ok(Some(GUESSING.to_string()))
            }

            (GameCommandKind::Highlight, GUESSING) => {
                if is_clue_giver {
                    return Err("the clue giver cannot highlight");
                }
                let target = command
                    .payload
                    .get("target")
                    .and_then(Value::as_str)
                    .ok_or("highlight requires a target")?
                    .to_string();
                if let Some(Value::Array(list)) = context.game.get_mut("highlighted") {
                    let existing = list.iter().position(|v| v.as_str() == Some(target.as_str()));
                    match existing {
                        Some(i) => {
                            list.remove(i);
                        }
                        None => list.push(Value::from(target)),
                    }
                }
                Ok(Some(GUESSING.to_string()))
            }

            (GameCommandKind::Guess, GUESSING) => {
                if is_clue_giver {
                    return Err("the clue giver cannot guess");
                }
                let correct = command
                    .payload
                    .get("correct")
                    .and_then(Value::as_bool)
                    .ok_or("guess requires a verdict")?;
                if let Some(Value::Object(guesses)) = context.game.get_mut("guesses") {
                    guesses.insert(command.user_id.clone(), Value::from(correct));
                }
                if correct {
                    Self::add_score(context, &command.user_id, 1);
                    Self::add_score(context, &clue_giver, 1);
                    Ok(Some(REVEAL.to_string()))
                } else {
                    Ok(Some(GUESSING.to_string()))
                }
            }

            (GameCommandKind::Continue, GUESSING | REVEAL) => {
                if !is_clue_giver {
                    return Err("only the clue giver may continue");
                }
                let position = context
                    .turn_order
                    .iter()
                    .position(|u| *u == clue_giver)
                    .ok_or("clue giver left the roster")?;
                let next = (position + 1) % context.turn_order.len();

                let mut round = context.game.get("round").and_then(Value::as_u64).unwrap_or(1);
                if next == 0 {
                    round += 1;
                }
                if round > self.max_rounds {
                    return Ok(None);
                }
                let next_giver = context.turn_order[next].clone();
                context.game.insert("round".into(), Value::from(round));
                Self::reset_turn(context, &next_giver);
                Ok(Some(AWAITING_CLUE.to_string()))
            }

            _ => Err("command not valid in this stage"),
        }
    }
}
