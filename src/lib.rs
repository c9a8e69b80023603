//! Room Sync Library
//!
//! This crate provides the authoritative state core for real-time
//! multiplayer rooms.
//!
//! # Overview
//!
//! - **Entity World** - Entities are ids plus a fixed-shape set of optional
//!   components. Live indices (e.g. sessions by user id) stay in sync with
//!   every add, remove and component change.
//!
//! - **State Machines** - Every controller is a state vector with orthogonal
//!   regions, driven by one task that processes its mailbox in order. Async
//!   work started by a transition reports back through the same mailbox.
//!
//! - **Connections** - Per-client machines authenticate, link the connection
//!   to a long-lived session, mint device ids and track heartbeat liveness.
//!
//! - **Rooms** - Per-game machines own the roster, phase and game fields, and
//!   push a JSON snapshot to subscribers on every visible change.
//!
//! - **Registry** - Live rooms and connections addressable by id and type.
//!
//! # Design Principles
//!
//! 1. **Machines validate transitions** - Illegal events are rejected with an
//!    `InvalidTransition` and leave state untouched.
//!
//! 2. **One writer per machine** - Events to a machine are handled one at a
//!    time, in arrival order. Machines run concurrently with each other.
//!
//! 3. **No networking** - Transport delivers commands in and snapshots out.
//!
//! 4. **Serialization-ready** - Snapshots and responses serialize to the JSON
//!    clients expect.
//!
//! # Example
//!
//! ```rust,no_run
//! use room_sync::{Club, ClubMember, Config, Hub, InitializeInput, MemoryAuthProvider};
//!
//! # async fn run() -> Result<(), room_sync::HubError> {
//! let hub = Hub::new(Config::default(), MemoryAuthProvider::new());
//!
//! // Attach and initialize a client
//! let conn = hub.connect()?;
//! let response = hub
//!     .initialize(
//!         conn.entity_id(),
//!         InitializeInput {
//!             initial_location: "/".into(),
//!             ..Default::default()
//!         },
//!     )
//!     .await?;
//! println!("device {}", response.device_id);
//!
//! // Spin a room off a club
//! let mut club = Club::new("club-1");
//! club.add_member(ClubMember::new("u1", "Alice")).ok();
//! club.add_member(ClubMember::new("u2", "Bob")).ok();
//! let room = hub.create_room("room-1", &club)?;
//!
//! let mut snapshots = room.subscribe();
//! room.join("u2").await?;
//! let json = snapshots.recv().await.ok();
//! # let _ = json;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod state;

pub use config::{Config, ConfigError};
// Re-export everything from state module at crate root
pub use state::*;
