//! Offline-first, peer-to-peer group collaboration core.
//!
//! A group is a replicated, append-only event log. Members connect directly
//! to one another over an abstract peer fabric ([`peer_fabric`]), gossip
//! their events ([`sync_protocol`]), and converge on the same state by
//! applying one deterministic sort to whatever they have ([`event_log`]) —
//! no server, no leader, no consensus round. [`orchestrator::Node`] is the
//! library's single entry point: it owns every group's replica and mesh
//! behind one node-wide mailbox loop and exposes an async command surface
//! for a host application to drive.

pub mod clock;
pub mod connection_manager;
pub mod event;
pub mod event_log;
pub mod group;
pub mod invite;
pub mod mock_fabric;
pub mod orchestrator;
pub mod peer_fabric;
pub mod peer_session;
pub mod persistence;
pub mod sync_protocol;
pub mod wire;

pub use clock::{Clock, EventId, GroupId, PeerId, SystemClock};
pub use event::Event;
pub use group::Group;
pub use invite::{Invite, InviteError};
pub use orchestrator::{ChatMessage, Node, OrchestratorError};
pub use peer_fabric::{EndpointEvent, FabricConfig, FabricError, FabricFactory, FabricSession, IceServer, PeerFabric, SessionEvent};
pub use peer_session::{Direction, PeerSession, SessionState};
pub use persistence::{AppState, BlobStore, PersistenceAdapter, PersistenceError};
pub use wire::{Frame, WireError};
