//! The peer fabric: the signaling/NAT-traversal transport, consumed as an
//! abstract `{listen, dial, close}` interface. Out of scope for the core
//! itself — this module only defines the contract and the event/frame shapes
//! every implementation must honour. A real fabric (WebRTC DataChannel +
//! signaling, QUIC + relay, WebSocket broker) lives outside this crate;
//! [`crate::mock_fabric`] is an in-memory double used by this crate's own
//! tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::clock::PeerId;
use crate::wire::Frame;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error, Clone)]
#[error("fabric error: {0}")]
pub struct FabricError(pub String);

/// ICE servers plus a debug verbosity knob. Opaque to the core beyond being
/// passed through to `createEndpoint`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FabricConfig {
    #[serde(rename = "iceServers", default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(rename = "debugLevel", default)]
    pub debug_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Events an endpoint emits, corresponding to `endpoint.on(...)` on the
/// underlying transport.
#[derive(Debug)]
pub enum EndpointEvent {
    /// The endpoint is ready and listening under its own peer id.
    Open,
    /// A remote peer dialled us.
    Connection(Arc<dyn FabricSession>),
    Error(String),
    Disconnected,
    Close,
}

/// Events a session emits, corresponding to `session.on(...)` on the
/// underlying transport.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Open,
    Data(Frame),
    Close,
    Error(String),
}

/// One endpoint for one group, bound to this node's `myPeerId` within that
/// group — a session opened on one group's endpoint never carries another
/// group's traffic.
pub trait PeerFabric: Send + Sync {
    /// `endpoint.connect(remotePeerId, {reliable: true})`.
    fn connect<'a>(&'a self, remote_peer_id: &'a PeerId) -> BoxFuture<'a, Result<Arc<dyn FabricSession>, FabricError>>;

    /// `endpoint.destroy()`.
    fn destroy(&self);

    /// `endpoint.destroyed`.
    fn is_destroyed(&self) -> bool;

    /// Endpoint event stream. Consumed exactly once by the connection
    /// manager that owns this endpoint.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EndpointEvent>>;
}

/// One live reliable byte-stream session to one remote peer.
pub trait FabricSession: Send + Sync {
    fn peer(&self) -> &PeerId;

    /// `session.open`.
    fn is_open(&self) -> bool;

    /// `session.send(frame)`; at-least-once delivery while open, silently a
    /// no-op otherwise — implementations should still surface transport-level
    /// failures as `Err` so the connection manager can tear the session down.
    fn send<'a>(&'a self, frame: &'a Frame) -> BoxFuture<'a, Result<(), FabricError>>;

    /// `session.close()`.
    fn close(&self);

    /// Session event stream. Consumed exactly once by whoever registers the
    /// session with a group's connection manager.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>>;
}

/// `createEndpoint(peerId, config) → endpoint`, abstracted so the core does
/// not depend on any one concrete transport.
pub trait FabricFactory: Send + Sync {
    fn create_endpoint<'a>(
        &'a self,
        peer_id: &'a PeerId,
        config: &'a FabricConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn PeerFabric>, FabricError>>;
}
