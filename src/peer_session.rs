//! A single live byte-stream to one remote member of one group.
//!
//! State machine: `Dialing -> Open -> Closed`, `Closed` terminal. The
//! connection manager owns one of these per remote peer id; it is destroyed
//! (dropped) on close, never resurrected — reconnection creates a fresh one.

use std::sync::Arc;

use thiserror::Error;

use crate::clock::PeerId;
use crate::peer_fabric::{FabricError, FabricSession};
use crate::wire::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Dialing,
    Open,
    Closed,
}

/// Which side initiated this session. Used only for the connection
/// manager's simultaneous-dial tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We called `endpoint.connect`.
    Outbound,
    /// The remote peer dialled us; delivered via the endpoint's `connection`
    /// event.
    Inbound,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] FabricError),
}

pub struct PeerSession {
    remote_peer_id: PeerId,
    state: SessionState,
    direction: Direction,
    /// When this session entered `Dialing`, for the connection manager's
    /// 15s dial-timeout check.
    dial_started_at_ms: i64,
    fabric_session: Option<Arc<dyn FabricSession>>,
}

impl PeerSession {
    pub fn dialing(remote_peer_id: PeerId, now_ms: i64) -> Self {
        PeerSession {
            remote_peer_id,
            state: SessionState::Dialing,
            direction: Direction::Outbound,
            dial_started_at_ms: now_ms,
            fabric_session: None,
        }
    }

    /// An inbound session arrives already open (the fabric accepted it).
    pub fn accepted(remote_peer_id: PeerId, fabric_session: Arc<dyn FabricSession>) -> Self {
        PeerSession {
            remote_peer_id,
            state: SessionState::Open,
            direction: Direction::Inbound,
            dial_started_at_ms: 0,
            fabric_session: Some(fabric_session),
        }
    }

    /// Our own outbound dial resolved into an already-open session without
    /// ever passing through a tracked `Dialing` entry (the entry was cleared
    /// by the dial-timeout abandon logic before the `connect` call returned).
    /// Unlike `accepted`, this session was opened by us, not the remote peer.
    pub fn opened_by_our_dial(remote_peer_id: PeerId, fabric_session: Arc<dyn FabricSession>) -> Self {
        PeerSession {
            remote_peer_id,
            state: SessionState::Open,
            direction: Direction::Outbound,
            dial_started_at_ms: 0,
            fabric_session: Some(fabric_session),
        }
    }

    pub fn remote_peer_id(&self) -> &PeerId {
        &self.remote_peer_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn dial_started_at_ms(&self) -> i64 {
        self.dial_started_at_ms
    }

    pub fn mark_open(&mut self, fabric_session: Arc<dyn FabricSession>) {
        self.fabric_session = Some(fabric_session);
        self.state = SessionState::Open;
    }

    /// `Closed` is terminal — calling this again is a no-op.
    pub fn mark_closed(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(session) = &self.fabric_session {
            session.close();
        }
        self.state = SessionState::Closed;
    }

    /// Silently ignored when not `Open` — there is no queue to buffer into
    /// while dialing or after close.
    pub async fn send(&self, frame: &Frame) -> Result<(), SessionError> {
        if self.state != SessionState::Open {
            return Ok(());
        }
        if let Some(session) = &self.fabric_session {
            session.send(frame).await?;
        }
        Ok(())
    }
}
