//! On-the-wire frames exchanged over a peer session.
//!
//! Every frame is a UTF-8 JSON object with a `type` discriminator and a
//! `payload` field, the latter omitted for `PING`/`PONG`. Serialisation only
//! needs to be deterministic enough for debugging — convergence is driven by
//! the event log's own comparator, not by byte-identical wire encoding.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::EventId;
use crate::event::Event;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Frame {
    #[serde(rename = "SYNC_REQUEST")]
    SyncRequest {
        #[serde(rename = "eventIds")]
        event_ids: Vec<EventId>,
    },
    #[serde(rename = "SYNC_RESPONSE")]
    SyncResponse {
        #[serde(rename = "missingEvents")]
        missing_events: Vec<Event>,
    },
    #[serde(rename = "EVENT_BROADCAST")]
    EventBroadcast { event: Event },
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl Frame {
    pub fn to_json(&self) -> String {
        // Every variant is built from already-validated in-memory data, so
        // this cannot fail.
        serde_json::to_string(self).expect("Frame always serialises")
    }

    pub fn from_json(raw: &str) -> Result<Self, WireError> {
        serde_json::from_str(raw).map_err(|e| WireError::Malformed(e.to_string()))
    }
}
