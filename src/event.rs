//! The atomic unit of replicated state.
//!
//! `type` is a plain string tag rather than a closed Rust enum: the set of
//! event types is open, and an event whose type this node does not
//! recognise must still merge cleanly and round-trip byte-for-byte — it just
//! produces no derived state.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{new_id, Clock, EventId, PeerId};

/// Well-known event type tags. The set is open; `event_type` on [`Event`] is
/// a plain `String` so unrecognised tags still merge and serialise cleanly.
pub mod event_types {
    pub const GROUP_CREATED: &str = "GROUP_CREATED";
    pub const MESSAGE_ADDED: &str = "MESSAGE_ADDED";
    pub const MEMBER_LEFT: &str = "MEMBER_LEFT";
}

/// Bumped only if the payload shape of a known `event_type` changes in a way
/// that isn't forward-compatible. Unknown to old peers via `serde(default)`.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: i64,
    #[serde(rename = "authorPeerId")]
    pub author_peer_id: PeerId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    // Events persisted before schemaVersion existed are assumed to predate
    // any breaking payload change, so they default to the current version.
    CURRENT_SCHEMA_VERSION
}

impl Event {
    /// Construct a new event authored locally, right now.
    pub fn new_local(
        clock: &dyn Clock,
        author_peer_id: PeerId,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Event {
            id: new_id(),
            timestamp: clock.now_ms(),
            author_peer_id,
            event_type: event_type.into(),
            payload,
            schema_version: CURRENT_SCHEMA_VERSION,
        }
    }

    pub fn group_created(clock: &dyn Clock, author_peer_id: PeerId, name: impl Into<String>) -> Self {
        Event::new_local(
            clock,
            author_peer_id,
            event_types::GROUP_CREATED,
            serde_json::json!({ "name": name.into() }),
        )
    }

    pub fn message_added(clock: &dyn Clock, author_peer_id: PeerId, text: impl Into<String>) -> Self {
        Event::new_local(
            clock,
            author_peer_id,
            event_types::MESSAGE_ADDED,
            serde_json::json!({ "text": text.into() }),
        )
    }

    pub fn member_left(clock: &dyn Clock, author_peer_id: PeerId) -> Self {
        Event::new_local(clock, author_peer_id, event_types::MEMBER_LEFT, serde_json::json!({}))
    }

    /// `payload.name` for a `GROUP_CREATED` event; `None` for any other type
    /// or a malformed payload (treated the same as "not this type yet").
    pub fn created_group_name(&self) -> Option<&str> {
        if self.event_type != event_types::GROUP_CREATED {
            return None;
        }
        self.payload.get("name").and_then(Value::as_str)
    }

    /// `payload.text` for a `MESSAGE_ADDED` event.
    pub fn message_text(&self) -> Option<&str> {
        if self.event_type != event_types::MESSAGE_ADDED {
            return None;
        }
        self.payload.get("text").and_then(Value::as_str)
    }
}
