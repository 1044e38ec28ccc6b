//! Append-only ordered sequence of [`Event`]s with dedup and deterministic sort.
//!
//! The sort comparator — `(timestamp, authorPeerId)` ascending, `id` as a
//! final deterministic tiebreaker — is the sole total-order rule in the
//! system. It must stay byte-identical across every node for the convergence
//! guarantee to hold; do not change it without a matching change on every
//! peer.

use std::collections::HashSet;

use serde::de::{Deserialize, Deserializer};
use serde::Serialize;

use crate::clock::EventId;
use crate::event::Event;

fn sort_key(e: &Event) -> (i64, &str, &str) {
    (e.timestamp, e.author_peer_id.as_str(), e.id.as_str())
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct EventLog {
    events: Vec<Event>,
}

/// Deserializes through `from_events` rather than trusting the stored list's
/// order and uniqueness outright — a blob written by a future version of
/// this comparator, or recovered from a partial write, should still come
/// back sorted and deduplicated rather than silently violating I1/I2.
impl<'de> Deserialize<'de> for EventLog {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        struct Repr {
            events: Vec<Event>,
        }
        let repr = Repr::deserialize(deserializer)?;
        Ok(EventLog::from_events(repr.events))
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Rebuild a log from a persisted event list, re-establishing sort order.
    /// Tolerates an out-of-order or duplicate-laden list (e.g. hand-edited
    /// persistence) by reinserting through `insert` rather than trusting it.
    /// This is also what `EventLog`'s own `Deserialize` impl calls, so every
    /// load path gets the same re-sort/dedup guarantee, not just callers who
    /// remember to ask for it.
    pub fn from_events(events: Vec<Event>) -> Self {
        let mut log = Self::new();
        for e in events {
            log.insert(e);
        }
        log
    }

    /// Idempotent insert: a no-op if `event.id` already exists. Otherwise
    /// placed so invariant I1 (sorted order) holds. Returns `true` iff the
    /// event was newly inserted.
    pub fn insert(&mut self, event: Event) -> bool {
        if self.contains(&event.id) {
            return false;
        }
        let pos = self
            .events
            .partition_point(|existing| sort_key(existing) <= sort_key(&event));
        self.events.insert(pos, event);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.events.iter().any(|e| e.id == id)
    }

    /// Every local event whose id is not in `ids`, preserving sort order.
    pub fn missing_relative_to(&self, ids: &HashSet<EventId>) -> Vec<Event> {
        self.events
            .iter()
            .filter(|e| !ids.contains(&e.id))
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn ids(&self) -> HashSet<EventId> {
        self.events.iter().map(|e| e.id.clone()).collect()
    }

    /// Remove every event authored by `peer_id`, preserving relative order of
    /// the remainder. Used by `Group::forget`.
    pub fn remove_author(&mut self, peer_id: &str) {
        self.events.retain(|e| e.author_peer_id != peer_id);
    }
}
