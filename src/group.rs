//! Group replica: owns the event log and the membership/name derived from it.
//!
//! Runtime-only state — the fabric endpoint, open sessions, in-flight dials,
//! liveness timestamps — deliberately does *not* live on this struct. `Group`
//! is exactly what gets persisted; [`crate::connection_manager`] and
//! [`crate::orchestrator`] own the mesh around it instead, keyed by the same
//! `GroupId`, so a plain `Serialize`/`Deserialize` derive here never has to
//! reckon with a live fabric handle or session map (see DESIGN.md).

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{Clock, EventId, GroupId, PeerId};
use crate::event::{event_types, Event};
use crate::event_log::EventLog;

pub const PLACEHOLDER_NAME: &str = "Joining…";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    #[serde(rename = "myPeerId")]
    pub my_peer_id: PeerId,
    pub events: EventLog,
    /// Peer ids purged by a local `forget`. Persisted alongside the log so
    /// the blacklist survives a restart — see DESIGN.md's "forget-then-re-sync"
    /// decision (option a: blacklist re-delivery).
    #[serde(default)]
    forgotten: HashSet<PeerId>,
}

impl Group {
    /// `CREATE`: fresh ids, emits the genesis `GROUP_CREATED` event.
    pub fn create(clock: &dyn Clock, id: GroupId, my_peer_id: PeerId, name: impl Into<String>) -> Self {
        let name = name.into();
        let mut events = EventLog::new();
        events.insert(Event::group_created(clock, my_peer_id.clone(), name.clone()));
        Group { id, name, my_peer_id, events, forgotten: HashSet::new() }
    }

    /// `JOIN`: fresh `myPeerId`, empty log, placeholder name.
    pub fn join(id: GroupId, my_peer_id: PeerId) -> Self {
        Group {
            id,
            name: PLACEHOLDER_NAME.to_string(),
            my_peer_id,
            events: EventLog::new(),
            forgotten: HashSet::new(),
        }
    }

    /// Construct an event authored by this node right now, insert it, and
    /// return it so the caller can broadcast it.
    pub fn append_local(&mut self, clock: &dyn Clock, event_type: impl Into<String>, payload: Value) -> Event {
        let event = Event::new_local(clock, self.my_peer_id.clone(), event_type, payload);
        let inserted = self.events.insert(event.clone());
        debug_assert!(inserted, "freshly generated id collided");
        event
    }

    /// Insert each event idempotently, dropping any authored by a forgotten
    /// peer. Returns the subset that were newly merged. Finalises the
    /// placeholder name the first time a `GROUP_CREATED` event arrives.
    pub fn merge_remote(&mut self, events: impl IntoIterator<Item = Event>) -> Vec<Event> {
        let mut merged = Vec::new();
        for event in events {
            if self.forgotten.contains(&event.author_peer_id) {
                continue;
            }
            if self.events.insert(event.clone()) {
                merged.push(event);
            }
        }
        self.finalize_name_if_needed();
        merged
    }

    fn finalize_name_if_needed(&mut self) {
        if self.name != PLACEHOLDER_NAME {
            return;
        }
        if let Some(created) = self
            .events
            .iter()
            .find(|e| e.event_type == event_types::GROUP_CREATED)
        {
            if let Some(name) = created.created_group_name() {
                self.name = name.to_string();
            }
        }
    }

    /// Purely local: removes every event authored by `peer_id` and
    /// blacklists the id so anti-entropy does not re-introduce them (see
    /// DESIGN.md's resolution of the forget-then-re-sync open question).
    /// Not broadcast.
    pub fn forget(&mut self, peer_id: &PeerId) {
        self.events.remove_author(peer_id);
        self.forgotten.insert(peer_id.clone());
    }

    /// Distinct `authorPeerId` values currently appearing in the log.
    pub fn member_set(&self) -> BTreeSet<PeerId> {
        self.events.iter().map(|e| e.author_peer_id.clone()).collect()
    }

    pub fn name_from_log(&self) -> &str {
        &self.name
    }

    pub fn event_ids(&self) -> HashSet<EventId> {
        self.events.ids()
    }

    /// Every local event whose id is not in `ids`, in sort order.
    pub fn missing_relative_to(&self, ids: &HashSet<EventId>) -> Vec<Event> {
        self.events.missing_relative_to(ids)
    }

    pub fn genesis_event(&self) -> Option<&Event> {
        self.events.iter().find(|e| e.event_type == event_types::GROUP_CREATED)
    }

    /// Every event in the log, in sort order — the basis for derived views
    /// like the chat transcript.
    pub fn iter_events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }
}
