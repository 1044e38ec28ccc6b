//! The wire state machine: on-open sync, broadcast, heartbeat reply, and
//! request/response for missing events.
//!
//! Every function here is pure with respect to one [`Group`] and one
//! incoming [`Frame`] — no fabric access, no clock reads beyond what the
//! caller supplies. The orchestrator is the thing that actually sends the
//! resulting frames and stamps `lastHeardFrom`, which keeps this module
//! trivial to test against scripted frame sequences.

use std::collections::{BTreeSet, HashSet};

use crate::clock::PeerId;
use crate::group::Group;
use crate::wire::Frame;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncOutcome {
    /// Frames to send back over the same session this frame arrived on.
    pub frames_to_send: Vec<Frame>,
    /// Members discovered by this exchange that the connection manager
    /// should now try to dial, rather than waiting for the next supervisor
    /// tick to notice them.
    pub newly_discovered_members: Vec<PeerId>,
}

/// On `opened`, send a `SYNC_REQUEST` listing every local event id.
pub fn build_sync_request(group: &Group) -> Frame {
    Frame::SyncRequest { event_ids: group.event_ids().into_iter().collect() }
}

/// Dispatch one incoming frame against `group`, returning what to send back
/// and who was newly discovered.
pub fn handle_frame(group: &mut Group, frame: Frame) -> SyncOutcome {
    match frame {
        Frame::SyncRequest { event_ids } => handle_sync_request(group, event_ids),
        Frame::SyncResponse { missing_events } => handle_sync_response(group, missing_events),
        Frame::EventBroadcast { event } => handle_event_broadcast(group, event),
        Frame::Ping => SyncOutcome { frames_to_send: vec![Frame::Pong], ..Default::default() },
        Frame::Pong => SyncOutcome::default(),
    }
}

/// Reply with a single `SYNC_RESPONSE` of whatever the requester is missing;
/// silence ("you are up to date") if there is nothing.
fn handle_sync_request(group: &Group, event_ids: Vec<String>) -> SyncOutcome {
    let have: HashSet<String> = event_ids.into_iter().collect();
    let missing = group.missing_relative_to(&have);
    if missing.is_empty() {
        return SyncOutcome::default();
    }
    SyncOutcome {
        frames_to_send: vec![Frame::SyncResponse { missing_events: missing }],
        newly_discovered_members: Vec::new(),
    }
}

/// Merge the events; any newly discovered authors should be dialed.
fn handle_sync_response(group: &mut Group, missing_events: Vec<crate::event::Event>) -> SyncOutcome {
    let before: BTreeSet<PeerId> = group.member_set();
    let received = missing_events.len();
    group.merge_remote(missing_events);
    let after: BTreeSet<PeerId> = group.member_set();
    let newcomers: Vec<PeerId> = after.difference(&before).cloned().collect();
    if !newcomers.is_empty() {
        log::debug!("group {}: sync discovered new members {:?}", group.id, newcomers);
    } else {
        log::trace!("group {}: sync merged {received} event(s)", group.id);
    }
    SyncOutcome { frames_to_send: Vec::new(), newly_discovered_members: newcomers }
}

/// Merge idempotently; never re-broadcast — a broadcast already reaches
/// every peer directly over the mesh, so forwarding it again would flood.
fn handle_event_broadcast(group: &mut Group, event: crate::event::Event) -> SyncOutcome {
    let before: BTreeSet<PeerId> = group.member_set();
    group.merge_remote(vec![event]);
    let after: BTreeSet<PeerId> = group.member_set();
    let newcomers = after.difference(&before).cloned().collect();
    SyncOutcome { frames_to_send: Vec::new(), newly_discovered_members: newcomers }
}
