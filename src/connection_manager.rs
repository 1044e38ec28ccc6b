//! Per-group mesh of peer sessions: dial policy, failure detection,
//! back-off, and the tie-break for simultaneous dials.
//!
//! This struct is deliberately free of any I/O or fabric access: it tracks
//! session state and, given the current time and the group's membership,
//! decides *what* should happen (who to dial, ping, or close). The
//! orchestrator is the one async driver that owns a fabric handle and turns
//! these decisions into actual `connect`/`send`/`close` calls — keeping the
//! policy itself synchronous and trivially unit-testable.
//!
//! One `sessions: HashMap<PeerId, PeerSession>` stands in for what would
//! otherwise be two parallel maps of "open" and "in-flight" connections: a
//! session's own state (`Dialing` vs `Open`) already distinguishes them, so
//! a second map could only ever disagree with the first (see DESIGN.md).

use std::collections::{BTreeSet, HashMap};

use crate::clock::{GroupId, PeerId};
use crate::peer_session::{Direction, PeerSession, SessionState};

const PING_AFTER_MS: i64 = 15_000;
const SESSION_TIMEOUT_MS: i64 = 30_000;
const DIAL_TIMEOUT_MS: i64 = 15_000;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickActions {
    /// Open sessions that have gone quiet long enough to warrant a `PING`.
    pub to_ping: Vec<PeerId>,
    /// Open sessions that exceeded the liveness timeout; already closed.
    pub closed_for_timeout: Vec<PeerId>,
    /// Dialing sessions abandoned after exceeding the dial timeout; already
    /// cleared, free for a retry on this same tick.
    pub abandoned_dials: Vec<PeerId>,
    /// Members that should be dialed this tick (reconnect + newcomers).
    pub to_dial: Vec<PeerId>,
}

/// Result of reconciling an inbound session against whatever this peer
/// already has on file for the same remote. The caller must only rewire its
/// event-stream registration for `remote` in the `Adopted` case — in the
/// `Rejected` case the existing session stays current and its registered
/// stream must be left untouched (see DESIGN.md).
pub enum InboundOutcome {
    /// The incoming session is now current. `previous_to_close` is the prior
    /// open session it replaced, if the simultaneous-dial tie-break went the
    /// incoming session's way.
    Adopted { previous_to_close: Option<PeerSession> },
    /// The incoming session lost the tie-break; the existing session is
    /// untouched and the incoming one must be closed without being adopted.
    Rejected(PeerSession),
}

pub struct ConnectionManager {
    pub group_id: GroupId,
    pub my_peer_id: PeerId,
    sessions: HashMap<PeerId, PeerSession>,
    last_heard_from: HashMap<PeerId, i64>,
}

impl ConnectionManager {
    pub fn new(group_id: GroupId, my_peer_id: PeerId) -> Self {
        ConnectionManager { group_id, my_peer_id, sessions: HashMap::new(), last_heard_from: HashMap::new() }
    }

    pub fn session_state(&self, remote: &PeerId) -> Option<SessionState> {
        self.sessions.get(remote).map(|s| s.state())
    }

    pub fn open_peers(&self) -> Vec<PeerId> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.state() == SessionState::Open)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Single-flight check: a dial is owed to `remote` iff there is neither
    /// an `Open` nor a `Dialing` session to it already.
    pub fn should_dial(&self, remote: &PeerId) -> bool {
        !matches!(self.sessions.get(remote).map(|s| s.state()), Some(SessionState::Open) | Some(SessionState::Dialing))
    }

    /// The live session to `remote`, if any, for sending frames over it.
    pub fn session(&self, remote: &PeerId) -> Option<&PeerSession> {
        self.sessions.get(remote)
    }

    /// Every remote peer id with a session in any state (`Dialing` or
    /// `Open`), for tearing down all of a group's sessions at once.
    pub fn all_peer_ids(&self) -> Vec<PeerId> {
        self.sessions.keys().cloned().collect()
    }

    /// Every known member other than ourselves that is owed a dial right now.
    pub fn peers_needing_dial(&self, known_members: &BTreeSet<PeerId>) -> Vec<PeerId> {
        known_members
            .iter()
            .filter(|peer| **peer != self.my_peer_id)
            .filter(|peer| self.should_dial(peer))
            .cloned()
            .collect()
    }

    /// Record that we are now dialing `remote`. Caller must have checked
    /// `should_dial` (or gone through `peers_needing_dial`) first.
    pub fn begin_dial(&mut self, remote: PeerId, now_ms: i64) {
        self.sessions.insert(remote.clone(), PeerSession::dialing(remote, now_ms));
    }

    /// Our outbound dial to `remote` succeeded.
    pub fn dial_succeeded(&mut self, remote: &PeerId, fabric_session: std::sync::Arc<dyn crate::peer_fabric::FabricSession>, now_ms: i64) {
        if let Some(session) = self.sessions.get_mut(remote) {
            session.mark_open(fabric_session);
        } else {
            // Dialing entry was abandoned/cleared before the dial resolved;
            // still honour the now-open session. We dialed it, so it is
            // outbound, not an inbound accept.
            self.sessions.insert(remote.clone(), PeerSession::opened_by_our_dial(remote.clone(), fabric_session));
        }
        self.last_heard_from.insert(remote.clone(), now_ms);
    }

    /// An inbound session arrived via the endpoint's `connection` event.
    pub fn accept_inbound(
        &mut self,
        remote: PeerId,
        fabric_session: std::sync::Arc<dyn crate::peer_fabric::FabricSession>,
        now_ms: i64,
    ) -> InboundOutcome {
        let incoming = PeerSession::accepted(remote.clone(), fabric_session);
        match self.sessions.get(&remote) {
            Some(existing) if existing.state() == SessionState::Open => {
                if prefer_incoming_on_tie(&self.my_peer_id, &remote, existing.direction(), incoming.direction()) {
                    let previous = self.sessions.insert(remote.clone(), incoming);
                    self.last_heard_from.insert(remote, now_ms);
                    InboundOutcome::Adopted { previous_to_close: previous }
                } else {
                    InboundOutcome::Rejected(incoming)
                }
            }
            _ => {
                self.sessions.insert(remote.clone(), incoming);
                self.last_heard_from.insert(remote, now_ms);
                InboundOutcome::Adopted { previous_to_close: None }
            }
        }
    }

    /// Any frame received from `remote`, including `PONG`, stamps liveness —
    /// a session that's still talking to us, even just replying to pings, is
    /// not a candidate for the timeout sweep.
    pub fn record_heard(&mut self, remote: &PeerId, now_ms: i64) {
        self.last_heard_from.insert(remote.clone(), now_ms);
    }

    pub fn close_session(&mut self, remote: &PeerId) {
        if let Some(mut session) = self.sessions.remove(remote) {
            session.mark_closed();
        }
        self.last_heard_from.remove(remote);
    }

    /// Fabric recovery: the endpoint was destroyed or reported
    /// "disconnected" — tear down everything; the orchestrator recreates the
    /// endpoint on the next tick.
    pub fn clear_all(&mut self) {
        for session in self.sessions.values_mut() {
            session.mark_closed();
        }
        self.sessions.clear();
        self.last_heard_from.clear();
    }

    pub fn forget_peer(&mut self, peer: &PeerId) {
        self.close_session(peer);
    }

    /// The 5s supervisor sweep: ping idle sessions, close dead ones, abandon
    /// stalled dials, and queue reconnects/newcomer dials.
    pub fn on_tick(&mut self, known_members: &BTreeSet<PeerId>, now_ms: i64) -> TickActions {
        let mut actions = TickActions::default();

        let open_peers: Vec<PeerId> = self.open_peers();
        for peer in &open_peers {
            let last = *self.last_heard_from.get(peer).unwrap_or(&now_ms);
            let idle = now_ms - last;
            if idle > SESSION_TIMEOUT_MS {
                log::debug!("group {}: closing {peer} after {idle}ms of silence", self.group_id);
                self.close_session(peer);
                actions.closed_for_timeout.push(peer.clone());
            } else if idle > PING_AFTER_MS {
                actions.to_ping.push(peer.clone());
            }
        }

        let stalled: Vec<PeerId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state() == SessionState::Dialing && now_ms - s.dial_started_at_ms() > DIAL_TIMEOUT_MS)
            .map(|(p, _)| p.clone())
            .collect();
        for peer in stalled {
            log::debug!("group {}: abandoning stalled dial to {peer}", self.group_id);
            self.sessions.remove(&peer);
            actions.abandoned_dials.push(peer);
        }

        actions.to_dial = self.peers_needing_dial(known_members);
        if !actions.to_dial.is_empty() {
            log::debug!("group {}: dialing {:?}", self.group_id, actions.to_dial);
        }
        actions
    }
}

/// Deterministic resolution of the simultaneous-dial duplicate: the session
/// dialed by the peer with the lexicographically larger id survives. Both
/// ends agree because the two sessions' dialers are the two distinct peer
/// ids in the pair — there is no tie to break further.
fn prefer_incoming_on_tie(my_peer_id: &PeerId, remote: &PeerId, existing_direction: Direction, incoming_direction: Direction) -> bool {
    let dialer_of = |direction: Direction| -> &PeerId {
        match direction {
            Direction::Outbound => my_peer_id,
            Direction::Inbound => remote,
        }
    };
    dialer_of(incoming_direction) > dialer_of(existing_direction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_fabric::{FabricError, FabricSession, SessionEvent};
    use crate::wire::Frame;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct NullSession {
        peer: PeerId,
    }

    impl FabricSession for NullSession {
        fn peer(&self) -> &PeerId {
            &self.peer
        }
        fn is_open(&self) -> bool {
            true
        }
        fn send<'a>(&'a self, _frame: &'a Frame) -> crate::peer_fabric::BoxFuture<'a, Result<(), FabricError>> {
            Box::pin(async { Ok(()) })
        }
        fn close(&self) {}
        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
            None
        }
    }

    fn null_session(peer: &str) -> Arc<dyn FabricSession> {
        Arc::new(NullSession { peer: peer.to_string() })
    }

    #[test]
    fn dial_is_owed_for_unknown_member() {
        let cm = ConnectionManager::new("g1".into(), "me".into());
        let members: BTreeSet<PeerId> = ["me".to_string(), "them".to_string()].into_iter().collect();
        assert_eq!(cm.peers_needing_dial(&members), vec!["them".to_string()]);
    }

    #[test]
    fn single_flight_suppresses_redundant_dial() {
        let mut cm = ConnectionManager::new("g1".into(), "me".into());
        cm.begin_dial("them".into(), 0);
        let members: BTreeSet<PeerId> = ["me".to_string(), "them".to_string()].into_iter().collect();
        assert!(cm.peers_needing_dial(&members).is_empty());
    }

    #[test]
    fn tick_pings_after_15s_and_closes_after_30s() {
        let mut cm = ConnectionManager::new("g1".into(), "me".into());
        cm.dial_succeeded(&"them".to_string(), null_session("them"), 0);
        let members: BTreeSet<PeerId> = ["me".to_string(), "them".to_string()].into_iter().collect();

        let actions = cm.on_tick(&members, 16_000);
        assert_eq!(actions.to_ping, vec!["them".to_string()]);
        assert!(actions.closed_for_timeout.is_empty());

        let actions = cm.on_tick(&members, 31_000);
        assert_eq!(actions.closed_for_timeout, vec!["them".to_string()]);
        assert_eq!(cm.session_state(&"them".to_string()), None);
    }

    #[test]
    fn stalled_dial_is_abandoned_and_retried_next_tick() {
        let mut cm = ConnectionManager::new("g1".into(), "me".into());
        cm.begin_dial("them".into(), 0);
        let members: BTreeSet<PeerId> = ["me".to_string(), "them".to_string()].into_iter().collect();

        let actions = cm.on_tick(&members, 16_000);
        assert_eq!(actions.abandoned_dials, vec!["them".to_string()]);
        assert_eq!(actions.to_dial, vec!["them".to_string()]);
    }

    #[test]
    fn tie_break_keeps_session_dialed_by_larger_peer_id() {
        let mut cm = ConnectionManager::new("g1".into(), "a-peer".into());
        // We dialed "z-peer" (outbound, dialer = "a-peer").
        cm.dial_succeeded(&"z-peer".to_string(), null_session("z-peer"), 0);
        // "z-peer" also dialed us (inbound, dialer = "z-peer" > "a-peer").
        let outcome = cm.accept_inbound("z-peer".into(), null_session("z-peer"), 10);
        // The existing outbound session (dialer "a-peer") loses; the incoming
        // (inbound) session is adopted.
        match outcome {
            InboundOutcome::Adopted { previous_to_close } => assert!(previous_to_close.is_some()),
            InboundOutcome::Rejected(_) => panic!("expected the incoming session to be adopted"),
        }
        assert_eq!(cm.sessions.get("z-peer").unwrap().direction(), Direction::Inbound);
    }

    #[test]
    fn tie_break_keeps_existing_when_it_already_has_the_larger_dialer() {
        let mut cm = ConnectionManager::new("g1".into(), "z-peer".into());
        // We (z-peer) dialed "a-peer": dialer = "z-peer".
        cm.dial_succeeded(&"a-peer".to_string(), null_session("a-peer"), 0);
        // "a-peer" also dialed us: inbound, dialer = "a-peer" < "z-peer".
        let outcome = cm.accept_inbound("a-peer".into(), null_session("a-peer"), 10);
        // The existing outbound session (dialer "z-peer") wins; the incoming
        // session is rejected and the existing registration is untouched.
        match outcome {
            InboundOutcome::Rejected(_) => {}
            InboundOutcome::Adopted { .. } => panic!("expected the incoming session to be rejected"),
        }
        assert_eq!(cm.sessions.get("a-peer").unwrap().direction(), Direction::Outbound);
    }

    #[test]
    fn rejected_inbound_session_does_not_adopt_and_leaves_existing_session_registered() {
        // Regression test: a losing inbound session must not be installed
        // into `sessions`, so whatever stream the caller has wired up for
        // the existing (winning) session stays the one in effect.
        let mut cm = ConnectionManager::new("g1".into(), "z-peer".into());
        cm.dial_succeeded(&"a-peer".to_string(), null_session("a-peer"), 0);
        let outcome = cm.accept_inbound("a-peer".into(), null_session("a-peer"), 10);
        let InboundOutcome::Rejected(_) = outcome else { panic!("expected Rejected") };
        // Still exactly the original outbound session, not replaced.
        assert_eq!(cm.session_state(&"a-peer".to_string()), Some(SessionState::Open));
        assert_eq!(cm.sessions.get("a-peer").unwrap().direction(), Direction::Outbound);
    }

    #[test]
    fn dial_resolving_after_its_dialing_entry_was_abandoned_is_still_outbound() {
        // Regression test: a dial that took longer than the dial-timeout has
        // its `Dialing` entry cleared by `on_tick`, but the `connect` call
        // itself can still resolve successfully afterwards. The resulting
        // session was opened by our own dial and must be recorded as
        // Outbound, not mistaken for an inbound accept.
        let mut cm = ConnectionManager::new("g1".into(), "a-peer".into());
        cm.begin_dial("z-peer".into(), 0);
        let members: BTreeSet<PeerId> = ["a-peer".to_string(), "z-peer".to_string()].into_iter().collect();
        cm.on_tick(&members, 16_000); // abandons the stalled dial, clearing the entry
        assert_eq!(cm.session_state(&"z-peer".to_string()), None);

        cm.dial_succeeded(&"z-peer".to_string(), null_session("z-peer"), 16_100);
        assert_eq!(cm.sessions.get("z-peer").unwrap().direction(), Direction::Outbound);

        // With the direction correctly recorded as Outbound, a subsequent
        // simultaneous-dial collision resolves using the real dialer ("a-peer"),
        // not the remote peer id a mislabeled Inbound direction would use.
        let outcome = cm.accept_inbound("z-peer".into(), null_session("z-peer"), 16_200);
        match outcome {
            InboundOutcome::Adopted { previous_to_close } => assert!(previous_to_close.is_some()),
            InboundOutcome::Rejected(_) => panic!("expected the incoming session to be adopted: z-peer > a-peer"),
        }
    }
}
