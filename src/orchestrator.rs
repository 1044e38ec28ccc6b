//! Node orchestrator: lifecycle of the group set and the library's public
//! surface.
//!
//! All core state — every group's replica, connections, and fabric endpoint
//! — lives inside one task spawned by [`Node::spawn`] and is only ever
//! touched from that task's single `select!` loop, a single executor/mailbox
//! so no two commands can race on the same group's state.
//! [`Node`] itself is just a cheap handle: every public method sends a
//! [`Command`] down a channel and awaits the reply.
//!
//! Endpoint creation and dialing are genuinely slow, unbounded I/O (real NAT
//! traversal can take seconds), so neither is awaited inline in the mailbox
//! loop — that would stall every other group sharing it. Both are spawned as
//! their own tasks that report back through the same command channel, the
//! mailbox loop's only point of re-entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{StreamExt, StreamMap};

use crate::clock::{new_id, Clock, EventId, GroupId, PeerId, SystemClock};
use crate::connection_manager::{ConnectionManager, InboundOutcome};
use crate::event::Event;
use crate::group::Group;
use crate::invite::{Invite, InviteError};
use crate::peer_fabric::{EndpointEvent, FabricConfig, FabricError, FabricFactory, FabricSession, PeerFabric, SessionEvent};
use crate::persistence::{AppState, BlobStore, PersistenceAdapter};
use crate::sync_protocol;
use crate::wire::Frame;

/// Grace between `leaveGroup`'s best-effort `MEMBER_LEFT` broadcast and
/// actually tearing the endpoint down, giving the send a window to actually
/// reach peers before the transport underneath it disappears.
const LEAVE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("node is shutting down")]
    Shutdown,
    #[error(transparent)]
    InvalidInvite(#[from] InviteError),
}

impl<T> From<mpsc::error::SendError<T>> for OrchestratorError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        OrchestratorError::Shutdown
    }
}

impl From<oneshot::error::RecvError> for OrchestratorError {
    fn from(_: oneshot::error::RecvError) -> Self {
        OrchestratorError::Shutdown
    }
}

/// Derived chat view of a `MESSAGE_ADDED` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: EventId,
    pub author: String,
    pub text: String,
    pub timestamp: i64,
}

struct GroupRuntime {
    group: Group,
    conn: ConnectionManager,
    endpoint: Option<Arc<dyn PeerFabric>>,
    /// Set while a `spawn_endpoint_create` call for this group hasn't
    /// resolved yet, so the supervisor tick doesn't mistake "still being
    /// created" for "needs recreating" and fire off a duplicate create on
    /// every 5s sweep until it resolves.
    endpoint_pending: bool,
    /// The inviter's peer id, for a freshly joined group whose own event log
    /// is still empty. `peers_needing_dial` only ever looks at
    /// `group.member_set()`, which this node can't derive from its own log
    /// until it has synced with someone — so the very first dial has to be
    /// seeded from the invite directly, once the endpoint exists to dial on.
    pending_dial: Option<PeerId>,
}

struct NodeState {
    groups: HashMap<GroupId, GroupRuntime>,
    active_group_id: Option<GroupId>,
}

enum Command {
    CreateGroup { name: String, reply: oneshot::Sender<GroupId> },
    JoinGroup { invite: Invite, reply: oneshot::Sender<GroupId> },
    LeaveGroup { group_id: GroupId, reply: oneshot::Sender<()> },
    /// Fires ~500 ms after `LeaveGroup`'s best-effort `MEMBER_LEFT` send, to
    /// actually tear down the endpoint and purge the replica.
    FinishLeaveGroup { group_id: GroupId, reply: oneshot::Sender<()> },
    SetActiveGroup { group_id: GroupId, reply: oneshot::Sender<()> },
    ForgetMember { group_id: GroupId, peer_id: PeerId, reply: oneshot::Sender<()> },
    AppendLocal { group_id: GroupId, event_type: String, payload: Value, reply: oneshot::Sender<Option<Event>> },
    ChatMessages { group_id: GroupId, reply: oneshot::Sender<Vec<ChatMessage>> },
    Members { group_id: GroupId, reply: oneshot::Sender<Vec<PeerId>> },
    Groups { reply: oneshot::Sender<Vec<Group>> },
    ActiveGroupId { reply: oneshot::Sender<Option<GroupId>> },
    /// A background `create_endpoint` call finished.
    EndpointCreated { group_id: GroupId, result: Result<Arc<dyn PeerFabric>, FabricError> },
    /// A background `connect` call finished.
    DialResolved { group_id: GroupId, peer: PeerId, result: Result<Arc<dyn FabricSession>, FabricError> },
}

/// A cheap, cloneable handle to a running node. The actual state lives in
/// the background task started by [`Node::spawn`].
#[derive(Clone)]
pub struct Node {
    cmd_tx: mpsc::Sender<Command>,
}

impl Node {
    /// `initialize()`: loads persisted state, instantiates each group with
    /// its stored log, starts each group's fabric endpoint, and starts the
    /// 5s supervisor tick — all inside the spawned task.
    pub fn spawn<F, B>(factory: Arc<F>, persistence: Arc<PersistenceAdapter<B>>, fabric_config: FabricConfig) -> Node
    where
        F: FabricFactory + 'static,
        B: BlobStore + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        tokio::spawn(run(cmd_tx.clone(), cmd_rx, factory, persistence, fabric_config));
        Node { cmd_tx }
    }

    pub async fn create_group(&self, name: impl Into<String>) -> Result<GroupId, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::CreateGroup { name: name.into(), reply }).await?;
        Ok(rx.await?)
    }

    /// Parses the invite synchronously; fails with no state change on a
    /// malformed code.
    pub async fn join_group(&self, invite_code: &str) -> Result<GroupId, OrchestratorError> {
        let invite = Invite::decode(invite_code)?;
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::JoinGroup { invite, reply }).await?;
        Ok(rx.await?)
    }

    pub async fn leave_group(&self, group_id: GroupId) -> Result<(), OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::LeaveGroup { group_id, reply }).await?;
        Ok(rx.await?)
    }

    pub async fn set_active_group(&self, group_id: GroupId) -> Result<(), OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::SetActiveGroup { group_id, reply }).await?;
        Ok(rx.await?)
    }

    pub async fn forget_member(&self, group_id: GroupId, peer_id: PeerId) -> Result<(), OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::ForgetMember { group_id, peer_id, reply }).await?;
        Ok(rx.await?)
    }

    pub async fn send_message(&self, group_id: GroupId, text: impl Into<String>) -> Result<Option<Event>, OrchestratorError> {
        self.append_local(group_id, crate::event::event_types::MESSAGE_ADDED, serde_json::json!({ "text": text.into() })).await
    }

    pub async fn append_local(
        &self,
        group_id: GroupId,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Result<Option<Event>, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AppendLocal { group_id, event_type: event_type.into(), payload, reply })
            .await?;
        Ok(rx.await?)
    }

    pub async fn chat_messages(&self, group_id: GroupId) -> Result<Vec<ChatMessage>, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::ChatMessages { group_id, reply }).await?;
        Ok(rx.await?)
    }

    pub async fn members(&self, group_id: GroupId) -> Result<Vec<PeerId>, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Members { group_id, reply }).await?;
        Ok(rx.await?)
    }

    pub async fn groups(&self) -> Result<Vec<Group>, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Groups { reply }).await?;
        Ok(rx.await?)
    }

    pub async fn active_group_id(&self) -> Result<Option<GroupId>, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::ActiveGroupId { reply }).await?;
        Ok(rx.await?)
    }
}

type EndpointEvents = StreamMap<GroupId, UnboundedReceiverStream<EndpointEvent>>;
type SessionEvents = StreamMap<(GroupId, PeerId), UnboundedReceiverStream<SessionEvent>>;

async fn run<F, B>(
    cmd_tx: mpsc::Sender<Command>,
    mut cmd_rx: mpsc::Receiver<Command>,
    factory: Arc<F>,
    persistence: Arc<PersistenceAdapter<B>>,
    fabric_config: FabricConfig,
) where
    F: FabricFactory + 'static,
    B: BlobStore + 'static,
{
    let clock = SystemClock;
    let mut endpoint_events: EndpointEvents = StreamMap::new();
    let mut session_events: SessionEvents = StreamMap::new();

    let mut state = NodeState { groups: HashMap::new(), active_group_id: None };
    let loaded = persistence.load().await;
    state.active_group_id = loaded.active_group_id;
    for (group_id, group) in loaded.groups {
        let conn = ConnectionManager::new(group_id.clone(), group.my_peer_id.clone());
        let my_peer_id = group.my_peer_id.clone();
        state.groups.insert(group_id.clone(), GroupRuntime { group, conn, endpoint: None, endpoint_pending: true, pending_dial: None });
        spawn_endpoint_create(cmd_tx.clone(), factory.clone(), fabric_config.clone(), group_id, my_peer_id);
    }

    let mut tick = tokio::time::interval(Duration::from_secs(5));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_cmd = cmd_rx.recv() => {
                match maybe_cmd {
                    Some(cmd) => {
                        handle_command(&mut state, &cmd_tx, &factory, &persistence, &fabric_config, &clock, cmd, &mut endpoint_events, &mut session_events).await;
                    }
                    None => break,
                }
            }
            Some((group_id, event)) = endpoint_events.next() => {
                handle_endpoint_event(&mut state, &cmd_tx, &clock, group_id, event, &mut session_events).await;
            }
            Some(((group_id, peer_id), event)) = session_events.next() => {
                let is_data = matches!(event, SessionEvent::Data(_));
                let newcomers = handle_session_event(&mut state, &clock, &group_id, &peer_id, event).await;
                for newcomer in newcomers {
                    if let Some(runtime) = state.groups.get_mut(&group_id) {
                        dial_peer(runtime, &cmd_tx, &group_id, newcomer, clock.now_ms());
                    }
                }
                if is_data {
                    persist(&persistence, &state).await;
                }
            }
            _ = tick.tick() => {
                supervisor_tick(&mut state, &cmd_tx, &factory, &fabric_config, &clock).await;
            }
        }
    }
}

/// `createEndpoint(peerId, config)`, run off the mailbox loop; the result
/// comes back as a [`Command::EndpointCreated`].
fn spawn_endpoint_create<F: FabricFactory + 'static>(
    cmd_tx: mpsc::Sender<Command>,
    factory: Arc<F>,
    fabric_config: FabricConfig,
    group_id: GroupId,
    my_peer_id: PeerId,
) {
    tokio::spawn(async move {
        let result = factory.create_endpoint(&my_peer_id, &fabric_config).await;
        let _ = cmd_tx.send(Command::EndpointCreated { group_id, result }).await;
    });
}

/// `endpoint.connect(remotePeerId)`, run off the mailbox loop; the result
/// comes back as a [`Command::DialResolved`].
fn spawn_dial(cmd_tx: mpsc::Sender<Command>, endpoint: Arc<dyn PeerFabric>, group_id: GroupId, peer: PeerId) {
    tokio::spawn(async move {
        let result = endpoint.connect(&peer).await;
        let _ = cmd_tx.send(Command::DialResolved { group_id, peer, result }).await;
    });
}

/// Single-flight dial: marks `peer` as `Dialing` synchronously (so a second
/// call this same tick is a no-op) and hands the actual `connect` off to a
/// background task.
fn dial_peer(runtime: &mut GroupRuntime, cmd_tx: &mpsc::Sender<Command>, group_id: &GroupId, peer: PeerId, now_ms: i64) {
    if !runtime.conn.should_dial(&peer) {
        return;
    }
    let Some(endpoint) = runtime.endpoint.clone() else { return };
    runtime.conn.begin_dial(peer.clone(), now_ms);
    spawn_dial(cmd_tx.clone(), endpoint, group_id.clone(), peer);
}

async fn send_frame(runtime: &GroupRuntime, peer_id: &PeerId, frame: &Frame) {
    if let Some(session) = runtime.conn.session(peer_id) {
        let _ = session.send(frame).await;
    }
}

async fn handle_endpoint_event(
    state: &mut NodeState,
    cmd_tx: &mpsc::Sender<Command>,
    clock: &dyn Clock,
    group_id: GroupId,
    event: EndpointEvent,
    session_events: &mut SessionEvents,
) {
    let Some(runtime) = state.groups.get_mut(&group_id) else { return };
    match event {
        EndpointEvent::Open => {
            let members = runtime.group.member_set();
            let to_dial = runtime.conn.peers_needing_dial(&members);
            let now = clock.now_ms();
            for peer in to_dial {
                dial_peer(runtime, cmd_tx, &group_id, peer, now);
            }
        }
        EndpointEvent::Connection(fabric_session) => {
            let remote = fabric_session.peer().clone();
            // Taken up front but only wired into `session_events` once we
            // know the incoming session actually becomes the current one —
            // otherwise a tie-break loss would silently steal the stream
            // registration out from under the session that stays open.
            let rx = fabric_session.take_events();
            let now = clock.now_ms();
            match runtime.conn.accept_inbound(remote.clone(), fabric_session, now) {
                InboundOutcome::Adopted { previous_to_close } => {
                    if let Some(rx) = rx {
                        session_events.insert((group_id.clone(), remote), UnboundedReceiverStream::new(rx));
                    }
                    if let Some(mut previous) = previous_to_close {
                        previous.mark_closed();
                    }
                }
                InboundOutcome::Rejected(mut incoming) => {
                    incoming.mark_closed();
                }
            }
        }
        EndpointEvent::Error(msg) => {
            log::warn!("group {group_id}: fabric error: {msg}");
        }
        EndpointEvent::Disconnected | EndpointEvent::Close => {
            runtime.conn.clear_all();
            runtime.endpoint = None;
        }
    }
}

/// Returns members newly discovered by this frame, so the run loop can dial
/// them without this function needing a second mutable borrow of `runtime`.
async fn handle_session_event(state: &mut NodeState, clock: &dyn Clock, group_id: &GroupId, peer_id: &PeerId, event: SessionEvent) -> Vec<PeerId> {
    let Some(runtime) = state.groups.get_mut(group_id) else { return Vec::new() };
    let now = clock.now_ms();
    match event {
        SessionEvent::Open => {
            runtime.conn.record_heard(peer_id, now);
            let frame = sync_protocol::build_sync_request(&runtime.group);
            send_frame(runtime, peer_id, &frame).await;
            Vec::new()
        }
        SessionEvent::Data(frame) => {
            runtime.conn.record_heard(peer_id, now);
            let outcome = sync_protocol::handle_frame(&mut runtime.group, frame);
            for out_frame in &outcome.frames_to_send {
                send_frame(runtime, peer_id, out_frame).await;
            }
            outcome.newly_discovered_members
        }
        SessionEvent::Close | SessionEvent::Error(_) => {
            runtime.conn.close_session(peer_id);
            Vec::new()
        }
    }
}

/// The 5s supervisor sweep, fanned out per group. Pings and
/// fabric-recreation/dial kick-offs are cheap synchronous state transitions;
/// the actual I/O they trigger runs in its own spawned task.
async fn supervisor_tick<F: FabricFactory + 'static>(
    state: &mut NodeState,
    cmd_tx: &mpsc::Sender<Command>,
    factory: &Arc<F>,
    fabric_config: &FabricConfig,
    clock: &dyn Clock,
) {
    let now = clock.now_ms();
    let group_ids: Vec<GroupId> = state.groups.keys().cloned().collect();
    for group_id in group_ids {
        let needs_recreate = state
            .groups
            .get(&group_id)
            .map(|r| {
                if r.endpoint_pending {
                    false
                } else {
                    r.endpoint.as_ref().map(|e| e.is_destroyed()).unwrap_or(true)
                }
            })
            .unwrap_or(false);
        if needs_recreate {
            if let Some(runtime) = state.groups.get_mut(&group_id) {
                runtime.conn.clear_all();
                runtime.endpoint_pending = true;
                let my_peer_id = runtime.group.my_peer_id.clone();
                spawn_endpoint_create(cmd_tx.clone(), factory.clone(), fabric_config.clone(), group_id.clone(), my_peer_id);
            }
            // Give the fresh endpoint's `Open` event a turn before dialing.
            continue;
        }

        let members = match state.groups.get(&group_id) {
            Some(r) => r.group.member_set(),
            None => continue,
        };
        let actions = match state.groups.get_mut(&group_id) {
            Some(r) => r.conn.on_tick(&members, now),
            None => continue,
        };
        for peer in &actions.to_ping {
            if let Some(runtime) = state.groups.get(&group_id) {
                send_frame(runtime, peer, &Frame::Ping).await;
            }
        }
        for peer in actions.to_dial {
            if let Some(runtime) = state.groups.get_mut(&group_id) {
                dial_peer(runtime, cmd_tx, &group_id, peer, now);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_command<F, B>(
    state: &mut NodeState,
    cmd_tx: &mpsc::Sender<Command>,
    factory: &Arc<F>,
    persistence: &PersistenceAdapter<B>,
    fabric_config: &FabricConfig,
    clock: &dyn Clock,
    cmd: Command,
    endpoint_events: &mut EndpointEvents,
    session_events: &mut SessionEvents,
) where
    F: FabricFactory + 'static,
    B: BlobStore,
{
    match cmd {
        Command::CreateGroup { name, reply } => {
            let group_id = new_id();
            let my_peer_id = new_id();
            let group = Group::create(clock, group_id.clone(), my_peer_id.clone(), name);
            let conn = ConnectionManager::new(group_id.clone(), my_peer_id.clone());
            state.groups.insert(group_id.clone(), GroupRuntime { group, conn, endpoint: None, endpoint_pending: true, pending_dial: None });
            state.active_group_id = Some(group_id.clone());
            spawn_endpoint_create(cmd_tx.clone(), factory.clone(), fabric_config.clone(), group_id.clone(), my_peer_id);
            persist(persistence, state).await;
            let _ = reply.send(group_id);
        }
        Command::JoinGroup { invite, reply } => {
            if state.groups.contains_key(&invite.group_id) {
                let now = clock.now_ms();
                if let Some(runtime) = state.groups.get_mut(&invite.group_id) {
                    dial_peer(runtime, cmd_tx, &invite.group_id, invite.peer_id.clone(), now);
                }
                let _ = reply.send(invite.group_id);
                return;
            }
            let my_peer_id = new_id();
            let group = Group::join(invite.group_id.clone(), my_peer_id.clone());
            let conn = ConnectionManager::new(invite.group_id.clone(), my_peer_id.clone());
            state.groups.insert(
                invite.group_id.clone(),
                GroupRuntime { group, conn, endpoint: None, endpoint_pending: true, pending_dial: Some(invite.peer_id.clone()) },
            );
            spawn_endpoint_create(cmd_tx.clone(), factory.clone(), fabric_config.clone(), invite.group_id.clone(), my_peer_id);
            persist(persistence, state).await;
            let _ = reply.send(invite.group_id);
        }
        Command::LeaveGroup { group_id, reply } => {
            // Best-effort: each send is awaited just long enough to be
            // handed to the fabric, not to be acknowledged, so leaving never
            // stalls the one mailbox loop every other group shares.
            if let Some(runtime) = state.groups.get_mut(&group_id) {
                let event = Event::member_left(clock, runtime.group.my_peer_id.clone());
                let frame = Frame::EventBroadcast { event };
                let open_peers = runtime.conn.open_peers();
                for peer in open_peers {
                    send_frame(runtime, &peer, &frame).await;
                }
            }
            // The actual teardown waits out the ~500ms grace in its own
            // timer task so it doesn't block the mailbox loop for every
            // other group; it re-enters as `FinishLeaveGroup`.
            let cmd_tx = cmd_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(LEAVE_GRACE).await;
                let _ = cmd_tx.send(Command::FinishLeaveGroup { group_id, reply }).await;
            });
        }
        Command::FinishLeaveGroup { group_id, reply } => {
            let mut remote_peers = Vec::new();
            if let Some(runtime) = state.groups.get(&group_id) {
                remote_peers = runtime.conn.all_peer_ids();
            }
            if let Some(runtime) = state.groups.remove(&group_id) {
                if let Some(endpoint) = &runtime.endpoint {
                    endpoint.destroy();
                }
            }
            endpoint_events.remove(&group_id);
            for peer in remote_peers {
                session_events.remove(&(group_id.clone(), peer));
            }
            if state.active_group_id.as_deref() == Some(group_id.as_str()) {
                state.active_group_id = None;
            }
            persist(persistence, state).await;
            let _ = reply.send(());
        }
        Command::SetActiveGroup { group_id, reply } => {
            state.active_group_id = Some(group_id);
            persist(persistence, state).await;
            let _ = reply.send(());
        }
        Command::ForgetMember { group_id, peer_id, reply } => {
            if let Some(runtime) = state.groups.get_mut(&group_id) {
                runtime.group.forget(&peer_id);
                runtime.conn.forget_peer(&peer_id);
            }
            persist(persistence, state).await;
            let _ = reply.send(());
        }
        Command::AppendLocal { group_id, event_type, payload, reply } => {
            let mut appended = None;
            if let Some(runtime) = state.groups.get_mut(&group_id) {
                appended = Some(runtime.group.append_local(clock, event_type, payload));
            }
            if let Some(event) = appended.clone() {
                if let Some(runtime) = state.groups.get_mut(&group_id) {
                    let frame = Frame::EventBroadcast { event };
                    let open_peers = runtime.conn.open_peers();
                    for peer in open_peers {
                        send_frame(runtime, &peer, &frame).await;
                    }
                }
            }
            persist(persistence, state).await;
            let _ = reply.send(appended);
        }
        Command::ChatMessages { group_id, reply } => {
            let messages = state.groups.get(&group_id).map(chat_messages_for).unwrap_or_default();
            let _ = reply.send(messages);
        }
        Command::Members { group_id, reply } => {
            let members = state
                .groups
                .get(&group_id)
                .map(|r| r.group.member_set().into_iter().collect())
                .unwrap_or_default();
            let _ = reply.send(members);
        }
        Command::Groups { reply } => {
            let groups = state.groups.values().map(|r| r.group.clone()).collect();
            let _ = reply.send(groups);
        }
        Command::ActiveGroupId { reply } => {
            let _ = reply.send(state.active_group_id.clone());
        }
        Command::EndpointCreated { group_id, result } => {
            match result {
                Ok(endpoint) => {
                    if let Some(rx) = endpoint.take_events() {
                        endpoint_events.insert(group_id.clone(), UnboundedReceiverStream::new(rx));
                    }
                    if let Some(runtime) = state.groups.get_mut(&group_id) {
                        runtime.endpoint = Some(endpoint);
                        runtime.endpoint_pending = false;
                        if let Some(peer) = runtime.pending_dial.take() {
                            dial_peer(runtime, cmd_tx, &group_id, peer, clock.now_ms());
                        }
                    }
                }
                Err(e) => {
                    log::warn!("group {group_id}: failed to create fabric endpoint: {e}");
                    // Leaves `endpoint` at `None`; the next supervisor tick
                    // sees `endpoint_pending` cleared and retries the create.
                    if let Some(runtime) = state.groups.get_mut(&group_id) {
                        runtime.endpoint_pending = false;
                    }
                }
            }
        }
        Command::DialResolved { group_id, peer, result } => {
            let Some(runtime) = state.groups.get_mut(&group_id) else { return };
            match result {
                Ok(fabric_session) => {
                    if let Some(rx) = fabric_session.take_events() {
                        session_events.insert((group_id.clone(), peer.clone()), UnboundedReceiverStream::new(rx));
                    }
                    runtime.conn.dial_succeeded(&peer, fabric_session, clock.now_ms());
                }
                Err(e) => {
                    log::debug!("group {group_id}: dial to {peer} failed: {e}");
                    runtime.conn.close_session(&peer);
                }
            }
        }
    }
}

fn chat_messages_for(runtime: &GroupRuntime) -> Vec<ChatMessage> {
    runtime
        .group
        .iter_events()
        .filter_map(|e| {
            e.message_text().map(|text| ChatMessage {
                id: e.id.clone(),
                author: if e.author_peer_id == runtime.group.my_peer_id { "You".to_string() } else { e.author_peer_id.clone() },
                text: text.to_string(),
                timestamp: e.timestamp,
            })
        })
        .collect()
}

async fn persist<B: BlobStore>(persistence: &PersistenceAdapter<B>, state: &NodeState) {
    let snapshot = AppState {
        groups: state.groups.iter().map(|(id, rt)| (id.clone(), rt.group.clone())).collect(),
        active_group_id: state.active_group_id.clone(),
    };
    if let Err(e) = persistence.save(&snapshot).await {
        log::warn!("failed to persist app state: {e}");
    }
}
