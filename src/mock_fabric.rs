//! An in-memory [`PeerFabric`] double. Not a transport meant for production
//! use — it exists so this crate's own tests can drive multiple nodes
//! through the real connection manager and sync protocol without a real
//! signaling server or reliable-data-channel implementation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, Mutex};

use crate::clock::PeerId;
use crate::peer_fabric::{BoxFuture, EndpointEvent, FabricConfig, FabricError, FabricFactory, FabricSession, PeerFabric, SessionEvent};
use crate::wire::Frame;

/// Shared address space for a set of [`MockFactory`]-created endpoints.
/// Stand-in for the signaling service that lets real fabrics find each
/// other by peer id.
#[derive(Default)]
pub struct MockNetwork {
    endpoints: Mutex<HashMap<PeerId, Arc<MockEndpoint>>>,
    /// Unordered pairs that are not allowed to connect, for simulating a
    /// partition.
    severed: StdMutex<HashSet<(PeerId, PeerId)>>,
    /// Both sides of every live session, keyed by the same unordered pair, so
    /// `sever` can also drop a link that's already connected — a real
    /// network partition takes down existing sessions, not just future
    /// dials.
    live_sessions: StdMutex<HashMap<(PeerId, PeerId), Vec<Arc<MockSession>>>>,
}

fn pair_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block future `connect` attempts between `a` and `b` in either
    /// direction, and close any session the pair already has open,
    /// simulating a link failure.
    pub fn sever(&self, a: &PeerId, b: &PeerId) {
        let key = pair_key(a, b);
        self.severed.lock().unwrap().insert(key.clone());
        if let Some(sessions) = self.live_sessions.lock().unwrap().remove(&key) {
            for session in sessions {
                session.close();
            }
        }
    }

    /// Undo [`Self::sever`].
    pub fn heal(&self, a: &PeerId, b: &PeerId) {
        self.severed.lock().unwrap().remove(&pair_key(a, b));
    }

    fn is_severed(&self, a: &PeerId, b: &PeerId) -> bool {
        self.severed.lock().unwrap().contains(&pair_key(a, b))
    }
}

pub struct MockFactory {
    network: Arc<MockNetwork>,
}

impl MockFactory {
    pub fn new(network: Arc<MockNetwork>) -> Self {
        MockFactory { network }
    }
}

impl FabricFactory for MockFactory {
    fn create_endpoint<'a>(
        &'a self,
        peer_id: &'a PeerId,
        _config: &'a FabricConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn PeerFabric>, FabricError>> {
        let peer_id = peer_id.clone();
        let network = self.network.clone();
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let endpoint = Arc::new(MockEndpoint {
                peer_id: peer_id.clone(),
                network: network.clone(),
                events_tx: tx.clone(),
                events_rx: StdMutex::new(Some(rx)),
                destroyed: AtomicBool::new(false),
            });
            network.endpoints.lock().await.insert(peer_id.clone(), endpoint.clone());
            let _ = tx.send(EndpointEvent::Open);
            Ok(endpoint as Arc<dyn PeerFabric>)
        })
    }
}

struct MockEndpoint {
    peer_id: PeerId,
    network: Arc<MockNetwork>,
    events_tx: mpsc::UnboundedSender<EndpointEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<EndpointEvent>>>,
    destroyed: AtomicBool,
}

impl PeerFabric for MockEndpoint {
    fn connect<'a>(&'a self, remote_peer_id: &'a PeerId) -> BoxFuture<'a, Result<Arc<dyn FabricSession>, FabricError>> {
        let remote_id = remote_peer_id.clone();
        Box::pin(async move {
            if self.network.is_severed(&self.peer_id, &remote_id) {
                return Err(FabricError(format!("{} <-> {} is partitioned", self.peer_id, remote_id)));
            }
            let remote_endpoint = self
                .network
                .endpoints
                .lock()
                .await
                .get(&remote_id)
                .cloned()
                .ok_or_else(|| FabricError(format!("no such peer: {remote_id}")))?;
            let (local_session, remote_session) = connected_pair(self.peer_id.clone(), remote_id.clone());
            self.network
                .live_sessions
                .lock()
                .unwrap()
                .entry(pair_key(&self.peer_id, &remote_id))
                .or_default()
                .extend([local_session.clone(), remote_session.clone()]);
            let _ = remote_endpoint.events_tx.send(EndpointEvent::Connection(remote_session));
            Ok(local_session as Arc<dyn FabricSession>)
        })
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        let _ = self.events_tx.send(EndpointEvent::Close);
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EndpointEvent>> {
        self.events_rx.lock().unwrap().take()
    }
}

struct MockSession {
    remote_peer_id: PeerId,
    peer_tx: mpsc::UnboundedSender<SessionEvent>,
    own_events_rx: StdMutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    open: AtomicBool,
}

fn connected_pair(local_peer: PeerId, remote_peer: PeerId) -> (Arc<MockSession>, Arc<MockSession>) {
    let (tx_to_local, rx_for_local) = mpsc::unbounded_channel();
    let (tx_to_remote, rx_for_remote) = mpsc::unbounded_channel();

    let local_session = Arc::new(MockSession {
        remote_peer_id: remote_peer,
        peer_tx: tx_to_remote,
        own_events_rx: StdMutex::new(Some(rx_for_local)),
        open: AtomicBool::new(true),
    });
    let remote_session = Arc::new(MockSession {
        remote_peer_id: local_peer,
        peer_tx: tx_to_local.clone(),
        own_events_rx: StdMutex::new(Some(rx_for_remote)),
        open: AtomicBool::new(true),
    });

    let _ = tx_to_local.send(SessionEvent::Open);
    let _ = local_session.peer_tx.send(SessionEvent::Open);

    (local_session, remote_session)
}

impl FabricSession for MockSession {
    fn peer(&self) -> &PeerId {
        &self.remote_peer_id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send<'a>(&'a self, frame: &'a Frame) -> BoxFuture<'a, Result<(), FabricError>> {
        let frame = frame.clone();
        Box::pin(async move {
            if !self.is_open() {
                return Err(FabricError("session is closed".into()));
            }
            self.peer_tx
                .send(SessionEvent::Data(frame))
                .map_err(|_| FabricError("peer session dropped".into()))
        })
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.peer_tx.send(SessionEvent::Close);
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.own_events_rx.lock().unwrap().take()
    }
}
