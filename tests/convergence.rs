//! End-to-end convergence tests driving [`Node`] over the in-memory mock
//! fabric: real async scheduling and the real sync protocol, no real network.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use kindred_core::mock_fabric::{MockFactory, MockNetwork};
use kindred_core::{BlobStore, FabricConfig, Invite, Node, PersistenceAdapter, PersistenceError};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A `BlobStore` double, local to this test file — `PersistenceAdapter`'s own
/// `mem_store` is `#[cfg(test)]`-only inside the library crate and so is not
/// visible from here.
#[derive(Default)]
struct MemBlobStore {
    inner: tokio::sync::Mutex<HashMap<String, Vec<u8>>>,
}

impl BlobStore for MemBlobStore {
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, PersistenceError>> {
        Box::pin(async move { Ok(self.inner.lock().await.get(key).cloned()) })
    }

    fn store<'a>(&'a self, key: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, Result<(), PersistenceError>> {
        Box::pin(async move {
            self.inner.lock().await.insert(key.to_string(), bytes);
            Ok(())
        })
    }
}

/// Surfaces the orchestrator's `log::debug!`/`warn!` output under
/// `RUST_LOG=kindred_core=debug cargo test -- --nocapture`. Safe to call from
/// every test — `try_init` is a no-op once a logger is already installed.
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn new_node(network: &Arc<MockNetwork>, store: Arc<MemBlobStore>) -> Node {
    let factory = Arc::new(MockFactory::new(network.clone()));
    let persistence = Arc::new(PersistenceAdapter::new(store));
    Node::spawn(factory, persistence, FabricConfig::default())
}

/// Gives the background mailbox loops time to dial, sync, and deliver —
/// the mock fabric has no real latency, so this is generous headroom, not a
/// tuned timing assumption.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn creator_and_joiner_converge_on_chat_history() {
    init_logging();
    let network = MockNetwork::new();
    let a = new_node(&network, Arc::new(MemBlobStore::default()));
    let b = new_node(&network, Arc::new(MemBlobStore::default()));

    let group_id = a.create_group("book club").await.unwrap();
    a.send_message(group_id.clone(), "hello").await.unwrap();

    let peer_a = a.members(group_id.clone()).await.unwrap().remove(0);
    let invite = Invite::new(group_id.clone(), peer_a).encode();

    let joined_id = b.join_group(&invite).await.unwrap();
    assert_eq!(joined_id, group_id);
    settle().await;

    b.send_message(group_id.clone(), "hi back").await.unwrap();
    settle().await;

    let a_msgs = a.chat_messages(group_id.clone()).await.unwrap();
    let b_msgs = b.chat_messages(group_id.clone()).await.unwrap();
    assert_eq!(a_msgs.len(), 2);
    assert_eq!(
        a_msgs.iter().map(|m| m.text.clone()).collect::<Vec<_>>(),
        b_msgs.iter().map(|m| m.text.clone()).collect::<Vec<_>>(),
    );

    assert_eq!(a.members(group_id.clone()).await.unwrap().len(), 2);
    assert_eq!(b.members(group_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn node_restart_recovers_persisted_state() {
    init_logging();
    let network = MockNetwork::new();
    let store = Arc::new(MemBlobStore::default());

    let group_id = {
        let node = new_node(&network, store.clone());
        let group_id = node.create_group("persisted").await.unwrap();
        // `append_local`'s handler persists before replying, so durability
        // here is already guaranteed without an extra sleep.
        node.send_message(group_id.clone(), "before restart").await.unwrap();
        group_id
        // `node` drops here; its mailbox task exits once the command
        // channel closes.
    };

    let restarted = new_node(&network, store);
    settle().await;
    let messages = restarted.chat_messages(group_id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text, "before restart");
}

#[tokio::test]
async fn forgetting_a_member_purges_locally_without_telling_them() {
    init_logging();
    let network = MockNetwork::new();
    let a = new_node(&network, Arc::new(MemBlobStore::default()));
    let b = new_node(&network, Arc::new(MemBlobStore::default()));

    let group_id = a.create_group("crew").await.unwrap();
    let peer_a = a.members(group_id.clone()).await.unwrap().remove(0);
    let invite = Invite::new(group_id.clone(), peer_a.clone()).encode();
    b.join_group(&invite).await.unwrap();
    settle().await;

    b.send_message(group_id.clone(), "hi from b").await.unwrap();
    settle().await;

    let peer_b = b.members(group_id.clone()).await.unwrap().into_iter().find(|p| *p != peer_a).unwrap();
    a.forget_member(group_id.clone(), peer_b.clone()).await.unwrap();

    let a_members = a.members(group_id.clone()).await.unwrap();
    assert!(!a_members.contains(&peer_b));
    assert!(a.chat_messages(group_id.clone()).await.unwrap().is_empty());

    // Forgetting is purely local — b's own replica is untouched.
    let b_members = b.members(group_id).await.unwrap();
    assert!(b_members.contains(&peer_b));
}

#[tokio::test]
async fn invalid_invite_code_is_rejected_with_no_state_change() {
    init_logging();
    let network = MockNetwork::new();
    let node = new_node(&network, Arc::new(MemBlobStore::default()));

    let result = node.join_group("not an invite").await;
    assert!(result.is_err());
    assert!(node.groups().await.unwrap().is_empty());
}

/// Gives the 5s supervisor tick (reconnect sweep) time to fire at least
/// once — needed after a session the connection manager still considers a
/// known member gets closed out from under it, since reconnection is driven
/// entirely by that periodic sweep, not by the close event itself.
async fn settle_past_a_tick() {
    tokio::time::sleep(Duration::from_secs(6)).await;
}

/// A, B, C are mesh-connected; the A<->C link fails
/// while B stays connected to both. Both author an event while partitioned;
/// B observes both directly. Once A<->C heals, the reconnect sweep re-opens
/// the link and its on-open SYNC_REQUESTs re-converge all three to the same
/// log.
#[tokio::test]
async fn partition_repairs_once_the_severed_link_heals() {
    init_logging();
    let network = MockNetwork::new();
    let a = new_node(&network, Arc::new(MemBlobStore::default()));
    let b = new_node(&network, Arc::new(MemBlobStore::default()));
    let c = new_node(&network, Arc::new(MemBlobStore::default()));

    let group_id = a.create_group("trio").await.unwrap();
    let peer_a = a.members(group_id.clone()).await.unwrap().remove(0);
    let invite_a = Invite::new(group_id.clone(), peer_a.clone()).encode();

    // B joins and speaks first, so A's log already carries B's event by the
    // time C joins — C's own on-open sync with A then surfaces B as a
    // newcomer and C dials B directly, completing the mesh.
    b.join_group(&invite_a).await.unwrap();
    settle().await;
    b.send_message(group_id.clone(), "b seed").await.unwrap();
    settle().await;
    let peer_b = a.members(group_id.clone()).await.unwrap().into_iter().find(|p| *p != peer_a).unwrap();

    c.join_group(&invite_a).await.unwrap();
    settle().await;
    settle().await;
    c.send_message(group_id.clone(), "c seed").await.unwrap();
    settle().await;
    let peer_c = a
        .members(group_id.clone())
        .await
        .unwrap()
        .into_iter()
        .find(|p| *p != peer_a && *p != peer_b)
        .unwrap();

    // All three should now be mesh-connected and share both seed messages.
    for node in [&a, &b, &c] {
        let texts: Vec<String> = node.chat_messages(group_id.clone()).await.unwrap().into_iter().map(|m| m.text).collect();
        assert!(texts.contains(&"b seed".to_string()));
        assert!(texts.contains(&"c seed".to_string()));
    }

    network.sever(&peer_a, &peer_c);
    settle().await;

    a.send_message(group_id.clone(), "from a").await.unwrap();
    c.send_message(group_id.clone(), "from c").await.unwrap();
    settle().await;

    let b_texts: Vec<String> = b.chat_messages(group_id.clone()).await.unwrap().into_iter().map(|m| m.text).collect();
    assert!(b_texts.contains(&"from a".to_string()));
    assert!(b_texts.contains(&"from c".to_string()));

    // While still partitioned, A and C do not see each other's new event —
    // B does not relay broadcasts it receives; each peer only ever sends
    // its own directly-authored events.
    let a_texts: Vec<String> = a.chat_messages(group_id.clone()).await.unwrap().into_iter().map(|m| m.text).collect();
    let c_texts: Vec<String> = c.chat_messages(group_id.clone()).await.unwrap().into_iter().map(|m| m.text).collect();
    assert!(!a_texts.contains(&"from c".to_string()));
    assert!(!c_texts.contains(&"from a".to_string()));

    network.heal(&peer_a, &peer_c);
    settle_past_a_tick().await;
    settle().await;

    let a_texts: Vec<String> = a.chat_messages(group_id.clone()).await.unwrap().into_iter().map(|m| m.text).collect();
    let c_texts: Vec<String> = c.chat_messages(group_id).await.unwrap().into_iter().map(|m| m.text).collect();
    assert!(a_texts.contains(&"from c".to_string()));
    assert!(c_texts.contains(&"from a".to_string()));
}

/// B and C both scan A's invite within the same second,
/// neither aware of the other. Both create an empty replica and dial A
/// directly; since neither has authored anything yet, A's reply to each is
/// just `[E0]` — there is no third peer id in that payload for either to
/// discover. All that matters is the race doesn't corrupt anything: both
/// joins succeed, and all three land on the exact same genesis log.
#[tokio::test]
async fn simultaneous_joiners_converge_without_corrupting_state() {
    init_logging();
    let network = MockNetwork::new();
    let a = new_node(&network, Arc::new(MemBlobStore::default()));
    let b = new_node(&network, Arc::new(MemBlobStore::default()));
    let c = new_node(&network, Arc::new(MemBlobStore::default()));

    let group_id = a.create_group("trio").await.unwrap();
    let peer_a = a.members(group_id.clone()).await.unwrap().remove(0);
    let invite = Invite::new(group_id.clone(), peer_a).encode();

    let (b_joined, c_joined) = tokio::join!(b.join_group(&invite), c.join_group(&invite));
    assert_eq!(b_joined.unwrap(), group_id);
    assert_eq!(c_joined.unwrap(), group_id);
    settle().await;
    settle().await;

    let a_group = a.groups().await.unwrap().into_iter().find(|g| g.id == group_id).unwrap();
    let b_group = b.groups().await.unwrap().into_iter().find(|g| g.id == group_id).unwrap();
    let c_group = c.groups().await.unwrap().into_iter().find(|g| g.id == group_id).unwrap();

    assert_eq!(a_group.name, "trio");
    assert_eq!(b_group.name, "trio");
    assert_eq!(c_group.name, "trio");
    assert_eq!(a_group.event_ids(), b_group.event_ids());
    assert_eq!(a_group.event_ids(), c_group.event_ids());
}
