//! End-to-end scenarios: entities on one relay talking over direct channels.

#[macro_use]
mod common;

use chrono::{DateTime, Utc};
use common::{connected, Node, Overlay};
use peerway::relay::{client, Relay, RelayServer, RelaySession};
use peerway::storage::{Database, MemoryDatabase};
use peerway::sync::SyncOutcome;
use peerway::transport::{MemoryNetwork, TcpTransportFactory};
use peerway::utils::StorageConfig;
use peerway::channel::Role;
use peerway::utils::EventBus;
use peerway::{Entity, Peerway, PeerwayConfig, TransportState};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn no_auto_sync(config: &mut PeerwayConfig) {
    config.sync.sync_on_connect = false;
}

fn record<T: Send + 'static>(bus: &EventBus<T>) -> Arc<Mutex<Vec<T>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            sink.lock().unwrap().push(event);
        }
    });
    seen
}

fn position(node: &Node, event: &str) -> Option<usize> {
    node.sent.lock().unwrap().iter().position(|sent| *sent == event)
}

async fn peer_name(node: &Node, id: &str) -> Option<String> {
    node.db.peer(id).await.unwrap().map(|p| p.display_name)
}

async fn stamps(a: &Node, b: &Node) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let a_view = a.db.peer(b.app.id()).await.unwrap().map(|p| p.last_sync);
    let b_view = b.db.peer(a.app.id()).await.unwrap().map(|p| p.last_sync);
    (a_view, b_view)
}

#[tokio::test]
async fn test_connect_resolves_then_negotiates() {
    let overlay = Overlay::new();
    let alice = overlay.node("alice").await;
    let bob = overlay.node("bob").await;
    let online = record(&alice.app.events().online);

    connected(&alice, &bob).await;

    let channel = alice.app.peer_channel("bob").unwrap();
    assert!(channel.remote_endpoint().is_some());
    assert_eq!(overlay.network.created(), 2);

    let resolved = position(&alice, "GetEntityMeta").expect("bob was never resolved");
    let offered = position(&alice, "SendPeerRequest").expect("no offer was sent");
    assert!(resolved < offered);
    assert_eq!(position(&alice, "SetupEntity"), Some(0));
    assert!(eventually!(online
        .lock()
        .unwrap()
        .contains(&("bob".to_string(), true))));
}

#[tokio::test]
async fn test_unregistered_peer_reports_offline_once() {
    let overlay = Overlay::new();
    let alice = overlay.node("alice").await;
    let online = record(&alice.app.events().online);

    alice.app.connect_to_peer("b1").await.unwrap();
    assert!(eventually!(!online.lock().unwrap().is_empty()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*online.lock().unwrap(), vec![("b1".to_string(), false)]);
    assert_eq!(overlay.network.created(), 0);
    assert!(position(&alice, "GetEntityMeta").is_some());
    assert_eq!(position(&alice, "SendPeerRequest"), None);
    assert_ne!(alice.app.channel_state("b1"), Some(TransportState::Connected));
}

#[tokio::test]
async fn test_crossed_connects_settle_on_one_caller() {
    let overlay = Overlay::new();
    let alice = overlay.node_with("alice", no_auto_sync).await;
    let bob = overlay.node_with("bob", no_auto_sync).await;

    let (a, b) = tokio::join!(
        alice.app.connect_to_peer("bob"),
        bob.app.connect_to_peer("alice")
    );
    a.unwrap();
    b.unwrap();

    assert!(eventually!(
        alice.app.channel_state("bob") == Some(TransportState::Connected)
            && bob.app.channel_state("alice") == Some(TransportState::Connected)
    ));
    let roles = (
        alice.app.peer_channel("bob").unwrap().role(),
        bob.app.peer_channel("alice").unwrap().role(),
    );
    // Crossed offers keep the smaller id's; otherwise the later connect defers.
    assert_ne!(roles.0, roles.1);
    assert!(roles.0 == Role::Caller || roles.1 == Role::Caller);
}

#[tokio::test]
async fn test_stalled_negotiation_times_out() {
    let overlay = Overlay::new();
    let alice = overlay.node_with("alice", |config| {
        config.sync.sync_on_connect = false;
        config.network.connect_timeout = 1;
    })
    .await;
    let bob = overlay.node_with("bob", no_auto_sync).await;
    bob.app.set_blocked("alice", true).await.unwrap();
    let online = record(&alice.app.events().online);

    alice.app.connect_to_peer("bob").await.unwrap();
    assert_eq!(alice.app.channel_state("bob"), Some(TransportState::Connecting));

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(eventually!(
        alice.app.channel_state("bob") == Some(TransportState::Disconnected)
    ));
    assert!(eventually!(online
        .lock()
        .unwrap()
        .contains(&("bob".to_string(), false))));
}

#[tokio::test]
async fn test_candidates_apply_in_emission_order() {
    let overlay = Overlay::with_network(MemoryNetwork::with_candidates(6));
    let alice = overlay.node_with("alice", no_auto_sync).await;
    let bob = overlay.node_with("bob", no_auto_sync).await;

    connected(&alice, &bob).await;

    let applied = overlay.network.applied_candidates();
    assert_eq!(applied.len(), 6);
    let token = applied[0].split_whitespace().nth(1).unwrap().to_string();
    for (i, candidate) in applied.iter().enumerate() {
        assert_eq!(candidate, &format!("mem {token} {i}"));
    }
}

#[tokio::test]
async fn test_file_transfer_is_acknowledged_once() {
    let overlay = Overlay::new();
    let alice = overlay.node_with("alice", no_auto_sync).await;
    let bob = overlay.node_with("bob", no_auto_sync).await;
    connected(&alice, &bob).await;

    let payload = vec![0xAB; 20_000];
    let channel = alice.app.peer_channel("bob").unwrap();
    channel
        .send_data(payload.clone(), "application/octet-stream", "f.bin")
        .await
        .unwrap();

    assert_eq!(channel.acks_received(), 1);
    let stored = bob
        .app
        .files()
        .read("application/octet-stream", "f.bin")
        .await
        .unwrap();
    assert_eq!(stored, payload);
}

#[tokio::test]
async fn test_sync_converges_and_settles() {
    let overlay = Overlay::new();
    let alice = overlay.node("alice").await;
    let bob = overlay.node("bob").await;
    alice.app.set_profile("Alice", None).await.unwrap();
    bob.app.set_profile("Bob", None).await.unwrap();

    connected(&alice, &bob).await;

    assert!(eventually!(
        peer_name(&bob, "alice").await.as_deref() == Some("Alice")
            && peer_name(&alice, "bob").await.as_deref() == Some("Bob")
    ));
    assert!(eventually!({
        let (a, b) = stamps(&alice, &bob).await;
        a.is_some() && a == b && alice.db.peer("bob").await.unwrap().unwrap().has_synced()
    }));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Agreed stamps: another round changes nothing and is not reciprocated.
    let answered = record(&bob.app.events().synced);
    let before = stamps(&alice, &bob).await;
    assert!(alice.app.sync_peer("bob", false).await.unwrap());
    assert!(eventually!(!answered.lock().unwrap().is_empty()));

    let (from, outcome): (String, SyncOutcome) = answered.lock().unwrap()[0].clone();
    assert_eq!(from, "alice");
    assert!(!outcome.sync_required);
    assert!(!outcome.updated);
    assert!(!outcome.bounced);
    assert_eq!(stamps(&alice, &bob).await, before);
}

#[tokio::test]
async fn test_forced_sync_is_answered_with_an_echo() {
    let overlay = Overlay::new();
    let alice = overlay.node_with("alice", no_auto_sync).await;
    let bob = overlay.node_with("bob", no_auto_sync).await;
    connected(&alice, &bob).await;

    let bob_answers = record(&bob.app.events().synced);
    let alice_answers = record(&alice.app.events().synced);
    alice.app.sync_peer("bob", true).await.unwrap();

    assert!(eventually!(
        !bob_answers.lock().unwrap().is_empty() && !alice_answers.lock().unwrap().is_empty()
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let bob_answers = bob_answers.lock().unwrap();
    let alice_answers = alice_answers.lock().unwrap();
    assert_eq!(bob_answers.len(), 1);
    assert!(bob_answers[0].1.bounced);
    // The echo is answered but never bounced back.
    assert_eq!(alice_answers.len(), 1);
    assert!(!alice_answers[0].1.bounced);
}

#[tokio::test]
async fn test_certificate_verification() {
    let overlay = Overlay::new();
    let alice = overlay.node_with("alice", no_auto_sync).await;
    let bob = overlay.node_with("bob", no_auto_sync).await;
    connected(&alice, &bob).await;

    assert_eq!(alice.app.is_verified("bob"), None);
    alice.app.issue_certificate("bob").await.unwrap();
    assert!(eventually!(bob
        .db
        .peer("alice")
        .await
        .unwrap()
        .is_some_and(|p| p.certificate.is_some())));

    assert!(alice.app.verify_peer("bob").await.unwrap());
    assert_eq!(alice.app.is_verified("bob"), Some(true));

    // Alter one byte of Bob's stored copy.
    let mut stored = bob.db.peer("alice").await.unwrap().unwrap();
    if let Some(certificate) = stored.certificate.as_mut() {
        certificate.version += 1;
    }
    bob.db.save_peer(&stored).await.unwrap();

    assert!(!alice.app.verify_peer("bob").await.unwrap());
    assert_eq!(alice.app.is_verified("bob"), Some(false));
}

#[tokio::test]
async fn test_verify_without_issued_certificate_fails() {
    let overlay = Overlay::new();
    let alice = overlay.node_with("alice", no_auto_sync).await;
    let bob = overlay.node_with("bob", no_auto_sync).await;
    connected(&alice, &bob).await;

    assert!(alice.app.verify_peer("bob").await.is_err());
}

#[tokio::test]
async fn test_chat_message_reaches_member_once() {
    let overlay = Overlay::new();
    let alice = overlay.node_with("alice", no_auto_sync).await;
    let bob = overlay.node_with("bob", no_auto_sync).await;
    connected(&alice, &bob).await;

    let messages = record(&bob.app.events().message);
    let chat = alice
        .app
        .invite_to_chat("lunch", &["bob".to_string()])
        .await
        .unwrap();
    assert!(eventually!(bob.db.chat(&chat.id).await.unwrap().is_some()));

    let sent = alice
        .app
        .send_chat_message(&chat.id, "noon?", "text/plain")
        .await
        .unwrap();
    assert!(eventually!(!messages.lock().unwrap().is_empty()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let received = messages.lock().unwrap().clone();
    assert_eq!(received, vec![sent.clone()]);
    assert_eq!(bob.db.messages_in(&chat.id).await, vec![sent]);
}

#[tokio::test]
async fn test_blocked_peer_cannot_connect() {
    let overlay = Overlay::new();
    let alice = overlay.node_with("alice", no_auto_sync).await;
    let bob = overlay.node_with("bob", no_auto_sync).await;
    bob.app.set_blocked("alice", true).await.unwrap();

    alice.app.connect_to_peer("bob").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_ne!(alice.app.channel_state("bob"), Some(TransportState::Connected));
    assert_eq!(bob.app.channel_state("alice"), None);
}

#[tokio::test]
async fn test_published_post_reaches_subscriber() {
    let overlay = Overlay::new();
    let alice = overlay.node("alice").await;
    let bob = overlay.node("bob").await;
    connected(&alice, &bob).await;

    // Bob's sync request subscribes him to Alice's posts.
    assert!(eventually!(alice
        .db
        .subscribers()
        .await
        .unwrap()
        .contains(&"bob".to_string())));

    let posts = record(&bob.app.events().post);
    let post = alice.app.publish_post(None, "hello", Vec::new()).await.unwrap();

    assert!(eventually!(!posts.lock().unwrap().is_empty()));
    let received = posts.lock().unwrap()[0].clone();
    assert_eq!(received, post);
    assert_eq!(bob.db.post(&post.id).await.unwrap(), Some(post));
}

#[tokio::test]
async fn test_push_notification_through_relay() {
    let overlay = Overlay::new();
    let alice = overlay.node("alice").await;
    let bob = overlay.node("bob").await;
    let notifications = record(&bob.app.events().notification);

    alice
        .app
        .push_notification(vec!["bob".to_string()], serde_json::json!({"kind": "wave"}))
        .unwrap();

    assert!(eventually!(!notifications.lock().unwrap().is_empty()));
    let notification = notifications.lock().unwrap()[0].clone();
    assert_eq!(notification.from, "alice");
    assert_eq!(notification.notif["kind"], "wave");
}

async fn tcp_node(id: &str, relay_address: &str) -> (Peerway, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config = PeerwayConfig::default();
    config.storage = StorageConfig::under(dir.path().to_path_buf());
    config.sync.sync_on_connect = false;

    let (tx, rx) = client::connect(relay_address).await.unwrap();
    let session = RelaySession::new(tx, config.relay.request_timeout());
    let factory = Arc::new(TcpTransportFactory::new(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        config.network.max_frame_size,
    ));
    let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
    let app = Peerway::new(Entity::with_id(id, id), config, db, session, factory);
    app.start(rx).await.unwrap();
    (app, dir)
}

#[tokio::test]
async fn test_tcp_relay_and_transport() {
    let _ = env_logger::builder().is_test(true).try_init();
    let server = RelayServer::bind("127.0.0.1:0".parse().unwrap(), Relay::new())
        .await
        .unwrap();
    let address = server.local_addr().unwrap().to_string();
    tokio::spawn(server.run());

    let (alice, _a) = tcp_node("alice", &address).await;
    let (bob, _b) = tcp_node("bob", &address).await;

    alice.connect_to_peer("bob").await.unwrap();
    assert!(eventually!(
        alice.channel_state("bob") == Some(TransportState::Connected)
            && bob.channel_state("alice") == Some(TransportState::Connected)
    ));

    let messages = record(&bob.events().message);
    let chat = alice
        .invite_to_chat("tcp", &["bob".to_string()])
        .await
        .unwrap();
    assert!(eventually!(bob.db().chat(&chat.id).await.unwrap().is_some()));
    alice
        .send_chat_message(&chat.id, "over tcp", "text/plain")
        .await
        .unwrap();

    assert!(eventually!(!messages.lock().unwrap().is_empty()));
    assert_eq!(messages.lock().unwrap()[0].content, "over tcp");
}
