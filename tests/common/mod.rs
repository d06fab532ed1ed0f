//! Shared harness: an in-process relay, an in-memory transport network and
//! nodes backed by in-memory databases.

use peerway::relay::{ClientEvent, Relay, RelaySession};
use peerway::storage::{Database, MemoryDatabase};
use peerway::transport::{MemoryNetwork, TransportFactory};
use peerway::utils::StorageConfig;
use peerway::{Entity, Peerway, PeerwayConfig};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Poll `$cond` until it holds or two seconds pass
macro_rules! eventually {
    ($cond:expr) => {{
        let mut held = false;
        for _ in 0..400 {
            if $cond {
                held = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        held
    }};
}

pub struct Node {
    pub app: Peerway,
    pub db: Arc<MemoryDatabase>,
    /// Names of the relay events this node sent, in order
    pub sent: Arc<Mutex<Vec<&'static str>>>,
    _dir: TempDir,
}

pub struct Overlay {
    pub relay: Relay,
    pub network: MemoryNetwork,
}

impl Overlay {
    pub fn new() -> Self {
        Self::with_network(MemoryNetwork::new())
    }

    pub fn with_network(network: MemoryNetwork) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            relay: Relay::new(),
            network,
        }
    }

    pub async fn node(&self, id: &str) -> Node {
        self.node_with(id, |_| {}).await
    }

    pub async fn node_with(&self, id: &str, tweak: impl FnOnce(&mut PeerwayConfig)) -> Node {
        let factory: Arc<dyn TransportFactory> = Arc::new(self.network.clone());
        spawn_node(id, &self.relay, factory, tweak).await
    }
}

pub async fn spawn_node(
    id: &str,
    relay: &Relay,
    factory: Arc<dyn TransportFactory>,
    tweak: impl FnOnce(&mut PeerwayConfig),
) -> Node {
    let dir = TempDir::new().unwrap();
    let mut config = PeerwayConfig::default();
    config.storage = StorageConfig::under(dir.path().to_path_buf());
    tweak(&mut config);

    let (relay_tx, rx) = relay.attach();
    let (tx, mut outbound) = mpsc::unbounded_channel::<ClientEvent>();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&sent);
    tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            log.lock().unwrap().push(event.name());
            if relay_tx.send(event).is_err() {
                break;
            }
        }
    });

    let session = RelaySession::new(tx, config.relay.request_timeout());
    let db = Arc::new(MemoryDatabase::new());
    let app = Peerway::new(
        Entity::with_id(id, id),
        config,
        Arc::clone(&db) as Arc<dyn Database>,
        session,
        factory,
    );
    app.start(rx).await.unwrap();

    Node {
        app,
        db,
        sent,
        _dir: dir,
    }
}

pub async fn connected(a: &Node, b: &Node) {
    a.app.connect_to_peer(b.app.id()).await.unwrap();
    let linked = eventually!(
        a.app.channel_state(b.app.id()) == Some(peerway::TransportState::Connected)
            && b.app.channel_state(a.app.id()) == Some(peerway::TransportState::Connected)
    );
    assert!(linked, "{} and {} did not connect", a.app.id(), b.app.id());
}
