//! Client side of the relay: the session the orchestrator talks through.

use super::protocol::{
    decode_line, encode_line, read_line, ClientEvent, EntityListing, EntityMeta, ServerEvent,
    SortMode,
};
use crate::utils::{NetworkError, PeerwayError, ProtocolError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

#[derive(Default)]
struct Pending {
    setup: VecDeque<oneshot::Sender<bool>>,
    lists: VecDeque<oneshot::Sender<Vec<EntityListing>>>,
    resolves: HashMap<String, Vec<oneshot::Sender<EntityMeta>>>,
}

struct SessionInner {
    tx: mpsc::UnboundedSender<ClientEvent>,
    timeout: Duration,
    pending: Mutex<Pending>,
}

/// A live relay connection with request/response correlation
///
/// Replies without ids (`SetupResult`, `ListEntitiesResponse`) are matched in
/// FIFO order; `EntityMetaResponse` is matched by entity id.
#[derive(Clone)]
pub struct RelaySession {
    inner: Arc<SessionInner>,
}

impl RelaySession {
    /// Wrap an outbound event sender
    pub fn new(tx: mpsc::UnboundedSender<ClientEvent>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                tx,
                timeout,
                pending: Mutex::new(Pending::default()),
            }),
        }
    }

    /// Send an event without waiting for a reply
    pub fn send(&self, event: ClientEvent) -> Result<()> {
        log::debug!("Relay -> {}", event.name());
        self.inner
            .tx
            .send(event)
            .map_err(|_| NetworkError::RelayClosed.into())
    }

    /// Register the local entity on this connection
    pub async fn setup_entity(&self, id: &str, name: &str, avatar: Option<String>) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.with_pending(|p| p.setup.push_back(tx));
        self.send(ClientEvent::SetupEntity {
            id: id.to_string(),
            name: name.to_string(),
            avatar,
        })?;
        self.await_reply(rx, "SetupEntity").await
    }

    /// Fetch one directory page
    pub async fn list_entities(&self, page: usize, sort: SortMode) -> Result<Vec<EntityListing>> {
        let (tx, rx) = oneshot::channel();
        self.with_pending(|p| p.lists.push_back(tx));
        self.send(ClientEvent::ListEntities {
            page,
            sort: Some(sort),
        })?;
        self.await_reply(rx, "ListEntities").await
    }

    /// Resolve an entity to its endpoint
    pub async fn resolve(&self, entity_id: &str) -> Result<EntityMeta> {
        let (tx, rx) = oneshot::channel();
        self.with_pending(|p| {
            p.resolves
                .entry(entity_id.to_string())
                .or_default()
                .push(tx)
        });
        let sent = self.send(ClientEvent::GetEntityMeta {
            id: entity_id.to_string(),
            name: None,
            avatar: None,
        });
        let reply = match sent {
            Ok(()) => self.await_reply(rx, "GetEntityMeta").await,
            Err(e) => {
                drop(rx);
                Err(e)
            }
        };
        if reply.is_err() {
            self.forget_resolve(entity_id);
        }
        reply
    }

    /// Complete a pending request; returns events nobody was waiting for
    pub fn handle(&self, event: ServerEvent) -> Option<ServerEvent> {
        let Ok(mut pending) = self.inner.pending.lock() else {
            return Some(event);
        };

        match event {
            ServerEvent::SetupResult(ok) => {
                if let Some(waiter) = next_live(&mut pending.setup) {
                    let _ = waiter.send(ok);
                }
                None
            }
            ServerEvent::ListEntitiesResponse(rows) => {
                if let Some(waiter) = next_live(&mut pending.lists) {
                    let _ = waiter.send(rows);
                }
                None
            }
            ServerEvent::EntityMetaResponse(meta) => {
                for waiter in pending.resolves.remove(&meta.id).unwrap_or_default() {
                    let _ = waiter.send(meta.clone());
                }
                None
            }
            other => Some(other),
        }
    }

    // Drop waiters whose caller gave up.
    fn forget_resolve(&self, entity_id: &str) {
        self.with_pending(|p| {
            if let Some(waiters) = p.resolves.get_mut(entity_id) {
                waiters.retain(|tx| !tx.is_closed());
                if waiters.is_empty() {
                    p.resolves.remove(entity_id);
                }
            }
        });
    }

    fn with_pending(&self, f: impl FnOnce(&mut Pending)) {
        if let Ok(mut pending) = self.inner.pending.lock() {
            f(&mut pending);
        }
    }

    async fn await_reply<T>(&self, rx: oneshot::Receiver<T>, operation: &str) -> Result<T> {
        match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(NetworkError::RelayClosed.into()),
            Err(_) => Err(PeerwayError::timeout(operation)),
        }
    }
}

// Skip waiters whose callers timed out.
fn next_live<T>(queue: &mut VecDeque<oneshot::Sender<T>>) -> Option<oneshot::Sender<T>> {
    while let Some(waiter) = queue.pop_front() {
        if !waiter.is_closed() {
            return Some(waiter);
        }
    }
    None
}

/// Connect to a relay server over TCP
pub async fn connect(
    address: &str,
) -> Result<(
    mpsc::UnboundedSender<ClientEvent>,
    mpsc::UnboundedReceiver<ServerEvent>,
)> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| NetworkError::ConnectionFailed {
            peer: address.to_string(),
            reason: e.to_string(),
        })?;
    let (reader, mut writer) = stream.into_split();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<ClientEvent>();
    let (server_tx, server_rx) = mpsc::unbounded_channel::<ServerEvent>();

    tokio::spawn(async move {
        while let Some(event) = client_rx.recv().await {
            let Ok(line) = encode_line(&event) else {
                continue;
            };
            if writer.write_all(line.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
            {
                log::warn!("Relay connection lost while writing");
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        loop {
            let line = match read_line(&mut reader).await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e @ PeerwayError::Protocol(ProtocolError::InvalidMessage { .. })) => {
                    log::warn!("Malformed relay event: {e}");
                    continue;
                }
                Err(e) => {
                    log::warn!("Dropping relay connection: {e}");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match decode_line::<ServerEvent>(&line) {
                Ok(event) => {
                    if server_tx.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("Malformed relay event: {e}"),
            }
        }
        log::info!("Relay connection closed");
    });

    log::info!("Connected to relay at {address}");
    Ok((client_tx, server_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_matches_by_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = RelaySession::new(tx, Duration::from_secs(5));

        let resolver = session.clone();
        let task = tokio::spawn(async move { resolver.resolve("b1").await });

        match rx.recv().await.unwrap() {
            ClientEvent::GetEntityMeta { id, .. } => assert_eq!(id, "b1"),
            other => panic!("unexpected event {other:?}"),
        }

        assert!(session
            .handle(ServerEvent::EntityMetaResponse(EntityMeta::unavailable("zz")))
            .is_none());
        assert!(session
            .handle(ServerEvent::EntityMetaResponse(EntityMeta::unavailable("b1")))
            .is_none());

        let meta = task.await.unwrap().unwrap();
        assert_eq!(meta.id, "b1");
        assert!(!meta.available);
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = RelaySession::new(tx, Duration::from_millis(20));

        let err = session.list_entities(0, SortMode::ByName).await.unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_timed_out_resolve_leaves_no_waiter() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = RelaySession::new(tx, Duration::from_millis(20));

        for _ in 0..3 {
            assert!(session.resolve("b1").await.is_err());
        }
        assert!(session.inner.pending.lock().unwrap().resolves.is_empty());
    }

    #[tokio::test]
    async fn test_unsolicited_events_pass_through() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = RelaySession::new(tx, Duration::from_secs(1));

        let event = ServerEvent::PushNotification {
            notif: serde_json::json!({}),
            from: "a1".to_string(),
        };
        assert_eq!(session.handle(event.clone()), Some(event));
    }

    #[tokio::test]
    async fn test_send_after_relay_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let session = RelaySession::new(tx, Duration::from_secs(1));

        assert!(session
            .send(ClientEvent::ListEntities { page: 0, sort: None })
            .is_err());
    }
}
