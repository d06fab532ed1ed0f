//! The relay proper: registry plus live connection table.
//!
//! Transport-agnostic: [`RelayServer`](super::RelayServer) feeds it from TCP,
//! [`Relay::attach`] feeds it in-process.

use super::protocol::{ClientEvent, DisplayMeta, ServerEvent, SortMode};
use super::registry::EndpointRegistry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Default)]
struct RelayState {
    registry: EndpointRegistry,
    connections: HashMap<String, mpsc::UnboundedSender<ServerEvent>>,
}

/// Signaling relay shared by all connections
#[derive(Clone, Default)]
pub struct Relay {
    state: Arc<Mutex<RelayState>>,
}

impl Relay {
    /// Create an empty relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection; returns its endpoint id and outbound event stream
    pub fn open(&self) -> (String, mpsc::UnboundedReceiver<ServerEvent>) {
        let endpoint_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.state.lock() {
            state.connections.insert(endpoint_id.clone(), tx);
        }
        log::debug!("Relay connection opened: {endpoint_id}");
        (endpoint_id, rx)
    }

    /// Close a connection and unregister its endpoint
    pub fn close(&self, endpoint_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.connections.remove(endpoint_id);
            if let Some(entity_id) = state.registry.unregister(endpoint_id) {
                log::info!("Entity {entity_id} left endpoint {endpoint_id}");
            }
        }
    }

    /// Connect in-process: events sent on the returned sender are handled as
    /// coming from a fresh endpoint; dropping the sender closes it
    pub fn attach(
        &self,
    ) -> (
        mpsc::UnboundedSender<ClientEvent>,
        mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        let (endpoint_id, outbound) = self.open();
        let (tx, mut inbound) = mpsc::unbounded_channel::<ClientEvent>();
        let relay = self.clone();

        tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                relay.handle(&endpoint_id, event);
            }
            relay.close(&endpoint_id);
        });

        (tx, outbound)
    }

    /// Handle one event from `from`
    pub fn handle(&self, from: &str, event: ClientEvent) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        log::debug!("Relay <- {from}: {}", event.name());

        match event {
            ClientEvent::SetupEntity { id, name, avatar } => {
                let result = state
                    .registry
                    .register(&id, from, DisplayMeta { name, avatar });
                if let Err(e) = &result {
                    log::warn!("SetupEntity for {id} rejected: {e}");
                } else {
                    log::info!("Entity {id} registered on endpoint {from}");
                }
                state.send(from, ServerEvent::SetupResult(result.is_ok()));
            }
            ClientEvent::ListEntities { page, sort } => {
                let rows = state.registry.list(page, sort.unwrap_or(SortMode::ByName));
                state.send(from, ServerEvent::ListEntitiesResponse(rows));
            }
            ClientEvent::GetEntityMeta { id, .. } => {
                let meta = state.registry.resolve(&id);
                state.send(from, ServerEvent::EntityMetaResponse(meta));
            }
            ClientEvent::SendPeerRequest(mut request) => {
                request.caller = from.to_string();
                let target = request.target.clone();
                state.send(&target, ServerEvent::PeerConnectionRequest(request));
            }
            ClientEvent::AcceptPeerRequest(request) => {
                let target = request.target.clone();
                state.send(&target, ServerEvent::PeerConnectionAccepted(request));
            }
            ClientEvent::IceCandidate(candidate) => {
                let target = candidate.target.clone();
                state.send(&target, ServerEvent::IceCandidate(candidate));
            }
            ClientEvent::PushNotification {
                targets,
                notif,
                from: sender,
            } => {
                for target in targets {
                    let meta = state.registry.resolve(&target);
                    if let Some(endpoint) = meta.client_id.filter(|_| meta.available) {
                        state.send(
                            &endpoint,
                            ServerEvent::PushNotification {
                                notif: notif.clone(),
                                from: sender.clone(),
                            },
                        );
                    }
                }
            }
        }
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.state.lock().map(|s| s.connections.len()).unwrap_or(0)
    }
}

impl RelayState {
    // Best effort: a missing or closed target drops the event.
    fn send(&self, endpoint_id: &str, event: ServerEvent) -> bool {
        match self.connections.get(endpoint_id) {
            Some(tx) if tx.send(event).is_ok() => true,
            _ => {
                log::debug!("Dropping relay event for unreachable endpoint {endpoint_id}");
                false
            }
        }
    }
}
