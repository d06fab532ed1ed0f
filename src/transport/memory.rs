//! In-process transport network.
//!
//! Offers carry a token; the caller's candidates name that token and the
//! answerer links to the offering side when it applies the first one. Used
//! by the test suite and for single-process demos.

use super::{
    transport_error, Frame, IceCandidate, PeerTransport, SdpKind, SessionDescription,
    TransportEvent, TransportEvents, TransportFactory,
};
use crate::utils::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Candidates each offer emits unless configured otherwise
pub const DEFAULT_CANDIDATES: usize = 3;

struct NetInner {
    offers: Mutex<HashMap<String, Arc<Side>>>,
    applied: Mutex<Vec<String>>,
    created: AtomicUsize,
    candidates: usize,
}

/// Shared in-memory network; clones see the same offers
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::with_candidates(DEFAULT_CANDIDATES)
    }
}

impl MemoryNetwork {
    /// Network whose offers emit three candidates
    pub fn new() -> Self {
        Self::default()
    }

    /// Network whose offers emit `count` candidates
    pub fn with_candidates(count: usize) -> Self {
        Self {
            inner: Arc::new(NetInner {
                offers: Mutex::new(HashMap::new()),
                applied: Mutex::new(Vec::new()),
                created: AtomicUsize::new(0),
                candidates: count.max(1),
            }),
        }
    }

    /// Transports created so far
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    /// Every candidate applied on any transport, in application order
    pub fn applied_candidates(&self) -> Vec<String> {
        self.inner
            .applied
            .lock()
            .map(|applied| applied.clone())
            .unwrap_or_default()
    }
}

impl TransportFactory for MemoryNetwork {
    fn create(&self, peer_id: &str) -> Result<(Arc<dyn PeerTransport>, TransportEvents)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.created.fetch_add(1, Ordering::SeqCst);
        log::trace!("Memory transport created for {peer_id}");

        let transport = MemoryTransport {
            network: Arc::clone(&self.inner),
            side: Arc::new(Side {
                events: tx,
                state: Mutex::new(SideState::default()),
            }),
        };
        Ok((Arc::new(transport), rx))
    }
}

struct Side {
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<SideState>,
}

#[derive(Default)]
struct SideState {
    token: Option<String>,
    remote_token: Option<String>,
    remote_set: bool,
    peer: Option<Arc<Side>>,
    opened: bool,
    closed: bool,
}

impl Side {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn try_open(&self) {
        let ready = match self.state.lock() {
            Ok(mut state) => {
                let ready =
                    !state.opened && !state.closed && state.remote_set && state.peer.is_some();
                if ready {
                    state.opened = true;
                }
                ready
            }
            Err(_) => false,
        };
        if ready {
            self.emit(TransportEvent::Open);
        }
    }
}

struct MemoryTransport {
    network: Arc<NetInner>,
    side: Arc<Side>,
}

impl MemoryTransport {
    fn with_state<T>(&self, f: impl FnOnce(&mut SideState) -> T) -> Result<T> {
        let mut state = self
            .side
            .state
            .lock()
            .map_err(|_| transport_error("memory transport state poisoned"))?;
        Ok(f(&mut state))
    }

    fn link(&self, offering: Arc<Side>) -> Result<()> {
        if let Ok(mut state) = offering.state.lock() {
            state.peer = Some(Arc::clone(&self.side));
        }
        self.with_state(|state| state.peer = Some(Arc::clone(&offering)))?;

        self.side.try_open();
        offering.try_open();
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let token = Uuid::new_v4().simple().to_string();
        self.with_state(|state| state.token = Some(token.clone()))?;

        if let Ok(mut offers) = self.network.offers.lock() {
            offers.insert(token.clone(), Arc::clone(&self.side));
        }
        Ok(SessionDescription::offer(token))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let token = self
            .with_state(|state| state.remote_token.clone())?
            .ok_or_else(|| transport_error("answer requested before an offer was applied"))?;
        Ok(SessionDescription::answer(token))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<()> {
        if description.kind == SdpKind::Offer {
            for i in 0..self.network.candidates {
                self.side.emit(TransportEvent::LocalCandidate(IceCandidate::new(format!(
                    "mem {} {i}",
                    description.sdp
                ))));
            }
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        self.with_state(|state| {
            if description.kind == SdpKind::Offer {
                state.remote_token = Some(description.sdp.clone());
            }
            state.remote_set = true;
        })?;
        self.side.try_open();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let (remote_set, remote_token, linked) = self.with_state(|state| {
            (state.remote_set, state.remote_token.clone(), state.peer.is_some())
        })?;
        if !remote_set {
            return Err(transport_error("candidate applied before remote description"));
        }

        if let Ok(mut applied) = self.network.applied.lock() {
            applied.push(candidate.candidate.clone());
        }

        let Some(remote_token) = remote_token else {
            return Ok(());
        };
        if linked {
            return Ok(());
        }

        let named = candidate.candidate.split_whitespace().nth(1);
        if named != Some(remote_token.as_str()) {
            return Err(transport_error(format!(
                "candidate {} does not match the applied offer",
                candidate.candidate
            )));
        }

        let offering = self
            .network
            .offers
            .lock()
            .ok()
            .and_then(|mut offers| offers.remove(&remote_token));
        match offering {
            Some(offering) => self.link(offering),
            None => Err(transport_error("offering side is gone")),
        }
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        let peer = self.with_state(|state| {
            if state.opened {
                state.peer.clone()
            } else {
                None
            }
        })?;
        let peer = peer.ok_or_else(|| transport_error("memory transport is not open"))?;

        peer.events
            .send(TransportEvent::Frame(frame))
            .map_err(|_| transport_error("remote side dropped its transport"))
    }

    async fn close(&self) {
        let Ok((peer, token)) = self.with_state(|state| {
            state.closed = true;
            (state.peer.take(), state.token.take())
        }) else {
            return;
        };

        if let Some(token) = token {
            if let Ok(mut offers) = self.network.offers.lock() {
                offers.remove(&token);
            }
        }
        if let Some(peer) = peer {
            if let Ok(mut state) = peer.state.lock() {
                state.peer = None;
            }
            peer.emit(TransportEvent::Closed);
        }
    }
}
