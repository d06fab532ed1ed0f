//! Per-peer connection.
//!
//! A [`PeerChannel`] owns at most one transport to its peer. It negotiates
//! through the relay, confirms the path with a `connected` handshake, frames
//! commands as JSON envelopes and moves large payloads as chunked transfers.
//! Command semantics live in the [`Dispatcher`] handed to it; the channel only
//! handles the handshake and transfer control itself.
//!
//! When both sides offer at once, the side with the smaller entity id keeps
//! its offer and the other answers. A negotiation that does not reach
//! `Connected` within the connect timeout is abandoned.
//!
//! Each transport gets one driver task reading its events. Everything that is
//! not handshake or transfer control is queued to a per-channel dispatch task,
//! so handlers run one at a time in arrival order and may wait for a
//! `data.ack` without stalling the driver.

pub mod dispatch;
pub mod envelope;
pub mod transfer;

pub use dispatch::{DispatchOutcome, Dispatcher, Handler};
pub use envelope::{CommandKind, Connected, DataBegin, DataEnd, Envelope, JSON_MIME};
pub use transfer::{Completed, FileStore, InboundTransfer};

use crate::relay::{CandidateMessage, ClientEvent, PeerRequest, RelaySession};
use crate::transport::{
    Frame, IceCandidate, PeerTransport, SessionDescription, TransportEvent, TransportEvents,
    TransportFactory,
};
use crate::utils::{
    ChannelError, EventBus, PeerwayConfig, PeerwayError, ProtocolError, Result,
};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Connection state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Never connected
    Idle,
    /// Negotiating or waiting for the handshake
    Connecting,
    /// Handshake complete
    Connected,
    /// Closed or lost; may reconnect
    Disconnected,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Which side started the negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the offer
    Caller,
    /// Answered an offer
    Answerer,
}

/// Limits applied by every channel
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// Largest single transport frame
    pub max_frame_size: usize,
    /// Largest accepted transfer
    pub max_transfer_size: usize,
    /// How long a sender waits for `data.ack`
    pub ack_timeout: Duration,
    /// How long a negotiation may stay in `Connecting`
    pub connect_timeout: Duration,
}

impl ChannelSettings {
    /// Settings taken from the configuration
    pub fn from_config(config: &PeerwayConfig) -> Self {
        Self {
            max_frame_size: config.network.max_frame_size,
            max_transfer_size: config.network.max_transfer_size,
            ack_timeout: config.network.ack_timeout(),
            connect_timeout: config.network.connect_timeout(),
        }
    }
}

/// Collaborators shared by every channel of one entity
pub struct ChannelContext {
    /// Local entity id
    pub local_id: String,
    /// Relay used for negotiation
    pub relay: RelaySession,
    /// Creates transports
    pub factory: Arc<dyn TransportFactory>,
    /// Command handlers
    pub dispatcher: Dispatcher,
    /// Where received files land
    pub files: FileStore,
    /// Limits
    pub settings: ChannelSettings,
}

struct ChannelState {
    status: TransportState,
    role: Role,
    generation: u64,
    transport: Option<Arc<dyn PeerTransport>>,
    remote_endpoint: Option<String>,
    remote_description_set: bool,
    pending_local: VecDeque<IceCandidate>,
    pending_remote: VecDeque<IceCandidate>,
    inbound: Option<InboundTransfer>,
    transport_open: bool,
    handshake_received: bool,
}

/// Connection to one peer
pub struct PeerChannel {
    peer_id: String,
    ctx: Arc<ChannelContext>,
    state: Mutex<ChannelState>,
    negotiation: tokio::sync::Mutex<()>,
    outbound: tokio::sync::Mutex<()>,
    ack_waiter: Mutex<Option<oneshot::Sender<()>>>,
    acks_received: AtomicUsize,
    dispatch_tx: mpsc::UnboundedSender<Envelope>,
    online: EventBus<bool>,
    established: EventBus<()>,
}

impl PeerChannel {
    /// Create an idle channel and start its dispatch task
    pub fn new(peer_id: impl Into<String>, ctx: Arc<ChannelContext>) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            peer_id: peer_id.into(),
            ctx,
            state: Mutex::new(ChannelState {
                status: TransportState::Idle,
                role: Role::Caller,
                generation: 0,
                transport: None,
                remote_endpoint: None,
                remote_description_set: false,
                pending_local: VecDeque::new(),
                pending_remote: VecDeque::new(),
                inbound: None,
                transport_open: false,
                handshake_received: false,
            }),
            negotiation: tokio::sync::Mutex::new(()),
            outbound: tokio::sync::Mutex::new(()),
            ack_waiter: Mutex::new(None),
            acks_received: AtomicUsize::new(0),
            dispatch_tx,
            online: EventBus::new(),
            established: EventBus::new(),
        });

        tokio::spawn(dispatch_loop(Arc::downgrade(&channel), dispatch_rx));
        channel
    }

    /// Remote entity id
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Current state
    pub fn state(&self) -> TransportState {
        self.lock_state()
            .map(|s| s.status)
            .unwrap_or(TransportState::Disconnected)
    }

    /// Role of the current or last negotiation
    pub fn role(&self) -> Role {
        self.lock_state().map(|s| s.role).unwrap_or(Role::Caller)
    }

    /// True once the handshake completed
    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    /// Relay endpoint of the peer, once known
    pub fn remote_endpoint(&self) -> Option<String> {
        self.lock_state().ok().and_then(|s| s.remote_endpoint.clone())
    }

    /// Fires `true` on handshake completion, `false` when unavailable or lost
    pub fn online_events(&self) -> &EventBus<bool> {
        &self.online
    }

    /// Fires on handshake completion, Caller side only
    pub fn established_events(&self) -> &EventBus<()> {
        &self.established
    }

    /// `data.ack`s received so far
    pub fn acks_received(&self) -> usize {
        self.acks_received.load(Ordering::SeqCst)
    }

    /// Connect as Caller
    ///
    /// Without a known endpoint the peer is resolved through the relay first.
    /// An unavailable peer leaves the channel unconnected and fires
    /// `online(false)`.
    pub async fn connect(self: &Arc<Self>, endpoint: Option<String>) -> Result<()> {
        if self.is_connected() {
            log::debug!("Channel to {} already connected", self.peer_id);
            return Ok(());
        }

        let endpoint = match endpoint {
            Some(endpoint) => endpoint,
            None => {
                let meta = self.ctx.relay.resolve(&self.peer_id).await?;
                match meta.client_id.filter(|_| meta.available) {
                    Some(endpoint) => endpoint,
                    None => {
                        log::info!("Peer {} is not available on the relay", self.peer_id);
                        self.online.emit(false);
                        return Ok(());
                    }
                }
            }
        };

        let _negotiating = self.negotiation.lock().await;
        if self.is_answering() {
            log::debug!("Offer from {} already being answered", self.peer_id);
            return Ok(());
        }
        let transport = self.replace_transport(Role::Caller, &endpoint).await?;

        let offer = transport.create_offer().await?;
        transport.set_local_description(&offer).await?;
        self.ctx
            .relay
            .send(ClientEvent::SendPeerRequest(PeerRequest {
                local: self.ctx.local_id.clone(),
                remote: self.peer_id.clone(),
                target: endpoint.clone(),
                caller: String::new(),
                sdp: offer,
            }))?;

        log::info!("Offer sent to {} at {endpoint}", self.peer_id);
        Ok(())
    }

    /// Answer an offer relayed from `caller_endpoint`
    pub async fn accept_offer(
        self: &Arc<Self>,
        caller_endpoint: &str,
        offer: &SessionDescription,
    ) -> Result<()> {
        let _negotiating = self.negotiation.lock().await;
        if self.keeps_own_offer()? {
            log::debug!(
                "Offers crossed with {}; keeping ours, theirs is dropped",
                self.peer_id
            );
            return Ok(());
        }
        let transport = self
            .replace_transport(Role::Answerer, caller_endpoint)
            .await?;

        transport.set_remote_description(offer).await?;
        self.remote_description_applied(&transport).await?;

        let answer = transport.create_answer().await?;
        transport.set_local_description(&answer).await?;
        self.ctx
            .relay
            .send(ClientEvent::AcceptPeerRequest(PeerRequest {
                local: self.ctx.local_id.clone(),
                remote: self.peer_id.clone(),
                target: caller_endpoint.to_string(),
                caller: caller_endpoint.to_string(),
                sdp: answer,
            }))?;

        log::info!("Answered offer from {}", self.peer_id);
        Ok(())
    }

    /// Apply the answer to our offer
    pub async fn accept_answer(&self, answer: &SessionDescription) -> Result<()> {
        let _negotiating = self.negotiation.lock().await;
        let transport = {
            let state = self.lock_state()?;
            match (&state.transport, state.role, state.remote_description_set) {
                (Some(transport), Role::Caller, false) => Arc::clone(transport),
                _ => {
                    return Err(PeerwayError::violation(format!(
                        "unexpected answer from {}",
                        self.peer_id
                    )))
                }
            }
        };

        transport.set_remote_description(answer).await?;
        self.remote_description_applied(&transport).await
    }

    /// Apply a candidate relayed from the peer; queued until the remote
    /// description is set
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let _negotiating = self.negotiation.lock().await;
        let transport = {
            let mut state = self.lock_state()?;
            let Some(transport) = state.transport.clone() else {
                log::debug!("Dropping candidate from {}: no transport", self.peer_id);
                return Ok(());
            };
            if !state.remote_description_set {
                state.pending_remote.push_back(candidate);
                return Ok(());
            }
            transport
        };
        transport.add_ice_candidate(&candidate).await
    }

    /// Send a command; false unless connected and handed to the transport
    ///
    /// Envelopes larger than one frame go out as a chunked JSON transfer.
    pub async fn send_request(&self, envelope: &Envelope) -> bool {
        if !self.is_connected() {
            log::debug!(
                "Not sending {} to {}: channel is {}",
                envelope.kind,
                self.peer_id,
                self.state()
            );
            return false;
        }

        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Failed to encode {}: {e}", envelope.kind);
                return false;
            }
        };

        let result = if text.len() > self.ctx.settings.max_frame_size {
            self.send_data(text.into_bytes(), JSON_MIME, "").await
        } else {
            self.send_frame(Frame::Text(text)).await
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Sending {} to {} failed: {e}", envelope.kind, self.peer_id);
                false
            }
        }
    }

    /// Send bytes as a chunked transfer and wait for the peer's `data.ack`
    ///
    /// Only one outbound transfer runs at a time; later calls wait their turn.
    pub async fn send_data(&self, bytes: Vec<u8>, mime: &str, filename: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected {
                peer_id: self.peer_id.clone(),
            }
            .into());
        }
        let settings = &self.ctx.settings;
        if bytes.len() > settings.max_transfer_size {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                max: settings.max_transfer_size,
            }
            .into());
        }

        let _transfer = self.outbound.lock().await;
        let (ack_tx, ack_rx) = oneshot::channel();
        if let Ok(mut waiter) = self.ack_waiter.lock() {
            *waiter = Some(ack_tx);
        }

        let sent = self.stream_transfer(&bytes, mime, filename).await;
        let result = match sent {
            Ok(()) => match tokio::time::timeout(settings.ack_timeout, ack_rx).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(ChannelError::NotConnected {
                    peer_id: self.peer_id.clone(),
                }
                .into()),
                Err(_) => Err(PeerwayError::timeout(format!(
                    "data.ack for {filename:?} from {}",
                    self.peer_id
                ))),
            },
            Err(e) => Err(e),
        };

        if let Ok(mut waiter) = self.ack_waiter.lock() {
            waiter.take();
        }
        result
    }

    /// Send a stored file under its own name
    pub async fn send_file(&self, mime: &str, filename: &str) -> Result<()> {
        let bytes = self.ctx.files.read(mime, filename).await?;
        self.send_data(bytes, mime, filename).await
    }

    /// Tear the transport down
    pub async fn close(&self) {
        let (transport, was_connected) = match self.lock_state() {
            Ok(mut state) => {
                let was_connected = state.status == TransportState::Connected;
                state.generation += 1;
                state.status = TransportState::Disconnected;
                state.inbound = None;
                (state.transport.take(), was_connected)
            }
            Err(_) => return,
        };

        if let Some(transport) = transport {
            transport.close().await;
        }
        if was_connected {
            self.online.emit(false);
        }
        log::info!("Channel to {} closed", self.peer_id);
    }

    fn is_answering(&self) -> bool {
        self.lock_state()
            .map(|s| s.status == TransportState::Connecting && s.role == Role::Answerer)
            .unwrap_or(false)
    }

    // Crossed offers: the smaller id stays Caller.
    fn keeps_own_offer(&self) -> Result<bool> {
        let state = self.lock_state()?;
        Ok(state.status == TransportState::Connecting
            && state.role == Role::Caller
            && self.ctx.local_id < self.peer_id)
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, ChannelState>> {
        self.state
            .lock()
            .map_err(|_| PeerwayError::unexpected("channel state poisoned"))
    }

    async fn replace_transport(
        self: &Arc<Self>,
        role: Role,
        endpoint: &str,
    ) -> Result<Arc<dyn PeerTransport>> {
        let (transport, events) = self.ctx.factory.create(&self.peer_id)?;

        let (generation, previous) = {
            let mut state = self.lock_state()?;
            state.generation += 1;
            state.status = TransportState::Connecting;
            state.role = role;
            state.remote_endpoint = Some(endpoint.to_string());
            state.remote_description_set = false;
            state.pending_local.clear();
            state.pending_remote.clear();
            state.inbound = None;
            state.transport_open = false;
            state.handshake_received = false;
            (state.generation, state.transport.replace(Arc::clone(&transport)))
        };

        if let Some(previous) = previous {
            log::debug!("Replacing transport to {}", self.peer_id);
            previous.close().await;
        }

        tokio::spawn(drive(Arc::downgrade(self), generation, events));
        tokio::spawn(watch_negotiation(
            Arc::downgrade(self),
            generation,
            self.ctx.settings.connect_timeout,
        ));
        Ok(transport)
    }

    async fn abandon_negotiation(&self, generation: u64) {
        let transport = match self.lock_state() {
            Ok(mut state)
                if state.generation == generation && state.status == TransportState::Connecting =>
            {
                state.generation += 1;
                state.status = TransportState::Disconnected;
                state.inbound = None;
                state.transport.take()
            }
            _ => return,
        };

        log::warn!(
            "Negotiation with {} timed out after {:?}",
            self.peer_id,
            self.ctx.settings.connect_timeout
        );
        if let Some(transport) = transport {
            transport.close().await;
        }
        self.online.emit(false);
    }

    // Flush both candidate queues in arrival order.
    async fn remote_description_applied(&self, transport: &Arc<dyn PeerTransport>) -> Result<()> {
        let remote = {
            let mut state = self.lock_state()?;
            state.remote_description_set = true;
            while let Some(candidate) = state.pending_local.pop_front() {
                self.relay_candidate(&state, candidate);
            }
            std::mem::take(&mut state.pending_remote)
        };

        for candidate in remote {
            transport.add_ice_candidate(&candidate).await?;
        }
        Ok(())
    }

    fn relay_candidate(&self, state: &ChannelState, candidate: IceCandidate) {
        let Some(target) = state.remote_endpoint.clone() else {
            return;
        };
        let message = CandidateMessage {
            local: self.ctx.local_id.clone(),
            remote: self.peer_id.clone(),
            target,
            candidate,
        };
        if let Err(e) = self.ctx.relay.send(ClientEvent::IceCandidate(message)) {
            log::warn!("Failed to relay candidate to {}: {e}", self.peer_id);
        }
    }

    fn current_transport(&self) -> Result<Arc<dyn PeerTransport>> {
        self.lock_state()?
            .transport
            .clone()
            .ok_or_else(|| {
                ChannelError::NotConnected {
                    peer_id: self.peer_id.clone(),
                }
                .into()
            })
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.current_transport()?.send(frame).await
    }

    async fn send_control(&self, envelope: &Envelope) -> Result<()> {
        self.send_frame(Frame::Text(envelope.to_json()?)).await
    }

    async fn stream_transfer(&self, bytes: &[u8], mime: &str, filename: &str) -> Result<()> {
        self.send_control(&Envelope::new(
            CommandKind::DataBegin,
            &DataBegin {
                mime: mime.to_string(),
                size: bytes.len(),
                filename: filename.to_string(),
            },
        )?)
        .await?;

        for chunk in bytes.chunks(self.ctx.settings.max_frame_size.max(1)) {
            self.send_frame(Frame::Binary(chunk.to_vec())).await?;
        }

        self.send_control(&Envelope::new(
            CommandKind::DataEnd,
            &DataEnd {
                mime: mime.to_string(),
                filename: filename.to_string(),
            },
        )?)
        .await?;

        log::debug!(
            "Sent {} bytes ({mime}) to {} as {filename:?}",
            bytes.len(),
            self.peer_id
        );
        Ok(())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock_state()
            .map(|s| s.generation == generation)
            .unwrap_or(false)
    }

    async fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Ok(mut state) = self.lock_state() {
                    if state.remote_description_set {
                        self.relay_candidate(&state, candidate);
                    } else {
                        state.pending_local.push_back(candidate);
                    }
                }
            }
            TransportEvent::Open => {
                if let Ok(mut state) = self.lock_state() {
                    state.transport_open = true;
                }
                let hello = Envelope::new(
                    CommandKind::Connected,
                    &Connected {
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    },
                );
                match hello {
                    Ok(hello) => {
                        if let Err(e) = self.send_control(&hello).await {
                            log::warn!("Handshake to {} failed: {e}", self.peer_id);
                        }
                    }
                    Err(e) => log::warn!("Failed to build handshake: {e}"),
                }
                self.maybe_connected();
            }
            TransportEvent::Frame(Frame::Text(text)) => match Envelope::from_json(&text) {
                Ok(envelope) => self.on_envelope(envelope).await,
                Err(e) => log::warn!("Malformed envelope from {}: {e}", self.peer_id),
            },
            TransportEvent::Frame(Frame::Binary(chunk)) => self.on_chunk(&chunk),
            TransportEvent::Closed => {
                let was_connected = match self.lock_state() {
                    Ok(mut state) => {
                        let was_connected = state.status == TransportState::Connected;
                        state.status = TransportState::Disconnected;
                        state.transport = None;
                        state.inbound = None;
                        was_connected
                    }
                    Err(_) => false,
                };
                if let Ok(mut waiter) = self.ack_waiter.lock() {
                    waiter.take();
                }
                log::info!("Transport to {} closed", self.peer_id);
                if was_connected {
                    self.online.emit(false);
                }
            }
        }
    }

    async fn on_envelope(&self, envelope: Envelope) {
        match envelope.command() {
            Some(CommandKind::Connected) => {
                if let Ok(mut state) = self.lock_state() {
                    state.handshake_received = true;
                }
                self.maybe_connected();
            }
            Some(CommandKind::DataBegin) => match envelope.decode::<DataBegin>() {
                Ok(header) => self.on_begin(header),
                Err(e) => log::warn!("Bad data.begin from {}: {e}", self.peer_id),
            },
            Some(CommandKind::DataEnd) => match envelope.decode::<DataEnd>() {
                Ok(end) => self.on_end(end).await,
                Err(e) => log::warn!("Bad data.end from {}: {e}", self.peer_id),
            },
            Some(CommandKind::DataAck) => {
                self.acks_received.fetch_add(1, Ordering::SeqCst);
                let waiter = self.ack_waiter.lock().ok().and_then(|mut w| w.take());
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(());
                    }
                    None => log::debug!("Unsolicited data.ack from {}", self.peer_id),
                }
            }
            _ => self.enqueue(envelope),
        }
    }

    fn enqueue(&self, envelope: Envelope) {
        if self.dispatch_tx.send(envelope).is_err() {
            log::warn!("Dispatch queue for {} is gone", self.peer_id);
        }
    }

    fn maybe_connected(&self) {
        let fire = match self.lock_state() {
            Ok(mut state) => {
                let ready = state.transport_open
                    && state.handshake_received
                    && state.status == TransportState::Connecting;
                if ready {
                    state.status = TransportState::Connected;
                }
                ready.then_some(state.role)
            }
            Err(_) => None,
        };

        if let Some(role) = fire {
            log::info!("Channel to {} connected ({role:?})", self.peer_id);
            self.online.emit(true);
            if role == Role::Caller {
                self.established.emit(());
            }
        }
    }

    fn on_begin(&self, header: DataBegin) {
        let Ok(mut state) = self.lock_state() else {
            return;
        };
        if state.inbound.is_some() {
            log::warn!(
                "Protocol violation from {}: data.begin while a transfer is pending",
                self.peer_id
            );
            return;
        }
        match InboundTransfer::begin(header, self.ctx.settings.max_transfer_size) {
            Ok(transfer) => state.inbound = Some(transfer),
            Err(e) => log::warn!("Refused transfer from {}: {e}", self.peer_id),
        }
    }

    fn on_chunk(&self, chunk: &[u8]) {
        let Ok(mut state) = self.lock_state() else {
            return;
        };
        let Some(transfer) = state.inbound.as_mut() else {
            log::warn!(
                "Protocol violation from {}: binary frame without data.begin",
                self.peer_id
            );
            return;
        };
        if let Err(e) = transfer.append(chunk) {
            log::warn!(
                "Discarding transfer from {} after {} bytes: {e}",
                self.peer_id,
                transfer.received()
            );
            state.inbound = None;
        }
    }

    async fn on_end(&self, end: DataEnd) {
        let transfer = self.lock_state().ok().and_then(|mut s| s.inbound.take());
        let Some(transfer) = transfer else {
            log::warn!(
                "Protocol violation from {}: data.end without data.begin",
                self.peer_id
            );
            return;
        };

        let stored = match transfer.finish(&end) {
            Ok(Completed::File {
                mime,
                filename,
                bytes,
            }) => self
                .ctx
                .files
                .save(&mime, &filename, &bytes)
                .await
                .map(|path| log::info!("Received {} from {}", path.display(), self.peer_id)),
            Ok(Completed::Envelope(envelope)) => {
                self.enqueue(envelope);
                Ok(())
            }
            Err(e) => Err(e),
        };

        match stored {
            Ok(()) => {
                if let Err(e) = self.send_control(&Envelope::bare(CommandKind::DataAck)).await {
                    log::warn!("Failed to acknowledge transfer to {}: {e}", self.peer_id);
                }
            }
            Err(e) => log::warn!("Discarded transfer from {}: {e}", self.peer_id),
        }
    }
}

impl fmt::Debug for PeerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerChannel")
            .field("peer_id", &self.peer_id)
            .field("state", &self.state())
            .finish()
    }
}

async fn drive(channel: Weak<PeerChannel>, generation: u64, mut events: TransportEvents) {
    while let Some(event) = events.recv().await {
        let Some(channel) = channel.upgrade() else {
            return;
        };
        if !channel.is_current(generation) {
            log::trace!("Ignoring event from stale transport to {}", channel.peer_id);
            return;
        }
        channel.on_transport_event(event).await;
    }
}

async fn watch_negotiation(channel: Weak<PeerChannel>, generation: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    if let Some(channel) = channel.upgrade() {
        channel.abandon_negotiation(generation).await;
    }
}

async fn dispatch_loop(channel: Weak<PeerChannel>, mut queue: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = queue.recv().await {
        let Some(channel) = channel.upgrade() else {
            return;
        };
        let ctx = Arc::clone(&channel.ctx);
        ctx.dispatcher.dispatch(channel, envelope).await;
    }
}
