//! The orchestrator.
//!
//! [`Peerway`] owns everything one entity needs: its relay session, the pool
//! of peer channels (one per peer id), the certificates it issued, the
//! database handle and the file store. It routes relay traffic to channels,
//! installs the command handlers on them and drives sync rounds.

pub mod handlers;

use crate::channel::{
    ChannelContext, ChannelSettings, CommandKind, Envelope, FileStore, PeerChannel,
    TransportState,
};
use crate::crypto::{Certificate, CertificateAuthority, Entity, Profile, StoredCertificate};
use crate::relay::{ClientEvent, EntityListing, RelaySession, ServerEvent, SortMode};
use crate::storage::{
    Chat, Database, MediaRef, Message, Peer, Post, ISSUED_CERTIFICATE_PREFIX, PROFILE_KEY,
};
use crate::sync::{build_request, SyncOptions, SyncOutcome};
use crate::transport::TransportFactory;
use crate::utils::{
    ChannelError, EventBus, EventReceiver, PeerwayConfig, PeerwayError, RelayError, Result,
};
use chrono::Utc;
use futures::future::join_all;
use handlers::{CertIssue, ChatInvite, ChatMessage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Push notification relayed from another entity
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Sending entity
    pub from: String,
    /// Opaque notification body
    pub notif: serde_json::Value,
}

/// Observable orchestrator events
#[derive(Default)]
pub struct PeerwayEvents {
    /// Relay push notifications
    pub notification: EventBus<Notification>,
    /// Chat messages received
    pub message: EventBus<Message>,
    /// Peer profile updates applied
    pub peer_updated: EventBus<Peer>,
    /// Posts received
    pub post: EventBus<Post>,
    /// Peer came online (`true`) or went away / is unavailable (`false`)
    pub online: EventBus<(String, bool)>,
    /// Sync requests answered
    pub synced: EventBus<(String, SyncOutcome)>,
}

pub(crate) struct Inner {
    entity: Entity,
    config: PeerwayConfig,
    db: Arc<dyn Database>,
    ctx: Arc<ChannelContext>,
    channels: Mutex<HashMap<String, Arc<PeerChannel>>>,
    authority: CertificateAuthority,
    profile: RwLock<Profile>,
    verifications: Mutex<HashMap<String, Vec<oneshot::Sender<bool>>>>,
    events: PeerwayEvents,
}

/// One entity on the overlay
#[derive(Clone)]
pub struct Peerway {
    inner: Arc<Inner>,
}

impl Peerway {
    /// Assemble an orchestrator; nothing runs until [`Peerway::start`]
    pub fn new(
        entity: Entity,
        config: PeerwayConfig,
        db: Arc<dyn Database>,
        relay: RelaySession,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let ctx = Arc::new(ChannelContext {
                local_id: entity.id().to_string(),
                relay,
                factory,
                dispatcher: handlers::build(weak),
                files: FileStore::new(config.storage.files_dir.clone()),
                settings: ChannelSettings::from_config(&config),
            });
            Inner {
                profile: RwLock::new(entity.profile().clone()),
                entity,
                config,
                db,
                ctx,
                channels: Mutex::new(HashMap::new()),
                authority: CertificateAuthority::new(),
                verifications: Mutex::new(HashMap::new()),
                events: PeerwayEvents::default(),
            }
        });
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Start routing relay events and register on the relay
    ///
    /// # Errors
    ///
    /// `RelayError::RegistrationRefused` if the relay rejects the entity
    pub async fn start(&self, events: mpsc::UnboundedReceiver<ServerEvent>) -> Result<()> {
        if let Some(profile) = self.inner.db.setting(PROFILE_KEY).await? {
            let profile: Profile = serde_json::from_value(profile)?;
            if let Ok(mut current) = self.inner.profile.write() {
                *current = profile;
            }
        }

        tokio::spawn(relay_loop(Arc::downgrade(&self.inner), events));

        let profile = self.profile();
        let accepted = self
            .inner
            .ctx
            .relay
            .setup_entity(self.id(), &profile.name, profile.avatar.clone())
            .await?;
        if !accepted {
            return Err(RelayError::RegistrationRefused {
                entity_id: self.id().to_string(),
            }
            .into());
        }

        log::info!("Entity {} registered on the relay", self.inner.entity);
        Ok(())
    }

    /// Local entity id
    pub fn id(&self) -> &str {
        self.inner.entity.id()
    }

    /// Local entity
    pub fn entity(&self) -> &Entity {
        &self.inner.entity
    }

    /// Current local profile
    pub fn profile(&self) -> Profile {
        self.inner
            .profile
            .read()
            .map(|p| p.clone())
            .unwrap_or_else(|_| self.inner.entity.profile().clone())
    }

    /// Event buses
    pub fn events(&self) -> &PeerwayEvents {
        &self.inner.events
    }

    /// Database handle
    pub fn db(&self) -> &Arc<dyn Database> {
        &self.inner.db
    }

    /// Where received files are stored
    pub fn files(&self) -> &FileStore {
        &self.inner.ctx.files
    }

    /// Connect to a peer, resolving it through the relay
    ///
    /// Blocked and unavailable peers are a silent no-op.
    pub async fn connect_to_peer(&self, peer_id: &str) -> Result<()> {
        if self.is_blocked(peer_id).await {
            log::info!("Not connecting to blocked peer {peer_id}");
            return Ok(());
        }
        self.channel(peer_id).connect(None).await
    }

    /// Send a command to a connected peer
    pub async fn send(&self, peer_id: &str, envelope: &Envelope) -> bool {
        if self.is_blocked(peer_id).await {
            return false;
        }
        match self.peer_channel(peer_id) {
            Some(channel) => channel.send_request(envelope).await,
            None => false,
        }
    }

    /// Send a command to several peers; returns how many accepted it
    pub async fn multicast(&self, peer_ids: &[String], envelope: &Envelope) -> usize {
        join_all(peer_ids.iter().map(|id| self.send(id, envelope)))
            .await
            .into_iter()
            .filter(|sent| *sent)
            .count()
    }

    /// Start a sync round with a connected peer
    pub async fn sync_peer(&self, peer_id: &str, force: bool) -> Result<bool> {
        let channel = self.connected_channel(peer_id).await?;

        let mut options = SyncOptions::from_settings(&self.inner.config.sync);
        options.force = force;
        let request = build_request(
            self.inner.db.as_ref(),
            self.id(),
            peer_id,
            &options,
            Utc::now(),
            false,
        )
        .await?;

        log::info!("Sync round with {peer_id} started");
        Ok(channel
            .send_request(&Envelope::new(CommandKind::Sync, &request)?)
            .await)
    }

    /// Sync several peers independently; one failure does not stop the rest
    pub async fn sync_peers(&self, peer_ids: &[String], force: bool) -> Vec<(String, Result<bool>)> {
        let results = join_all(peer_ids.iter().map(|id| self.sync_peer(id, force))).await;
        for (id, result) in peer_ids.iter().zip(&results) {
            if let Err(e) = result {
                log::warn!("Sync with {id} failed: {e}");
            }
        }
        peer_ids.iter().cloned().zip(results).collect()
    }

    /// Issue a fresh certificate to a connected peer
    pub async fn issue_certificate(&self, peer_id: &str) -> Result<Certificate> {
        let channel = self.connected_channel(peer_id).await?;

        let (certificate, stored) = self.inner.authority.issue(self.id(), peer_id);
        self.inner
            .db
            .set_setting(
                &format!("{ISSUED_CERTIFICATE_PREFIX}{peer_id}"),
                serde_json::to_value(&stored)?,
            )
            .await?;

        let issue = CertIssue {
            certificate: certificate.clone(),
        };
        if !channel
            .send_request(&Envelope::new(CommandKind::CertIssue, &issue)?)
            .await
        {
            return Err(ChannelError::NotConnected {
                peer_id: peer_id.to_string(),
            }
            .into());
        }

        log::info!("Issued certificate to {peer_id}");
        Ok(certificate)
    }

    /// Challenge a peer to present the certificate we issued it
    ///
    /// # Errors
    ///
    /// Fails if no certificate was issued, the peer is not connected, or no
    /// presentation arrives within the verification timeout.
    pub async fn verify_peer(&self, peer_id: &str) -> Result<bool> {
        let channel = self.connected_channel(peer_id).await?;
        self.restore_issued(peer_id).await?;
        if !self.inner.authority.has_issued(peer_id) {
            return Err(crate::utils::CryptoError::MissingCertificate {
                peer_id: peer_id.to_string(),
            }
            .into());
        }

        let (tx, rx) = oneshot::channel();
        if let Ok(mut waiters) = self.inner.verifications.lock() {
            waiters.entry(peer_id.to_string()).or_default().push(tx);
        }

        if !channel
            .send_request(&Envelope::bare(CommandKind::CertVerify))
            .await
        {
            drop(rx);
            self.prune_verifications(peer_id);
            return Err(ChannelError::NotConnected {
                peer_id: peer_id.to_string(),
            }
            .into());
        }

        let timeout = self.inner.config.network.verify_timeout();
        let answer = tokio::time::timeout(timeout, rx).await;
        match answer {
            Ok(Ok(verified)) => Ok(verified),
            Ok(Err(_)) => Err(PeerwayError::unexpected("verification waiter dropped")),
            Err(_) => {
                self.prune_verifications(peer_id);
                Err(PeerwayError::timeout(format!("cert.verify with {peer_id}")))
            }
        }
    }

    /// Outcome of the last verification of `peer_id`
    pub fn is_verified(&self, peer_id: &str) -> Option<bool> {
        self.inner.authority.is_verified(peer_id)
    }

    /// Start a chat with `members` and invite each of them
    pub async fn invite_to_chat(&self, name: &str, members: &[String]) -> Result<Chat> {
        let mut all = vec![self.id().to_string()];
        all.extend(members.iter().filter(|m| m.as_str() != self.id()).cloned());
        let chat = Chat {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            members: all,
            created: Utc::now(),
        };
        self.inner.db.save_chat(&chat).await?;

        let invite = Envelope::new(CommandKind::ChatInvite, &ChatInvite { chat: chat.clone() })?;
        let delivered = self.multicast(members, &invite).await;
        log::info!("Chat {} created, {delivered} invitations sent", chat.id);
        Ok(chat)
    }

    /// Post a message to a chat and deliver it to every connected member
    pub async fn send_chat_message(&self, chat_id: &str, content: &str, mime: &str) -> Result<Message> {
        let chat = self.inner.db.chat(chat_id).await?.ok_or_else(|| {
            crate::utils::StorageError::NotFound {
                key: format!("chat/{chat_id}"),
            }
        })?;

        let message = Message {
            chat_id: chat.id.clone(),
            id: Uuid::new_v4().to_string(),
            author_id: self.id().to_string(),
            created_at: Utc::now(),
            mime: mime.to_string(),
            content: content.to_string(),
        };
        self.inner
            .db
            .save_messages(std::slice::from_ref(&message))
            .await?;

        let payload = ChatMessage {
            chat: message.chat_id.clone(),
            id: Some(message.id.clone()),
            content: message.content.clone(),
            mime: message.mime.clone(),
            created_at: Some(message.created_at),
        };
        let envelope = Envelope::new(CommandKind::ChatMessage, &payload)?;
        let others: Vec<String> = chat
            .members
            .into_iter()
            .filter(|m| m != self.id())
            .collect();
        self.multicast(&others, &envelope).await;
        Ok(message)
    }

    /// Publish a post (or a new version of one) and announce it to subscribers
    pub async fn publish_post(
        &self,
        id: Option<&str>,
        content: &str,
        media: Vec<MediaRef>,
    ) -> Result<Post> {
        let previous = match id {
            Some(id) => self.inner.db.post(id).await?,
            None => None,
        };
        let post = Post {
            id: id.map_or_else(|| Uuid::new_v4().to_string(), str::to_string),
            author_id: self.id().to_string(),
            version: previous.as_ref().map_or(1, |p| p.version + 1),
            created_at: previous.map_or_else(Utc::now, |p| p.created_at),
            content: content.to_string(),
            media,
        };
        self.inner.db.save_post(&post).await?;

        let announcement = crate::sync::PostPublish {
            id: post.id.clone(),
            version: post.version,
            author_id: post.author_id.clone(),
        };
        let subscribers = self.inner.db.subscribers().await?;
        let reached = self
            .multicast(
                &subscribers,
                &Envelope::new(CommandKind::PostPublish, &announcement)?,
            )
            .await;
        log::info!("Published post {} v{} to {reached} subscribers", post.id, post.version);
        Ok(post)
    }

    /// Subscribe to a connected peer's posts
    pub async fn subscribe(&self, peer_id: &str) -> bool {
        self.send(peer_id, &Envelope::bare(CommandKind::PeerSub)).await
    }

    /// Unsubscribe from a connected peer's posts
    pub async fn unsubscribe(&self, peer_id: &str) -> bool {
        self.send(peer_id, &Envelope::bare(CommandKind::PeerUnsub)).await
    }

    /// Ask a connected peer for one of its files
    pub async fn request_media(&self, peer_id: &str, media: &MediaRef) -> Result<bool> {
        Ok(self
            .send(peer_id, &Envelope::new(CommandKind::MediaRequest, media)?)
            .await)
    }

    /// Change the local profile; peers pick it up on their next sync
    pub async fn set_profile(&self, name: &str, avatar: Option<String>) -> Result<Profile> {
        let profile = Profile {
            name: name.to_string(),
            avatar,
            updated: Utc::now(),
        };
        self.inner
            .db
            .set_setting(PROFILE_KEY, serde_json::to_value(&profile)?)
            .await?;
        if let Ok(mut current) = self.inner.profile.write() {
            *current = profile.clone();
        }
        Ok(profile)
    }

    /// Block or unblock a peer; blocking also drops its channel
    pub async fn set_blocked(&self, peer_id: &str, blocked: bool) -> Result<()> {
        let mut peer = self
            .inner
            .db
            .peer(peer_id)
            .await?
            .unwrap_or_else(|| Peer::new(peer_id));
        peer.blocked = blocked;
        self.inner.db.save_peer(&peer).await?;

        if blocked {
            self.close_peer(peer_id).await;
        }
        Ok(())
    }

    /// One page of the relay directory
    pub async fn list_entities(&self, page: usize, sort: SortMode) -> Result<Vec<EntityListing>> {
        self.inner.ctx.relay.list_entities(page, sort).await
    }

    /// Push a notification to entities through the relay
    pub fn push_notification(&self, targets: Vec<String>, notif: serde_json::Value) -> Result<()> {
        self.inner.ctx.relay.send(ClientEvent::PushNotification {
            targets,
            notif,
            from: self.id().to_string(),
        })
    }

    /// State of the channel to `peer_id`, if one exists
    pub fn channel_state(&self, peer_id: &str) -> Option<TransportState> {
        self.peer_channel(peer_id).map(|c| c.state())
    }

    /// Close and forget the channel to `peer_id`
    pub async fn close_peer(&self, peer_id: &str) {
        let channel = self
            .inner
            .channels
            .lock()
            .ok()
            .and_then(|mut channels| channels.remove(peer_id));
        if let Some(channel) = channel {
            channel.close().await;
        }
    }

    pub(crate) async fn is_blocked(&self, peer_id: &str) -> bool {
        match self.inner.db.peer(peer_id).await {
            Ok(peer) => peer.is_some_and(|p| p.blocked),
            Err(e) => {
                log::warn!("Could not read peer {peer_id}: {e}");
                false
            }
        }
    }

    pub(crate) async fn restore_issued(&self, peer_id: &str) -> Result<()> {
        if self.inner.authority.has_issued(peer_id) {
            return Ok(());
        }
        let key = format!("{ISSUED_CERTIFICATE_PREFIX}{peer_id}");
        if let Some(stored) = self.inner.db.setting(&key).await? {
            let stored: StoredCertificate = serde_json::from_value(stored)?;
            self.inner.authority.restore(peer_id, stored)?;
        }
        Ok(())
    }

    // Drop waiters whose caller gave up.
    fn prune_verifications(&self, peer_id: &str) {
        if let Ok(mut waiters) = self.inner.verifications.lock() {
            if let Some(pending) = waiters.get_mut(peer_id) {
                pending.retain(|tx| !tx.is_closed());
                if pending.is_empty() {
                    waiters.remove(peer_id);
                }
            }
        }
    }

    pub(crate) fn resolve_verification(&self, peer_id: &str, verified: bool) {
        let waiters = self
            .inner
            .verifications
            .lock()
            .ok()
            .and_then(|mut waiters| waiters.remove(peer_id))
            .unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(verified);
        }
    }

    /// The channel to `peer_id`, if one exists
    pub fn peer_channel(&self, peer_id: &str) -> Option<Arc<PeerChannel>> {
        self.inner
            .channels
            .lock()
            .ok()
            .and_then(|channels| channels.get(peer_id).cloned())
    }

    async fn connected_channel(&self, peer_id: &str) -> Result<Arc<PeerChannel>> {
        if self.is_blocked(peer_id).await {
            return Err(ChannelError::Blocked {
                peer_id: peer_id.to_string(),
            }
            .into());
        }
        self.peer_channel(peer_id)
            .filter(|c| c.is_connected())
            .ok_or_else(|| {
                ChannelError::NotConnected {
                    peer_id: peer_id.to_string(),
                }
                .into()
            })
    }

    // The pool owns one channel per peer; created on first use.
    fn channel(&self, peer_id: &str) -> Arc<PeerChannel> {
        let Ok(mut channels) = self.inner.channels.lock() else {
            return PeerChannel::new(peer_id, Arc::clone(&self.inner.ctx));
        };
        if let Some(channel) = channels.get(peer_id) {
            return Arc::clone(channel);
        }

        let channel = PeerChannel::new(peer_id, Arc::clone(&self.inner.ctx));
        tokio::spawn(forward_channel_events(
            Arc::downgrade(&self.inner),
            peer_id.to_string(),
            channel.online_events().subscribe(),
            channel.established_events().subscribe(),
        ));

        channels.insert(peer_id.to_string(), Arc::clone(&channel));
        channel
    }

    async fn on_relay_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::PeerConnectionRequest(request) => {
                if request.remote != self.id() {
                    log::warn!("Offer for {} reached {}", request.remote, self.id());
                    return;
                }
                if self.is_blocked(&request.local).await {
                    log::info!("Ignoring offer from blocked peer {}", request.local);
                    return;
                }
                let channel = self.channel(&request.local);
                if let Err(e) = channel.accept_offer(&request.caller, &request.sdp).await {
                    log::warn!("Could not answer {}: {e}", request.local);
                }
            }
            ServerEvent::PeerConnectionAccepted(request) => {
                match self.peer_channel(&request.local) {
                    Some(channel) => {
                        if let Err(e) = channel.accept_answer(&request.sdp).await {
                            log::warn!("Could not apply answer from {}: {e}", request.local);
                        }
                    }
                    None => log::debug!("Answer from {} without a channel", request.local),
                }
            }
            ServerEvent::IceCandidate(message) => match self.peer_channel(&message.local) {
                Some(channel) => {
                    if let Err(e) = channel.add_remote_candidate(message.candidate).await {
                        log::warn!("Candidate from {} rejected: {e}", message.local);
                    }
                }
                None => log::debug!("Candidate from {} without a channel", message.local),
            },
            ServerEvent::PushNotification { notif, from } => {
                if self.is_blocked(&from).await {
                    return;
                }
                self.inner
                    .events
                    .notification
                    .emit(Notification { from, notif });
            }
            other => log::debug!("Unexpected relay event {other:?}"),
        }
    }
}

async fn forward_channel_events(
    app: Weak<Inner>,
    peer_id: String,
    mut online: EventReceiver<bool>,
    mut established: EventReceiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            Some(up) = online.recv() => {
                let Some(inner) = app.upgrade() else {
                    return;
                };
                inner.events.online.emit((peer_id.clone(), up));
            }
            Some(()) = established.recv() => {
                let Some(inner) = app.upgrade() else {
                    return;
                };
                if !inner.config.sync.sync_on_connect {
                    continue;
                }
                let peerway = Peerway::from_inner(inner);
                let id = peer_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = peerway.sync_peer(&id, false).await {
                        log::warn!("Sync with {id} after connecting failed: {e}");
                    }
                });
            }
            else => return,
        }
    }
}

async fn relay_loop(app: Weak<Inner>, mut events: mpsc::UnboundedReceiver<ServerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = app.upgrade() else {
            return;
        };
        let app = Peerway::from_inner(inner);
        let Some(event) = app.inner.ctx.relay.handle(event) else {
            continue;
        };

        // In order: a candidate must reach the channel its offer created.
        // Nothing below waits on a relay reply.
        app.on_relay_event(event).await;
    }
    log::info!("Relay event stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::Relay;
    use crate::storage::MemoryDatabase;
    use crate::transport::MemoryNetwork;
    use crate::utils::StorageConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> PeerwayConfig {
        let mut config = PeerwayConfig::default();
        config.storage = StorageConfig::under(dir.path().to_path_buf());
        config
    }

    async fn started(relay: &Relay, id: &str, db: Arc<dyn Database>, dir: &TempDir) -> Peerway {
        started_on(relay, &MemoryNetwork::new(), id, db, config(dir)).await
    }

    async fn started_on(
        relay: &Relay,
        network: &MemoryNetwork,
        id: &str,
        db: Arc<dyn Database>,
        config: PeerwayConfig,
    ) -> Peerway {
        let (tx, rx) = relay.attach();
        let app = Peerway::new(
            Entity::with_id(id, id),
            config,
            db,
            RelaySession::new(tx, Duration::from_secs(1)),
            Arc::new(network.clone()),
        );
        app.start(rx).await.unwrap();
        app
    }

    #[tokio::test]
    async fn test_refused_registration() {
        let dir = TempDir::new().unwrap();
        let (tx, mut outbound) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = outbound.recv().await {
                if matches!(event, ClientEvent::SetupEntity { .. }) {
                    let _ = server_tx.send(ServerEvent::SetupResult(false));
                }
            }
        });

        let app = Peerway::new(
            Entity::with_id("a1", "a1"),
            config(&dir),
            Arc::new(MemoryDatabase::new()),
            RelaySession::new(tx, Duration::from_secs(1)),
            Arc::new(MemoryNetwork::new()),
        );
        let err = app.start(server_rx).await.unwrap_err();
        assert!(matches!(
            err,
            PeerwayError::Relay(RelayError::RegistrationRefused { .. })
        ));
    }

    #[tokio::test]
    async fn test_profile_is_persisted_and_reloaded() {
        let dir = TempDir::new().unwrap();
        let relay = Relay::new();
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());

        let app = started(&relay, "a1", Arc::clone(&db), &dir).await;
        assert_eq!(app.profile().name, "a1");
        let profile = app.set_profile("Ada", Some("ada.png".into())).await.unwrap();
        assert_eq!(app.profile(), profile);

        let restarted = started(&relay, "a1-again", db, &dir).await;
        assert_eq!(restarted.profile(), profile);
    }

    #[tokio::test]
    async fn test_operations_require_a_connected_peer() {
        let dir = TempDir::new().unwrap();
        let relay = Relay::new();
        let app = started(&relay, "a1", Arc::new(MemoryDatabase::new()), &dir).await;

        assert!(matches!(
            app.sync_peer("b1", false).await,
            Err(PeerwayError::Channel(ChannelError::NotConnected { .. }))
        ));
        assert!(app.issue_certificate("b1").await.is_err());
        assert!(!app.send("b1", &Envelope::bare(CommandKind::PeerSub)).await);
        assert_eq!(app.channel_state("b1"), None);

        app.set_blocked("b1", true).await.unwrap();
        assert!(matches!(
            app.sync_peer("b1", false).await,
            Err(PeerwayError::Channel(ChannelError::Blocked { .. }))
        ));
        app.connect_to_peer("b1").await.unwrap();
        assert_eq!(app.channel_state("b1"), None);
    }

    #[tokio::test]
    async fn test_republishing_bumps_the_version() {
        let dir = TempDir::new().unwrap();
        let relay = Relay::new();
        let app = started(&relay, "a1", Arc::new(MemoryDatabase::new()), &dir).await;

        let first = app.publish_post(None, "draft", Vec::new()).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.author_id, "a1");

        let second = app
            .publish_post(Some(&first.id), "final", Vec::new())
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.version, 2);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(app.db().post(&first.id).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_chat_needs_to_exist() {
        let dir = TempDir::new().unwrap();
        let relay = Relay::new();
        let app = started(&relay, "a1", Arc::new(MemoryDatabase::new()), &dir).await;

        assert!(app.send_chat_message("nope", "hi", "text/plain").await.is_err());

        let chat = app.invite_to_chat("solo", &["a1".to_string()]).await.unwrap();
        assert_eq!(chat.members, vec!["a1".to_string()]);
        let message = app
            .send_chat_message(&chat.id, "hi", "text/plain")
            .await
            .unwrap();
        assert_eq!(message.author_id, "a1");
    }

    #[tokio::test]
    async fn test_unanswered_verification_is_forgotten() {
        let relay = Relay::new();
        let network = MemoryNetwork::new();
        let (a_dir, b_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());

        let mut a_config = config(&a_dir);
        a_config.sync.sync_on_connect = false;
        a_config.network.verify_timeout = 1;
        let a = started_on(&relay, &network, "a1", Arc::new(MemoryDatabase::new()), a_config).await;
        let b_db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        let b = started_on(&relay, &network, "b1", Arc::clone(&b_db), config(&b_dir)).await;

        a.connect_to_peer("b1").await.unwrap();
        for _ in 0..400 {
            if a.channel_state("b1") == Some(TransportState::Connected)
                && b.channel_state("a1") == Some(TransportState::Connected)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        a.issue_certificate("b1").await.unwrap();
        for _ in 0..400 {
            if b_db.peer("a1").await.unwrap().is_some_and(|p| p.certificate.is_some()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // b1 now drops a1's commands without answering.
        let mut peer = b_db.peer("a1").await.unwrap().unwrap();
        peer.blocked = true;
        b_db.save_peer(&peer).await.unwrap();

        for _ in 0..2 {
            assert!(matches!(
                a.verify_peer("b1").await,
                Err(PeerwayError::Network(crate::utils::NetworkError::Timeout { .. }))
            ));
            assert!(!a.inner.verifications.lock().unwrap().contains_key("b1"));
        }
    }
}
