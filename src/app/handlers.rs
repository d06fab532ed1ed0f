//! Command handlers installed on every channel.

use super::{Inner, Peerway};
use crate::channel::{CommandKind, Dispatcher, Envelope, PeerChannel};
use crate::crypto::Certificate;
use crate::storage::{Chat, MediaRef, Message, Peer, Post};
use crate::sync::{ChatUpdate, PeerUpdate, PostPublish, Responder, SyncRequest};
use crate::utils::{CryptoError, PeerwayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Weak};

/// `cert.issue` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertIssue {
    /// The issued certificate
    pub certificate: Certificate,
}

/// `cert.present` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertPresent {
    /// Sealed canonical certificate
    pub payload: String,
}

/// `chat.invite` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatInvite {
    /// The chat
    pub chat: Chat,
}

/// `chat.message` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Chat id
    pub chat: String,
    /// Message id; generated on receipt when absent
    #[serde(default)]
    pub id: Option<String>,
    /// Body
    pub content: String,
    /// Content type
    #[serde(default = "text_plain")]
    pub mime: String,
    /// Creation time; receipt time when absent
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

fn text_plain() -> String {
    "text/plain".to_string()
}

/// `post.request` and `post.response.error` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostRequest {
    /// Post id
    pub id: String,
}

/// `post.response.begin` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostResponseBegin {
    /// The post; its media follow as transfers
    pub post: Post,
}

/// `post.response.error` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostResponseError {
    /// Post id
    pub id: String,
    /// Why it was not delivered
    pub reason: String,
}

/// `media.request` payload
pub type MediaRequest = MediaRef;

// Wrap an orchestrator handler: drop it once the orchestrator is gone and
// ignore blocked peers.
fn route<F, Fut>(dispatcher: &mut Dispatcher, app: &Weak<Inner>, kind: CommandKind, handler: F)
where
    F: Fn(Peerway, Arc<PeerChannel>, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let app = app.clone();
    let handler = Arc::new(handler);
    dispatcher.on(kind, move |channel, envelope| {
        let app = app.upgrade().map(Peerway::from_inner);
        let handler = Arc::clone(&handler);
        async move {
            let Some(app) = app else {
                return Ok(());
            };
            if app.is_blocked(channel.peer_id()).await {
                log::debug!("Ignoring {} from blocked {}", envelope.kind, channel.peer_id());
                return Ok(());
            }
            (*handler)(app, channel, envelope).await
        }
    });
}

pub(super) fn build(app: &Weak<Inner>) -> Dispatcher {
    let mut dispatcher = Dispatcher::new();
    route(&mut dispatcher, app, CommandKind::Sync, on_sync);
    route(&mut dispatcher, app, CommandKind::PeerUpdate, on_peer_update);
    route(&mut dispatcher, app, CommandKind::PeerSub, on_peer_sub);
    route(&mut dispatcher, app, CommandKind::PeerUnsub, on_peer_unsub);
    route(&mut dispatcher, app, CommandKind::ChatInvite, on_chat_invite);
    route(&mut dispatcher, app, CommandKind::ChatMessage, on_chat_message);
    route(&mut dispatcher, app, CommandKind::ChatUpdate, on_chat_update);
    route(&mut dispatcher, app, CommandKind::PostPublish, on_post_publish);
    route(&mut dispatcher, app, CommandKind::PostRequest, on_post_request);
    route(&mut dispatcher, app, CommandKind::PostResponseBegin, on_post_response);
    route(&mut dispatcher, app, CommandKind::PostResponseError, on_post_error);
    route(&mut dispatcher, app, CommandKind::MediaRequest, on_media_request);
    route(&mut dispatcher, app, CommandKind::CertIssue, on_cert_issue);
    route(&mut dispatcher, app, CommandKind::CertVerify, on_cert_verify);
    route(&mut dispatcher, app, CommandKind::CertPresent, on_cert_present);
    dispatcher
}

fn mismatch(what: &str, claimed: &str, channel: &PeerChannel) -> PeerwayError {
    PeerwayError::violation(format!(
        "{what} claims {claimed} on the channel to {}",
        channel.peer_id()
    ))
}

async fn on_sync(app: Peerway, channel: Arc<PeerChannel>, envelope: Envelope) -> Result<()> {
    let request: SyncRequest = envelope.decode()?;
    if request.from != channel.peer_id() {
        return Err(mismatch("sync", &request.from, &channel));
    }
    if request.to != app.id() {
        return Err(PeerwayError::violation(format!(
            "sync addressed to {}",
            request.to
        )));
    }

    let profile = app.profile();
    let responder = Responder {
        db: app.inner.db.as_ref(),
        local_id: app.id(),
        profile: &profile,
    };
    let outcome = responder.respond(channel.as_ref(), &request).await?;
    app.inner
        .events
        .synced
        .emit((request.from.clone(), outcome));
    Ok(())
}

async fn on_peer_update(app: Peerway, channel: Arc<PeerChannel>, envelope: Envelope) -> Result<()> {
    let update: PeerUpdate = envelope.decode()?;
    if update.id != channel.peer_id() {
        return Err(mismatch("peer.update", &update.id, &channel));
    }

    let db = &app.inner.db;
    let mut peer = db.peer(&update.id).await?.unwrap_or_else(|| Peer::new(&update.id));
    peer.display_name = update.name;
    peer.avatar = update.avatar;
    peer.profile_updated = update.updated;
    db.save_peer(&peer).await?;

    log::info!("Profile of {} updated", peer.id);
    app.inner.events.peer_updated.emit(peer);
    Ok(())
}

async fn on_peer_sub(app: Peerway, channel: Arc<PeerChannel>, _envelope: Envelope) -> Result<()> {
    app.inner.db.add_subscriber(channel.peer_id()).await
}

async fn on_peer_unsub(app: Peerway, channel: Arc<PeerChannel>, _envelope: Envelope) -> Result<()> {
    app.inner.db.remove_subscriber(channel.peer_id()).await
}

async fn on_chat_invite(app: Peerway, channel: Arc<PeerChannel>, envelope: Envelope) -> Result<()> {
    let ChatInvite { chat } = envelope.decode()?;
    if !chat.members.iter().any(|m| m == channel.peer_id()) {
        return Err(mismatch("chat.invite", &chat.id, &channel));
    }

    log::info!("Invited to chat {} by {}", chat.id, channel.peer_id());
    app.inner.db.save_chat(&chat).await
}

async fn on_chat_message(app: Peerway, channel: Arc<PeerChannel>, envelope: Envelope) -> Result<()> {
    let payload: ChatMessage = envelope.decode()?;
    if app.inner.db.chat(&payload.chat).await?.is_none() {
        log::debug!("Message for unknown chat {} from {}", payload.chat, channel.peer_id());
    }

    let message = Message {
        chat_id: payload.chat,
        id: payload
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        author_id: channel.peer_id().to_string(),
        created_at: payload.created_at.unwrap_or_else(Utc::now),
        mime: payload.mime,
        content: payload.content,
    };
    app.inner.db.save_messages(std::slice::from_ref(&message)).await?;
    app.inner.events.message.emit(message);
    Ok(())
}

async fn on_chat_update(app: Peerway, channel: Arc<PeerChannel>, envelope: Envelope) -> Result<()> {
    let update: ChatUpdate = envelope.decode()?;
    let (own, foreign): (Vec<Message>, Vec<Message>) = update
        .messages
        .into_iter()
        .partition(|m| m.author_id == channel.peer_id() && m.chat_id == update.chat);
    if !foreign.is_empty() {
        log::warn!(
            "Dropped {} chat.update messages not authored by {}",
            foreign.len(),
            channel.peer_id()
        );
    }

    app.inner.db.save_messages(&own).await?;
    for message in own {
        app.inner.events.message.emit(message);
    }
    Ok(())
}

async fn on_post_publish(app: Peerway, channel: Arc<PeerChannel>, envelope: Envelope) -> Result<()> {
    let announcement: PostPublish = envelope.decode()?;
    if announcement.author_id != channel.peer_id() {
        return Err(mismatch("post.publish", &announcement.author_id, &channel));
    }

    let held = app.inner.db.post(&announcement.id).await?;
    if held.is_some_and(|post| post.version >= announcement.version) {
        return Ok(());
    }

    let request = Envelope::new(
        CommandKind::PostRequest,
        &PostRequest {
            id: announcement.id,
        },
    )?;
    channel.send_request(&request).await;
    Ok(())
}

async fn on_post_request(app: Peerway, channel: Arc<PeerChannel>, envelope: Envelope) -> Result<()> {
    let PostRequest { id } = envelope.decode()?;

    let post = app
        .inner
        .db
        .post(&id)
        .await?
        .filter(|post| post.author_id == app.id());
    let Some(post) = post else {
        let error = PostResponseError {
            id,
            reason: "not found".to_string(),
        };
        channel
            .send_request(&Envelope::new(CommandKind::PostResponseError, &error)?)
            .await;
        return Ok(());
    };

    let media = post.media.clone();
    let header = Envelope::new(CommandKind::PostResponseBegin, &PostResponseBegin { post })?;
    if !channel.send_request(&header).await {
        return Ok(());
    }
    for item in media {
        if let Err(e) = channel.send_file(&item.mime, &item.filename).await {
            log::warn!("Post media {} not delivered: {e}", item.filename);
        }
    }
    Ok(())
}

async fn on_post_response(app: Peerway, channel: Arc<PeerChannel>, envelope: Envelope) -> Result<()> {
    let PostResponseBegin { post } = envelope.decode()?;
    if post.author_id != channel.peer_id() {
        return Err(mismatch("post.response.begin", &post.author_id, &channel));
    }

    let db = &app.inner.db;
    db.save_post(&post).await?;
    db.trim_posts(&post.author_id, app.inner.config.sync.cache_post_limit_per_user)
        .await?;

    log::info!("Received post {} v{} from {}", post.id, post.version, post.author_id);
    app.inner.events.post.emit(post);
    Ok(())
}

async fn on_post_error(_app: Peerway, channel: Arc<PeerChannel>, envelope: Envelope) -> Result<()> {
    let error: PostResponseError = envelope.decode()?;
    log::info!(
        "{} could not deliver post {}: {}",
        channel.peer_id(),
        error.id,
        error.reason
    );
    Ok(())
}

async fn on_media_request(_app: Peerway, channel: Arc<PeerChannel>, envelope: Envelope) -> Result<()> {
    let request: MediaRequest = envelope.decode()?;
    channel.send_file(&request.mime, &request.filename).await
}

async fn on_cert_issue(app: Peerway, channel: Arc<PeerChannel>, envelope: Envelope) -> Result<()> {
    let CertIssue { certificate } = envelope.decode()?;
    if certificate.issuer != channel.peer_id() {
        return Err(mismatch("cert.issue", &certificate.issuer, &channel));
    }
    certificate.public_key()?;

    let db = &app.inner.db;
    let mut peer = db
        .peer(channel.peer_id())
        .await?
        .unwrap_or_else(|| Peer::new(channel.peer_id()));
    peer.verifier_key = Some(certificate.public.clone());
    peer.certificate = Some(certificate);
    db.save_peer(&peer).await?;

    log::info!("Stored certificate issued by {}", peer.id);
    Ok(())
}

async fn on_cert_verify(app: Peerway, channel: Arc<PeerChannel>, _envelope: Envelope) -> Result<()> {
    let certificate = app
        .inner
        .db
        .peer(channel.peer_id())
        .await?
        .and_then(|peer| peer.certificate)
        .ok_or_else(|| CryptoError::MissingCertificate {
            peer_id: channel.peer_id().to_string(),
        })?;

    let presentation = CertPresent {
        payload: certificate.present()?,
    };
    channel
        .send_request(&Envelope::new(CommandKind::CertPresent, &presentation)?)
        .await;
    Ok(())
}

async fn on_cert_present(app: Peerway, channel: Arc<PeerChannel>, envelope: Envelope) -> Result<()> {
    let CertPresent { payload } = envelope.decode()?;
    let peer_id = channel.peer_id();

    app.restore_issued(peer_id).await?;
    let verified = app.inner.authority.check_presentation(peer_id, &payload);
    log::info!("Certificate presentation from {peer_id}: verified={verified}");

    app.resolve_verification(peer_id, verified);
    Ok(())
}
