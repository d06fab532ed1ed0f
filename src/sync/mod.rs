//! Peer synchronization rounds.
//!
//! A round is one `sync` request answered by deltas: the profile, chat
//! messages the requester has not seen, and announcements of posts it lacks.
//! When the two sides disagree about when they last synced, the responder
//! sends one reciprocal request marked as an echo; echoes never bounce, so
//! every exchange ends after at most two round trips.

use crate::channel::{CommandKind, Envelope, PeerChannel};
use crate::crypto::Profile;
use crate::storage::{never, Database, Message, Peer};
use crate::utils::{Result, SyncSettings};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Requester's newest message from the responder in one chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatCursor {
    /// Chat id
    pub id: String,
    /// Creation time of the last message seen
    pub last_message: DateTime<Utc>,
}

/// A post version held by the requester
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostVersion {
    /// Post id
    pub id: String,
    /// Version held
    pub version: u32,
}

/// What the requester already has
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Subscribe (`true`) or unsubscribe (`false`) from the responder's posts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<bool>,
    /// Chat cursors
    #[serde(default)]
    pub chats: Vec<ChatCursor>,
    /// Cached posts by the responder
    #[serde(default)]
    pub posts: Vec<PostVersion>,
    /// Posts per author the requester keeps
    pub cache_post_limit_per_user: usize,
}

/// Stamps the requester holds of the responder's data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncUpdated {
    /// The responder's profile stamp as last received
    pub profile: DateTime<Utc>,
}

/// `sync` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Requesting entity
    pub from: String,
    /// Responding entity
    pub to: String,
    /// Stamp of this round
    pub timestamp: DateTime<Utc>,
    /// Requester's stored sync stamp for the responder
    pub last_known_sync: DateTime<Utc>,
    /// What the requester has
    pub config: SyncConfig,
    /// Sync even if the stamps agree
    #[serde(default)]
    pub force: bool,
    /// Reciprocal request; never answered with another one
    #[serde(default)]
    pub echo: bool,
    /// Stamps of the responder's data
    pub updated: SyncUpdated,
}

/// `peer.update` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerUpdate {
    /// Entity id
    pub id: String,
    /// Display name
    pub name: String,
    /// Avatar filename, already transferred
    #[serde(default)]
    pub avatar: Option<String>,
    /// Profile stamp
    pub updated: DateTime<Utc>,
}

/// `chat.update` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUpdate {
    /// Chat id
    pub chat: String,
    /// Messages, oldest first
    pub messages: Vec<Message>,
}

/// `post.publish` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostPublish {
    /// Post id
    pub id: String,
    /// Current version
    pub version: u32,
    /// Author
    pub author_id: String,
}

/// Caller-side knobs for a round
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Subscription change to request
    pub sub: Option<bool>,
    /// Posts per author kept locally
    pub cache_post_limit_per_user: usize,
    /// Ignore matching stamps
    pub force: bool,
}

impl SyncOptions {
    /// Options from the configuration
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            sub: settings.subscribe.then_some(true),
            cache_post_limit_per_user: settings.cache_post_limit_per_user,
            force: false,
        }
    }

    /// Same options, forced
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Result of answering one request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// The stamps disagreed, or the round was forced
    pub sync_required: bool,
    /// At least one delta was sent
    pub updated: bool,
    /// The sync stamp was stored
    pub persisted: bool,
    /// A reciprocal request was sent
    pub bounced: bool,
}

/// The outbound side of a round
#[async_trait]
pub trait SyncLink: Send + Sync {
    /// Entity on the other side
    fn peer_id(&self) -> &str;

    /// Send one envelope; false if it could not be sent
    async fn send(&self, envelope: &Envelope) -> bool;

    /// Send a stored file and wait for its acknowledgement
    async fn send_file(&self, mime: &str, filename: &str) -> Result<()>;
}

#[async_trait]
impl SyncLink for PeerChannel {
    fn peer_id(&self) -> &str {
        PeerChannel::peer_id(self)
    }

    async fn send(&self, envelope: &Envelope) -> bool {
        self.send_request(envelope).await
    }

    async fn send_file(&self, mime: &str, filename: &str) -> Result<()> {
        PeerChannel::send_file(self, mime, filename).await
    }
}

/// Build the request `local_id` sends to `peer_id`
pub async fn build_request(
    db: &dyn Database,
    local_id: &str,
    peer_id: &str,
    options: &SyncOptions,
    timestamp: DateTime<Utc>,
    echo: bool,
) -> Result<SyncRequest> {
    let peer = db.peer(peer_id).await?.unwrap_or_else(|| Peer::new(peer_id));

    let mut chats = Vec::new();
    for chat in db.chats_with(peer_id).await? {
        let last_message = db
            .latest_message_time(&chat.id, peer_id)
            .await?
            .unwrap_or_else(never);
        chats.push(ChatCursor {
            id: chat.id,
            last_message,
        });
    }

    let posts = db
        .latest_posts(peer_id, options.cache_post_limit_per_user)
        .await?
        .into_iter()
        .map(|post| PostVersion {
            id: post.id,
            version: post.version,
        })
        .collect();

    Ok(SyncRequest {
        from: local_id.to_string(),
        to: peer_id.to_string(),
        timestamp,
        last_known_sync: peer.last_sync,
        config: SyncConfig {
            sub: options.sub,
            chats,
            posts,
            cache_post_limit_per_user: options.cache_post_limit_per_user,
        },
        force: options.force,
        echo,
        updated: SyncUpdated {
            profile: peer.profile_updated,
        },
    })
}

/// MIME type announced for an avatar file
pub fn avatar_mime(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/octet-stream",
    }
}

/// Answers sync requests for the local entity
pub struct Responder<'a> {
    /// Local persistence
    pub db: &'a dyn Database,
    /// Local entity id
    pub local_id: &'a str,
    /// Local profile
    pub profile: &'a Profile,
}

impl Responder<'_> {
    /// Run the responder side of a round over `link`
    pub async fn respond(&self, link: &dyn SyncLink, request: &SyncRequest) -> Result<SyncOutcome> {
        let mut peer = self
            .db
            .peer(&request.from)
            .await?
            .unwrap_or_else(|| Peer::new(&request.from));

        let stored = peer.last_sync;
        let sync_required = request.force
            || (stored == never() && request.last_known_sync == never())
            || stored != request.last_known_sync;

        let mut updated = false;
        if request.updated.profile != self.profile.updated {
            updated |= self.send_profile(link).await;
        }

        match request.config.sub {
            Some(true) => self.db.add_subscriber(&request.from).await?,
            Some(false) => self.db.remove_subscriber(&request.from).await?,
            None => {}
        }

        updated |= self.send_chat_updates(link, request).await?;
        updated |= self.announce_posts(link, request).await?;

        let mut outcome = SyncOutcome {
            sync_required,
            updated,
            ..SyncOutcome::default()
        };

        if updated || sync_required {
            peer.advance_sync(request.timestamp);
            self.db.save_peer(&peer).await?;
            outcome.persisted = true;
        }

        if sync_required && !request.echo {
            let options = SyncOptions {
                sub: request.config.sub,
                cache_post_limit_per_user: request.config.cache_post_limit_per_user,
                force: false,
            };
            let reply = build_request(
                self.db,
                self.local_id,
                &request.from,
                &options,
                request.timestamp,
                true,
            )
            .await?;
            outcome.bounced = link
                .send(&Envelope::new(CommandKind::Sync, &reply)?)
                .await;
        }

        log::debug!("Sync from {} answered: {outcome:?}", request.from);
        Ok(outcome)
    }

    async fn send_profile(&self, link: &dyn SyncLink) -> bool {
        if let Some(avatar) = &self.profile.avatar {
            if let Err(e) = link.send_file(avatar_mime(avatar), avatar).await {
                log::warn!("Avatar transfer to {} failed: {e}", link.peer_id());
                return false;
            }
        }

        let update = PeerUpdate {
            id: self.local_id.to_string(),
            name: self.profile.name.clone(),
            avatar: self.profile.avatar.clone(),
            updated: self.profile.updated,
        };
        match Envelope::new(CommandKind::PeerUpdate, &update) {
            Ok(envelope) => link.send(&envelope).await,
            Err(_) => false,
        }
    }

    async fn send_chat_updates(&self, link: &dyn SyncLink, request: &SyncRequest) -> Result<bool> {
        let mut updated = false;
        for cursor in &request.config.chats {
            let Some(chat) = self.db.chat(&cursor.id).await? else {
                continue;
            };
            if !chat.members.iter().any(|m| m == &request.from) {
                log::warn!("{} asked for chat {} it is not in", request.from, chat.id);
                continue;
            }

            let messages = self
                .db
                .messages_after(&chat.id, self.local_id, cursor.last_message)
                .await?;
            if messages.is_empty() {
                continue;
            }

            let update = ChatUpdate {
                chat: chat.id,
                messages,
            };
            updated |= link
                .send(&Envelope::new(CommandKind::ChatUpdate, &update)?)
                .await;
        }
        Ok(updated)
    }

    async fn announce_posts(&self, link: &dyn SyncLink, request: &SyncRequest) -> Result<bool> {
        let mut updated = false;
        let latest = self
            .db
            .latest_posts(self.local_id, request.config.cache_post_limit_per_user)
            .await?;

        for post in latest {
            let held = request
                .config
                .posts
                .iter()
                .find(|p| p.id == post.id)
                .map(|p| p.version);
            if held.is_some_and(|version| version >= post.version) {
                continue;
            }

            let announcement = PostPublish {
                id: post.id,
                version: post.version,
                author_id: post.author_id,
            };
            updated |= link
                .send(&Envelope::new(CommandKind::PostPublish, &announcement)?)
                .await;
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Chat, MemoryDatabase, Post};
    use chrono::Duration;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Envelope>>,
        files: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn kinds(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.kind.clone())
                .collect()
        }
    }

    #[async_trait]
    impl SyncLink for Recorder {
        fn peer_id(&self) -> &str {
            "b1"
        }

        async fn send(&self, envelope: &Envelope) -> bool {
            self.sent.lock().unwrap().push(envelope.clone());
            true
        }

        async fn send_file(&self, _mime: &str, filename: &str) -> Result<()> {
            self.files.lock().unwrap().push(filename.to_string());
            Ok(())
        }
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        never() + Duration::seconds(seconds)
    }

    fn request(last_known_sync: DateTime<Utc>, profile: DateTime<Utc>) -> SyncRequest {
        SyncRequest {
            from: "b1".into(),
            to: "a1".into(),
            timestamp: at(1000),
            last_known_sync,
            config: SyncConfig {
                sub: None,
                chats: Vec::new(),
                posts: Vec::new(),
                cache_post_limit_per_user: 20,
            },
            force: false,
            echo: false,
            updated: SyncUpdated { profile },
        }
    }

    #[tokio::test]
    async fn test_first_round_is_required_and_bounces() {
        let db = MemoryDatabase::new();
        let profile = Profile {
            name: "Alice".into(),
            avatar: Some("me.png".into()),
            updated: at(10),
        };
        let responder = Responder {
            db: &db,
            local_id: "a1",
            profile: &profile,
        };
        let link = Recorder::default();

        let outcome = responder
            .respond(&link, &request(never(), never()))
            .await
            .unwrap();

        assert!(outcome.sync_required && outcome.updated && outcome.persisted && outcome.bounced);
        assert_eq!(*link.files.lock().unwrap(), vec!["me.png".to_string()]);
        assert_eq!(link.kinds(), vec!["peer.update", "sync"]);

        let echo: SyncRequest = link.sent.lock().unwrap()[1].decode().unwrap();
        assert!(echo.echo);
        assert_eq!(echo.timestamp, at(1000));
        assert_eq!(echo.last_known_sync, at(1000));
        assert_eq!(db.peer("b1").await.unwrap().unwrap().last_sync, at(1000));
    }

    #[tokio::test]
    async fn test_steady_state_is_quiet() {
        let db = MemoryDatabase::new();
        let mut peer = Peer::new("b1");
        peer.advance_sync(at(500));
        db.save_peer(&peer).await.unwrap();
        let profile = Profile {
            name: "Alice".into(),
            avatar: None,
            updated: at(10),
        };
        let responder = Responder {
            db: &db,
            local_id: "a1",
            profile: &profile,
        };
        let link = Recorder::default();

        let outcome = responder
            .respond(&link, &request(at(500), at(10)))
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::default());
        assert!(link.kinds().is_empty());
        assert_eq!(db.peer("b1").await.unwrap().unwrap().last_sync, at(500));
    }

    #[tokio::test]
    async fn test_echo_never_bounces() {
        let db = MemoryDatabase::new();
        let profile = Profile {
            name: "Alice".into(),
            avatar: None,
            updated: at(10),
        };
        let responder = Responder {
            db: &db,
            local_id: "a1",
            profile: &profile,
        };
        let link = Recorder::default();
        let mut echo = request(at(1000), at(10));
        echo.echo = true;

        let outcome = responder.respond(&link, &echo).await.unwrap();
        assert!(outcome.sync_required && outcome.persisted);
        assert!(!outcome.bounced);
        assert!(link.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_chat_and_post_deltas() {
        let db = MemoryDatabase::new();
        db.save_chat(&Chat {
            id: "c1".into(),
            name: "pair".into(),
            members: vec!["a1".into(), "b1".into()],
            created: at(1),
        })
        .await
        .unwrap();
        let message = |id: &str, author: &str, t: i64| Message {
            chat_id: "c1".into(),
            id: id.into(),
            author_id: author.into(),
            created_at: at(t),
            mime: "text/plain".into(),
            content: id.into(),
        };
        db.save_messages(&[message("m1", "a1", 5), message("m2", "a1", 9), message("m3", "b1", 12)])
            .await
            .unwrap();
        for (id, version, t) in [("p1", 1, 3), ("p2", 2, 4), ("p3", 1, 6)] {
            db.save_post(&Post {
                id: id.into(),
                author_id: "a1".into(),
                version,
                created_at: at(t),
                content: String::new(),
                media: Vec::new(),
            })
            .await
            .unwrap();
        }

        let profile = Profile {
            name: "Alice".into(),
            avatar: None,
            updated: at(10),
        };
        let responder = Responder {
            db: &db,
            local_id: "a1",
            profile: &profile,
        };
        let link = Recorder::default();
        let mut req = request(never(), at(10));
        req.echo = true;
        req.config.sub = Some(true);
        req.config.chats = vec![ChatCursor {
            id: "c1".into(),
            last_message: at(5),
        }];
        req.config.posts = vec![
            PostVersion { id: "p1".into(), version: 1 },
            PostVersion { id: "p2".into(), version: 1 },
        ];

        let outcome = responder.respond(&link, &req).await.unwrap();
        assert!(outcome.updated);
        assert_eq!(link.kinds(), vec!["chat.update", "post.publish", "post.publish"]);

        let sent = link.sent.lock().unwrap();
        let update: ChatUpdate = sent[0].decode().unwrap();
        assert_eq!(update.messages.len(), 1);
        assert_eq!(update.messages[0].id, "m2");
        let announced: Vec<String> = sent[1..]
            .iter()
            .map(|e| e.decode::<PostPublish>().unwrap().id)
            .collect();
        assert!(announced.contains(&"p2".to_string()));
        assert!(announced.contains(&"p3".to_string()));
        assert_eq!(db.subscribers().await.unwrap(), vec!["b1".to_string()]);
    }

    #[tokio::test]
    async fn test_build_request_reflects_local_cache() {
        let db = MemoryDatabase::new();
        let mut peer = Peer::new("a1");
        peer.advance_sync(at(700));
        peer.profile_updated = at(10);
        db.save_peer(&peer).await.unwrap();

        let options = SyncOptions {
            sub: Some(true),
            cache_post_limit_per_user: 5,
            force: false,
        }
        .forced();
        let req = build_request(&db, "b1", "a1", &options, at(900), false)
            .await
            .unwrap();

        assert_eq!(req.last_known_sync, at(700));
        assert_eq!(req.updated.profile, at(10));
        assert!(req.force && !req.echo);
        assert_eq!(req.config.cache_post_limit_per_user, 5);

        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("lastKnownSync").is_some());
        assert!(json["config"].get("cachePostLimitPerUser").is_some());
    }

    #[test]
    fn test_avatar_mime() {
        assert_eq!(avatar_mime("me.PNG"), "image/png");
        assert_eq!(avatar_mime("me.jpeg"), "image/jpeg");
        assert_eq!(avatar_mime("noext"), "image/octet-stream");
    }
}
