//! Domain records shared between peers and persisted through [`Database`](super::Database).

use crate::crypto::Certificate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The "never synced" sentinel: the Unix epoch
pub fn never() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

/// Local cache record of a remote entity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    /// Remote entity id
    pub id: String,
    /// Display name from the peer's profile
    pub display_name: String,
    /// Avatar filename inside the `image/` namespace
    pub avatar: Option<String>,
    /// Both sides subscribe to each other
    pub mutual: bool,
    /// Blocked peers are ignored in both directions
    pub blocked: bool,
    /// Last completed sync round, epoch when never synced
    pub last_sync: DateTime<Utc>,
    /// Profile stamp last received from the peer
    pub profile_updated: DateTime<Utc>,
    /// Certificate the peer issued to us
    pub certificate: Option<Certificate>,
    /// Public key the peer verifies our presentations with
    pub verifier_key: Option<String>,
}

impl Peer {
    /// A fresh, never-synced peer record
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            avatar: None,
            mutual: false,
            blocked: false,
            last_sync: never(),
            profile_updated: never(),
            certificate: None,
            verifier_key: None,
        }
    }

    /// Whether a sync round with this peer ever completed
    pub fn has_synced(&self) -> bool {
        self.last_sync > never()
    }

    /// Advance the sync stamp; never moves it backwards
    pub fn advance_sync(&mut self, timestamp: DateTime<Utc>) {
        if timestamp > self.last_sync {
            self.last_sync = timestamp;
        }
    }
}

/// A conversation between entities
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    /// Chat id
    pub id: String,
    /// Display name
    pub name: String,
    /// Member entity ids
    pub members: Vec<String>,
    /// Creation time
    pub created: DateTime<Utc>,
}

/// A chat message; owned by its author
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Chat the message belongs to
    pub chat_id: String,
    /// Message id
    pub id: String,
    /// Authoring entity
    pub author_id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Content type
    pub mime: String,
    /// Content
    pub content: String,
}

/// Media attached to a post
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaRef {
    /// Content type
    pub mime: String,
    /// Filename inside the mime category namespace
    pub filename: String,
}

/// A post; owned by its author, replicas are overwritten wholesale
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    /// Post id
    pub id: String,
    /// Authoring entity
    pub author_id: String,
    /// Bumped on every edit
    pub version: u32,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Text content
    pub content: String,
    /// Attached media
    pub media: Vec<MediaRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_peer_never_synced() {
        let peer = Peer::new("b1");
        assert!(!peer.has_synced());
        assert_eq!(peer.last_sync.timestamp(), 0);
        assert_eq!(peer.display_name, "b1");
    }

    #[test]
    fn test_advance_sync_is_monotonic() {
        let mut peer = Peer::new("b1");
        let later = Utc::now();
        let earlier = later - chrono::Duration::minutes(5);

        peer.advance_sync(later);
        peer.advance_sync(earlier);
        assert_eq!(peer.last_sync, later);
    }

    #[test]
    fn test_message_wire_names() {
        let message = Message {
            chat_id: "c1".to_string(),
            id: "m1".to_string(),
            author_id: "a1".to_string(),
            created_at: Utc::now(),
            mime: "text/plain".to_string(),
            content: "hi".to_string(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["chatId"], "c1");
        assert_eq!(json["authorId"], "a1");
    }
}
