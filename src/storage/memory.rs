//! In-memory [`Database`] implementation.

use super::{Chat, Database, Message, Peer, Post};
use crate::utils::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    peers: HashMap<String, Peer>,
    chats: HashMap<String, Chat>,
    messages: HashMap<(String, String), Message>,
    posts: HashMap<String, Post>,
    subscribers: BTreeSet<String>,
    settings: HashMap<String, serde_json::Value>,
}

/// Volatile database keeping everything in hash maps
#[derive(Default)]
pub struct MemoryDatabase {
    tables: RwLock<Tables>,
}

impl MemoryDatabase {
    /// Create an empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored message in `chat_id`, oldest first
    pub async fn messages_in(&self, chat_id: &str) -> Vec<Message> {
        let tables = self.tables.read().await;
        let mut messages: Vec<Message> = tables
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        messages
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn peer(&self, id: &str) -> Result<Option<Peer>> {
        Ok(self.tables.read().await.peers.get(id).cloned())
    }

    async fn save_peer(&self, peer: &Peer) -> Result<()> {
        self.tables
            .write()
            .await
            .peers
            .insert(peer.id.clone(), peer.clone());
        Ok(())
    }

    async fn chat(&self, id: &str) -> Result<Option<Chat>> {
        Ok(self.tables.read().await.chats.get(id).cloned())
    }

    async fn save_chat(&self, chat: &Chat) -> Result<()> {
        self.tables
            .write()
            .await
            .chats
            .insert(chat.id.clone(), chat.clone());
        Ok(())
    }

    async fn chats_with(&self, peer_id: &str) -> Result<Vec<Chat>> {
        let tables = self.tables.read().await;
        let mut chats: Vec<Chat> = tables
            .chats
            .values()
            .filter(|c| c.members.iter().any(|m| m == peer_id))
            .cloned()
            .collect();
        chats.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(chats)
    }

    async fn save_messages(&self, messages: &[Message]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for message in messages {
            tables.messages.insert(
                (message.chat_id.clone(), message.id.clone()),
                message.clone(),
            );
        }
        Ok(())
    }

    async fn messages_after(
        &self,
        chat_id: &str,
        author_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let tables = self.tables.read().await;
        let mut messages: Vec<Message> = tables
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id && m.author_id == author_id && m.created_at > after)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(messages)
    }

    async fn latest_message_time(
        &self,
        chat_id: &str,
        author_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let tables = self.tables.read().await;
        Ok(tables
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id && m.author_id == author_id)
            .map(|m| m.created_at)
            .max())
    }

    async fn post(&self, id: &str) -> Result<Option<Post>> {
        Ok(self.tables.read().await.posts.get(id).cloned())
    }

    async fn save_post(&self, post: &Post) -> Result<()> {
        self.tables
            .write()
            .await
            .posts
            .insert(post.id.clone(), post.clone());
        Ok(())
    }

    async fn latest_posts(&self, author_id: &str, limit: usize) -> Result<Vec<Post>> {
        let tables = self.tables.read().await;
        let mut posts: Vec<Post> = tables
            .posts
            .values()
            .filter(|p| p.author_id == author_id)
            .cloned()
            .collect();
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        posts.truncate(limit);
        Ok(posts)
    }

    async fn trim_posts(&self, author_id: &str, keep: usize) -> Result<()> {
        let keep_ids: BTreeSet<String> = self
            .latest_posts(author_id, keep)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();

        self.tables
            .write()
            .await
            .posts
            .retain(|id, post| post.author_id != author_id || keep_ids.contains(id));
        Ok(())
    }

    async fn add_subscriber(&self, peer_id: &str) -> Result<()> {
        self.tables
            .write()
            .await
            .subscribers
            .insert(peer_id.to_string());
        Ok(())
    }

    async fn remove_subscriber(&self, peer_id: &str) -> Result<()> {
        self.tables.write().await.subscribers.remove(peer_id);
        Ok(())
    }

    async fn subscribers(&self) -> Result<Vec<String>> {
        Ok(self
            .tables
            .read()
            .await
            .subscribers
            .iter()
            .cloned()
            .collect())
    }

    async fn setting(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.tables.read().await.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.tables
            .write()
            .await
            .settings
            .insert(key.to_string(), value);
        Ok(())
    }
}
