//! The persistence interface the overlay depends on.
//!
//! Production storage lives outside this crate; everything here talks to it
//! through [`Database`]. [`MemoryDatabase`] backs tests and the CLI.

pub mod memory;
pub mod models;

pub use memory::MemoryDatabase;
pub use models::*;

use crate::utils::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Settings key holding the local profile
pub const PROFILE_KEY: &str = "profile";

/// Settings key prefix for certificates issued to peers
pub const ISSUED_CERTIFICATE_PREFIX: &str = "certificate/";

/// Query-style persistence used by the orchestrator and the sync protocol
#[async_trait]
pub trait Database: Send + Sync {
    /// Look up a cached peer
    async fn peer(&self, id: &str) -> Result<Option<Peer>>;

    /// Insert or replace a peer record
    async fn save_peer(&self, peer: &Peer) -> Result<()>;

    /// Look up a chat
    async fn chat(&self, id: &str) -> Result<Option<Chat>>;

    /// Insert or replace a chat
    async fn save_chat(&self, chat: &Chat) -> Result<()>;

    /// Chats that include `peer_id` as a member
    async fn chats_with(&self, peer_id: &str) -> Result<Vec<Chat>>;

    /// Insert or replace messages, keyed by `(chat_id, id)`
    async fn save_messages(&self, messages: &[Message]) -> Result<()>;

    /// Messages in `chat_id` by `author_id` created strictly after `after`, oldest first
    async fn messages_after(
        &self,
        chat_id: &str,
        author_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<Message>>;

    /// Creation time of the newest message in `chat_id` by `author_id`
    async fn latest_message_time(
        &self,
        chat_id: &str,
        author_id: &str,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Look up a post
    async fn post(&self, id: &str) -> Result<Option<Post>>;

    /// Insert or replace a post
    async fn save_post(&self, post: &Post) -> Result<()>;

    /// Newest `limit` posts by `author_id`, newest first
    async fn latest_posts(&self, author_id: &str, limit: usize) -> Result<Vec<Post>>;

    /// Drop all but the newest `keep` posts by `author_id`
    async fn trim_posts(&self, author_id: &str, keep: usize) -> Result<()>;

    /// Register a subscriber to the local entity's posts (idempotent)
    async fn add_subscriber(&self, peer_id: &str) -> Result<()>;

    /// Remove a subscriber (idempotent)
    async fn remove_subscriber(&self, peer_id: &str) -> Result<()>;

    /// Current subscribers
    async fn subscribers(&self) -> Result<Vec<String>>;

    /// Read a settings blob
    async fn setting(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Write a settings blob
    async fn set_setting(&self, key: &str, value: serde_json::Value) -> Result<()>;
}
