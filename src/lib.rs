//! # Peerway
//!
//! A peer-to-peer overlay for personal messaging. Entities find each other
//! through a signaling relay, connect over direct channels, trust each other
//! through issued certificates and keep profiles, chats and posts in sync.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peerway::relay::{client, RelaySession};
//! use peerway::storage::MemoryDatabase;
//! use peerway::transport::TcpTransportFactory;
//! use peerway::{Entity, Peerway, PeerwayConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PeerwayConfig::default();
//!     let entity = Entity::load_or_create(&config.storage.keys_dir, "alice")?;
//!
//!     let (tx, rx) = client::connect(&config.relay.address).await?;
//!     let relay = RelaySession::new(tx, config.relay.request_timeout());
//!     let factory = Arc::new(TcpTransportFactory::new(
//!         config.network.bind_address,
//!         config.network.max_frame_size,
//!     ));
//!
//!     let app = Peerway::new(entity, config, Arc::new(MemoryDatabase::new()), relay, factory);
//!     app.start(rx).await?;
//!     app.connect_to_peer("bob").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`relay`]: the signaling relay server and its client session
//! - [`transport`]: transports a channel runs over
//! - [`channel`]: per-peer channels, envelopes and chunked transfers
//! - [`crypto`]: entity identity and peer certificates
//! - [`sync`]: the state synchronization protocol
//! - [`storage`]: the persistence interface
//! - [`app`]: the [`Peerway`] orchestrator and its command handlers
//! - [`utils`]: configuration, errors and event buses

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod channel;
pub mod crypto;
pub mod relay;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use app::{Notification, Peerway, PeerwayEvents};
pub use channel::{CommandKind, Envelope, PeerChannel, TransportState};
pub use crypto::{Certificate, Entity, Profile};
pub use utils::{PeerwayConfig, PeerwayError, Result};

/// Default configuration values
pub mod defaults {
    /// Default relay port
    pub const DEFAULT_RELAY_PORT: u16 = 7001;

    /// Default relay request timeout in seconds
    pub const DEFAULT_REQUEST_TIMEOUT: u64 = 10;

    /// Default maximum frame payload in bytes
    pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024;

    /// Default number of cached posts kept per remote author
    pub const DEFAULT_CACHE_POST_LIMIT: usize = 20;
}
