//! Signaling relay.
//!
//! Matches entity ids to live endpoints and forwards negotiation messages it
//! never interprets. Undeliverable messages are dropped: nothing is queued or
//! retried.

pub mod client;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod server;

pub use client::RelaySession;
pub use hub::Relay;
pub use protocol::*;
pub use registry::EndpointRegistry;
pub use server::RelayServer;
