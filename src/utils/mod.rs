//! Utility modules for configuration, error handling and event delivery.

pub mod config;
pub mod errors;
pub mod events;

pub use config::*;
pub use errors::*;
pub use events::{EventBus, EventReceiver};
