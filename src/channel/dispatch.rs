//! Command dispatch table.

use super::envelope::{CommandKind, Envelope};
use super::PeerChannel;
use crate::utils::Result;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// A command handler
pub type Handler =
    Arc<dyn Fn(Arc<PeerChannel>, Envelope) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// What happened to a dispatched envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler ran to completion
    Handled,
    /// A handler ran and reported an error
    Failed,
    /// Known command with no handler installed
    Unhandled,
    /// The `type` is not a command
    Unknown,
}

/// Map from command to handler
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<CommandKind, Handler>,
}

impl Dispatcher {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the handler for `kind`, replacing any previous one
    pub fn on<F, Fut>(&mut self, kind: CommandKind, handler: F) -> &mut Self
    where
        F: Fn(Arc<PeerChannel>, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handlers.insert(
            kind,
            Arc::new(move |channel, envelope| Box::pin(handler(channel, envelope))),
        );
        self
    }

    /// Whether `kind` has a handler
    pub fn handles(&self, kind: CommandKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Route one envelope
    pub async fn dispatch(&self, channel: Arc<PeerChannel>, envelope: Envelope) -> DispatchOutcome {
        let Some(kind) = envelope.command() else {
            log::warn!(
                "Unknown command {:?} from {}",
                envelope.kind,
                channel.peer_id()
            );
            return DispatchOutcome::Unknown;
        };

        let Some(handler) = self.handlers.get(&kind).cloned() else {
            log::info!("Unhandled command {kind} from {}", channel.peer_id());
            return DispatchOutcome::Unhandled;
        };

        let peer_id = channel.peer_id().to_string();
        match handler(channel, envelope).await {
            Ok(()) => DispatchOutcome::Handled,
            Err(e) => {
                log::warn!("Handler for {kind} from {peer_id} failed: {e}");
                DispatchOutcome::Failed
            }
        }
    }
}
