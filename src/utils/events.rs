//! Typed publish/subscribe channels.
//!
//! One [`EventBus`] per event kind. Every subscriber owns an unbounded tokio
//! receiver; senders are kept in registration order and each event is sent to
//! them in that order. Dropping (or closing) the receiver unsubscribes, and a
//! closed receiver gets nothing from the next emission on.

use std::sync::Mutex;
use tokio::sync::mpsc;

/// Receiving half of a subscription
pub type EventReceiver<T> = mpsc::UnboundedReceiver<T>;

/// A typed event channel
pub struct EventBus<T> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T> EventBus<T> {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a subscriber
    pub fn subscribe(&self) -> EventReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl<T: Clone> EventBus<T> {
    /// Deliver an event to every live subscriber; returns how many got it
    pub fn emit(&self, event: T) -> usize {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return 0;
        };
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}
