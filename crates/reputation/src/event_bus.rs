//! In-process pub/sub for hub events.
//!
//! A `broadcast` channel: every subscriber sees every event published after it
//! subscribed. Slow subscribers lag and lose the oldest events instead of blocking
//! the writer.

use crate::events::HubEvent;
use tokio::sync::broadcast;

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HubEvent>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Publish to current subscribers and return how many received it.
    ///
    /// Having no subscribers is not an error for the publisher; the event is dropped.
    pub fn publish(&self, event: HubEvent) -> usize {
        let kind = event.kind();
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::debug!(event_type = kind, "no subscribers for hub event");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
