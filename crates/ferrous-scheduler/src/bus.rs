//! In-process event bus built on a tokio broadcast channel.

use async_trait::async_trait;
use ferrous_core::Result;
use ferrous_core::events::RunEvent;
use ferrous_core::ports::EventSink;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 256;

/// Fan-out of run lifecycle events to any number of subscribers.
///
/// Publishing with no subscribers is not an error. Slow subscribers lose the
/// oldest events rather than blocking the coordinator.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for EventBus {
    async fn publish(&self, event: RunEvent) -> Result<()> {
        trace!(subject = %event.subject(), "Publishing event");
        // An error only means nobody is listening
        let _ = self.tx.send(event);
        Ok(())
    }
}
