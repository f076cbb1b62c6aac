//! Broadcast bus for lifecycle events.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::event::ConduitEvent;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Fire-and-forget event channel.
///
/// Cloning the bus shares the underlying channel. Slow receivers lag and
/// lose the oldest events; publishers are never blocked.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<ConduitEvent>>,
    capacity: usize,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with the given capacity (minimum 1).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Publish an event.
    ///
    /// Returns the number of receivers the event was delivered to. Zero is
    /// not an error.
    pub fn publish(&self, event: ConduitEvent) -> usize {
        let event_type = event.event_type();
        match self.sender.send(Arc::new(event)) {
            Ok(count) => {
                trace!(event_type, receiver_count = count, "Event published");
                count
            },
            Err(_) => {
                trace!(event_type, "No receivers for event");
                0
            },
        }
    }

    /// Subscribe to every event.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            type_filter: None,
        }
    }

    /// Subscribe to events of the given types only (see
    /// [`ConduitEvent::event_type`]).
    #[must_use]
    pub fn subscribe_types(&self, types: &[&'static str]) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            type_filter: Some(types.to_vec()),
        }
    }

    /// Number of live receivers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Channel capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of an [`EventBus`] subscription.
pub struct EventReceiver {
    receiver: broadcast::Receiver<Arc<ConduitEvent>>,
    type_filter: Option<Vec<&'static str>>,
}

impl EventReceiver {
    fn accepts(&self, event: &ConduitEvent) -> bool {
        self.type_filter
            .as_ref()
            .is_none_or(|types| types.contains(&event.event_type()))
    }

    /// Receive the next matching event.
    ///
    /// Returns `None` once every bus handle has been dropped. Lagged events
    /// are skipped with a warning.
    pub async fn recv(&mut self) -> Option<Arc<ConduitEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => {},
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(skipped = count, "Event receiver lagged, events dropped");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive a matching event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<ConduitEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {},
                Err(_) => return None,
            }
        }
    }

    /// Drain every matching event currently buffered.
    pub fn drain(&mut self) -> Vec<Arc<ConduitEvent>> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

impl std::fmt::Debug for EventReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReceiver")
            .field("type_filter", &self.type_filter)
            .finish_non_exhaustive()
    }
}
