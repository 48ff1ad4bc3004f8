//! Event bus for broadcasting engine events to subscribers.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::event::MaestroEvent;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast bus delivering events to all subscribers in publish order.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<MaestroEvent>>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with an explicit per-subscriber buffer capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Publish an event; returns the number of receivers that will see it.
    pub fn publish(&self, event: MaestroEvent) -> usize {
        trace!(event = event.kind(), "publishing event");
        self.sender.send(Arc::new(event)).unwrap_or(0)
    }

    /// Subscribe; the receiver sees every event published after this call.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            warned_lag: false,
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// The per-subscriber buffer capacity.
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

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            capacity: self.capacity,
        }
    }
}

/// Receiving side of the bus.
///
/// Lag handling implements the backpressure contract: when this receiver
/// falls behind, dropped events are acknowledged with a single warning and
/// reading continues — droppable (partial-message) events are simply lost,
/// everything else is recoverable from the store by the subscriber.
#[derive(Debug)]
pub struct EventReceiver {
    receiver: broadcast::Receiver<Arc<MaestroEvent>>,
    warned_lag: bool,
}

impl EventReceiver {
    /// Receive the next event, absorbing lag.
    ///
    /// Returns `None` once the bus is closed and the backlog is drained.
    pub async fn recv(&mut self) -> Option<Arc<MaestroEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    if !self.warned_lag {
                        warn!(missed, "event subscriber lagging; dropping missed events");
                        self.warned_lag = true;
                    }
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive, for drain loops in tests and shutdown paths.
    pub fn try_recv(&mut self) -> Option<Arc<MaestroEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => {},
                Err(_) => return None,
            }
        }
    }
}
