//! In-process event bus
//!
//! A thin wrapper over a `tokio::sync::broadcast` channel. Publishing never
//! blocks and never fails; events published while nobody listens are dropped.
//! Each subscriber sees every event at most once, in publish order.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::events::{Event, EventKind};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct Bus {
    sender: broadcast::Sender<Event>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to every current subscriber
    pub fn publish(&self, event: Event) {
        debug!(kind = %event.kind(), session = ?event.session_id(), "publish");
        // No receivers is not an error
        let _ = self.sender.send(event);
    }

    /// Subscribe to every event
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            kind: None,
        }
    }

    /// Subscribe to one event kind only
    pub fn subscribe_kind(&self, kind: EventKind) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            kind: Some(kind),
        }
    }
}

/// A receiving end of the bus, optionally filtered to one [`EventKind`]
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
    kind: Option<EventKind>,
}

impl Subscription {
    fn accepts(&self, event: &Event) -> bool {
        self.kind.is_none_or(|kind| event.kind() == kind)
    }

    /// Wait for the next matching event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "bus subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next matching event that is already queued
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "bus subscriber lagged, events dropped");
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain every matching event that is already queued
    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
