//! Event bus for session notifications
//!
//! Uses tokio::sync::broadcast for pub/sub. The channel is bounded; a
//! subscriber that falls behind loses the oldest events and is told how many
//! it missed, while publishers never wait.

pub mod events;

pub use events::SessionEvent;

use futures::Stream;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::heos::codec::{EventCategory, HeosEvent};
use crate::heos::state::StateCache;

/// Default channel capacity
pub const DEFAULT_CAPACITY: usize = 256;

/// Event bus handle for publishing and subscribing
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a new event bus with specified capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: SessionEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to the given categories
    pub fn subscribe(&self, categories: &[EventCategory]) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter: categories.to_vec(),
        }
    }

    /// Subscribe to every category
    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(&EventCategory::ALL)
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Shared event bus wrapped in Arc for thread-safe sharing
pub type SharedBus = Arc<EventBus>;

/// Create a new shared event bus
pub fn create_bus(capacity: usize) -> SharedBus {
    Arc::new(EventBus::new(capacity))
}

/// A filtered view of the bus. Dropping it unsubscribes.
pub struct Subscription {
    receiver: broadcast::Receiver<SessionEvent>,
    filter: Vec<EventCategory>,
}

impl Subscription {
    pub fn categories(&self) -> &[EventCategory] {
        &self.filter
    }

    /// Next matching event, in arrival order. `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.matches(&self.filter) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Subscriber lagged, skipped {} events", missed);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event if one is already queued
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.matches(&self.filter) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(missed)) => {
                    tracing::warn!("Subscriber lagged, skipped {} events", missed);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}

    /// Adapt into a `Stream` of matching events
    pub fn into_stream(self) -> impl Stream<Item = SessionEvent> + Send + Unpin {
        let filter = self.filter;
        BroadcastStream::new(self.receiver).filter_map(move |item| match item {
            Ok(event) if event.matches(&filter) => Some(event),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                tracing::warn!("Subscriber stream lagged, skipped {} events", missed);
                None
            }
        })
    }
}

/// Routes decoded device events: cache first, then fan-out.
#[derive(Clone)]
pub struct EventDispatcher {
    bus: SharedBus,
    state: Arc<StateCache>,
}

impl EventDispatcher {
    pub fn new(bus: SharedBus, state: Arc<StateCache>) -> Self {
        Self { bus, state }
    }

    /// Apply the event to the state cache, then publish it. Never blocks.
    pub fn dispatch(&self, event: HeosEvent) {
        tracing::debug!("Event: {:?}", event);
        self.state.update_from_event(&event);
        self.bus.publish(SessionEvent::Device(event));
    }

    /// Publish a connection lifecycle notification
    pub fn lifecycle(&self, event: SessionEvent) {
        self.bus.publish(event);
    }

    pub fn subscribe(&self, categories: &[EventCategory]) -> Subscription {
        self.bus.subscribe(categories)
    }

    pub fn state(&self) -> &Arc<StateCache> {
        &self.state
    }
}
