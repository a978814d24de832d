//! InMemoryBus adapter using tokio::broadcast
//!
//! Concrete implementation of the EventPublisher and EventSubscriber ports.
//! Delivery is broadcast, best-effort: subscribers that fall behind lose the
//! oldest events, and consumers that must not miss a transition re-read the
//! store after a lag.

use async_trait::async_trait;
use stratus_ports::event_bus::{
    EventBusError, EventPublisher, EventReceiver, EventSubscriber, LifecycleEvent,
};
use tokio::sync::broadcast;

/// In-memory event bus for inter-module communication
pub struct InMemoryBus {
    sender: broadcast::Sender<LifecycleEvent>,
    capacity: usize,
}

impl InMemoryBus {
    /// Create a new InMemoryBus with the specified capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Get the configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get number of receivers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl EventPublisher for InMemoryBus {
    async fn publish(&self, event: LifecycleEvent) -> Result<(), EventBusError> {
        // A send error only means nobody is listening right now.
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[async_trait]
impl EventSubscriber for InMemoryBus {
    async fn subscribe(&self) -> Result<EventReceiver, EventBusError> {
        let receiver = self.sender.subscribe();
        Ok(EventReceiver { receiver })
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(10_000)
    }
}

/// Builder pattern for InMemoryBus configuration
pub struct InMemoryBusBuilder {
    capacity: usize,
}

impl InMemoryBusBuilder {
    pub fn new() -> Self {
        Self { capacity: 10_000 }
    }

    /// Set the channel capacity
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn build(self) -> InMemoryBus {
        InMemoryBus::new(self.capacity)
    }
}

impl Default for InMemoryBusBuilder {
    fn default() -> Self {
        Self::new()
    }
}
