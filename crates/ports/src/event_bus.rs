//! Event Bus Port
//!
//! In-process lifecycle notifications. The orchestration engine listens for
//! operation completions here instead of hammering the store; consumers must
//! tolerate lag (broadcast semantics, no replay).

use async_trait::async_trait;
use stratus_core::{
    InstanceId, OperationId, OperationKind, OperationStatus, OrchestrationId, OrchestrationStatus,
};

/// Lifecycle notifications published by the executor and the orchestration
/// engine.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// An operation left `pending`.
    OperationStarted {
        operation_id: OperationId,
        instance_id: InstanceId,
        kind: OperationKind,
    },

    /// An operation reached a terminal status.
    OperationFinished {
        operation_id: OperationId,
        instance_id: InstanceId,
        orchestration_id: Option<OrchestrationId>,
        kind: OperationKind,
        status: OperationStatus,
    },

    /// An orchestration reached a terminal status.
    OrchestrationFinished {
        orchestration_id: OrchestrationId,
        status: OrchestrationStatus,
    },
}

/// Event bus error types
#[derive(thiserror::Error, Debug)]
pub enum EventBusError {
    #[error("bus full (capacity: {0})")]
    Full(usize),

    #[error("subscriber dropped")]
    Dropped,

    #[error("channel closed")]
    Closed,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Event publisher port
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: LifecycleEvent) -> Result<(), EventBusError>;

    async fn publish_batch(&self, events: Vec<LifecycleEvent>) -> Result<(), EventBusError> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// Event receiver wrapper
#[derive(Debug)]
pub struct EventReceiver {
    pub receiver: tokio::sync::broadcast::Receiver<LifecycleEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<LifecycleEvent, EventBusError> {
        self.receiver
            .recv()
            .await
            .map_err(|_| EventBusError::Dropped)
    }

    pub fn try_recv(&mut self) -> Result<LifecycleEvent, EventBusError> {
        self.receiver.try_recv().map_err(|_| EventBusError::Dropped)
    }
}

/// Event subscriber port
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn subscribe(&self) -> Result<EventReceiver, EventBusError>;
}
