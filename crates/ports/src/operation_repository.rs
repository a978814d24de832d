//! Operation Repository Port
//!
//! Durable storage for lifecycle operations. The executor persists through
//! this port after every step invocation, so implementations must support
//! safe concurrent writers. Exclusivity between executor workers is enforced
//! by the claim marker, not by implementation-side locking.

use crate::StoreError;
use async_trait::async_trait;
use chrono::Duration;
use stratus_core::{InstanceId, Operation, OperationId, OrchestrationId};

#[async_trait]
pub trait OperationRepository: Send + Sync {
    /// Insert a new operation.
    ///
    /// Must atomically reject the insert with `StoreError::Conflict` when the
    /// instance already has a non-terminal operation, so a second concurrent
    /// lifecycle action can never be enqueued.
    async fn insert(&self, operation: &Operation) -> Result<(), StoreError>;

    /// Persist the current state of an existing operation.
    async fn update(&self, operation: &Operation) -> Result<(), StoreError>;

    async fn get(&self, id: &OperationId) -> Result<Option<Operation>, StoreError>;

    async fn list_by_instance(&self, instance_id: &InstanceId)
        -> Result<Vec<Operation>, StoreError>;

    async fn list_by_orchestration(
        &self,
        orchestration_id: &OrchestrationId,
    ) -> Result<Vec<Operation>, StoreError>;

    /// All operations that have not reached a terminal status. Used to
    /// re-seed the executor queue after a restart.
    async fn list_unfinished(&self) -> Result<Vec<Operation>, StoreError>;

    /// Take the exclusivity marker for `owner`.
    ///
    /// Returns the fresh operation record on success. Returns `Ok(None)` when
    /// another owner holds a claim younger than `stale_after`; such a claim
    /// means the operation is being driven elsewhere and the caller must drop
    /// its queue entry. A claim older than `stale_after` is treated as
    /// abandoned and taken over.
    async fn claim(
        &self,
        id: &OperationId,
        owner: &str,
        stale_after: Duration,
    ) -> Result<Option<Operation>, StoreError>;

    /// Release the exclusivity marker if `owner` holds it.
    async fn release(&self, id: &OperationId, owner: &str) -> Result<(), StoreError>;
}
