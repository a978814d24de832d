//! Runtime State Repository Port
//!
//! Append-only storage for converged-configuration snapshots. Records are
//! never updated; "latest" is creation order per runtime.

use crate::StoreError;
use async_trait::async_trait;
use stratus_core::{OperationId, RuntimeId, RuntimeState};

#[async_trait]
pub trait RuntimeStateRepository: Send + Sync {
    async fn insert(&self, state: &RuntimeState) -> Result<(), StoreError>;

    /// Most recently created state for a runtime.
    async fn get_latest_by_runtime(
        &self,
        runtime_id: &RuntimeId,
    ) -> Result<Option<RuntimeState>, StoreError>;

    /// All states for a runtime, newest first.
    async fn list_by_runtime(&self, runtime_id: &RuntimeId)
        -> Result<Vec<RuntimeState>, StoreError>;

    /// State produced by a given operation, if any. Lets the producing step
    /// re-run without writing a duplicate.
    async fn get_by_operation(
        &self,
        operation_id: &OperationId,
    ) -> Result<Option<RuntimeState>, StoreError>;
}
