//! Instance Repository Port
//!
//! Inventory of managed runtimes. Orchestration target resolution reads a
//! point-in-time snapshot through `list_active`.

use crate::StoreError;
use async_trait::async_trait;
use stratus_core::{Instance, InstanceId, RuntimeId};

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Insert a new instance. Fails with `StoreError::Conflict` when the id
    /// is already taken.
    async fn insert(&self, instance: &Instance) -> Result<(), StoreError>;

    async fn update(&self, instance: &Instance) -> Result<(), StoreError>;

    async fn get(&self, id: &InstanceId) -> Result<Option<Instance>, StoreError>;

    async fn get_by_runtime(&self, runtime_id: &RuntimeId)
        -> Result<Option<Instance>, StoreError>;

    async fn list(&self) -> Result<Vec<Instance>, StoreError>;

    /// Provisioned, not yet deprovisioned instances. The orchestration
    /// engine's resolution snapshot.
    async fn list_active(&self) -> Result<Vec<Instance>, StoreError>;
}
