//! Orchestration Repository Port

use crate::StoreError;
use async_trait::async_trait;
use stratus_core::{Orchestration, OrchestrationId};

#[async_trait]
pub trait OrchestrationRepository: Send + Sync {
    async fn insert(&self, orchestration: &Orchestration) -> Result<(), StoreError>;

    async fn update(&self, orchestration: &Orchestration) -> Result<(), StoreError>;

    async fn get(&self, id: &OrchestrationId) -> Result<Option<Orchestration>, StoreError>;

    /// All orchestrations, newest first.
    async fn list(&self) -> Result<Vec<Orchestration>, StoreError>;

    /// Orchestrations that have not reached a terminal status.
    async fn list_unfinished(&self) -> Result<Vec<Orchestration>, StoreError>;
}
