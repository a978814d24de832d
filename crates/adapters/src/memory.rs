//! In-Memory Store Implementations
//!
//! Full implementations of the store ports over `Arc<RwLock<HashMap>>`.
//! Used by the test suites and by the server's `memory` backend. Conflict
//! and claim arbitration happen under the write lock, which gives the same
//! atomicity the Postgres stores get from their unique index and row lock.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use stratus_core::{
    Instance, InstanceId, Operation, OperationId, Orchestration, OrchestrationId, RuntimeId,
    RuntimeState,
};
use stratus_ports::{
    InstanceRepository, OperationRepository, OrchestrationRepository, RuntimeStateRepository,
    StoreError,
};
use tokio::sync::RwLock;

/// In-memory operation store
#[derive(Clone, Default)]
pub struct InMemoryOperationStore {
    operations: Arc<RwLock<HashMap<OperationId, Operation>>>,
}

impl InMemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OperationRepository for InMemoryOperationStore {
    async fn insert(&self, operation: &Operation) -> Result<(), StoreError> {
        let mut operations = self.operations.write().await;
        if operations.contains_key(&operation.id) {
            return Err(StoreError::Conflict(format!(
                "operation {} already exists",
                operation.id
            )));
        }
        let conflicting = operations
            .values()
            .any(|o| o.instance_id == operation.instance_id && !o.is_terminal());
        if conflicting {
            return Err(StoreError::Conflict(format!(
                "instance {} already has a non-terminal operation",
                operation.instance_id
            )));
        }
        operations.insert(operation.id, operation.clone());
        Ok(())
    }

    async fn update(&self, operation: &Operation) -> Result<(), StoreError> {
        let mut operations = self.operations.write().await;
        match operations.get_mut(&operation.id) {
            Some(existing) => {
                *existing = operation.clone();
                Ok(())
            }
            None => Err(StoreError::OperationNotFound(operation.id)),
        }
    }

    async fn get(&self, id: &OperationId) -> Result<Option<Operation>, StoreError> {
        Ok(self.operations.read().await.get(id).cloned())
    }

    async fn list_by_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<Operation>, StoreError> {
        let operations = self.operations.read().await;
        let mut result: Vec<Operation> = operations
            .values()
            .filter(|o| o.instance_id == *instance_id)
            .cloned()
            .collect();
        result.sort_by_key(|o| o.created_at);
        Ok(result)
    }

    async fn list_by_orchestration(
        &self,
        orchestration_id: &OrchestrationId,
    ) -> Result<Vec<Operation>, StoreError> {
        let operations = self.operations.read().await;
        let mut result: Vec<Operation> = operations
            .values()
            .filter(|o| o.orchestration_id == Some(*orchestration_id))
            .cloned()
            .collect();
        result.sort_by_key(|o| o.created_at);
        Ok(result)
    }

    async fn list_unfinished(&self) -> Result<Vec<Operation>, StoreError> {
        let operations = self.operations.read().await;
        let mut result: Vec<Operation> = operations
            .values()
            .filter(|o| !o.is_terminal())
            .cloned()
            .collect();
        result.sort_by_key(|o| o.created_at);
        Ok(result)
    }

    async fn claim(
        &self,
        id: &OperationId,
        owner: &str,
        stale_after: Duration,
    ) -> Result<Option<Operation>, StoreError> {
        let mut operations = self.operations.write().await;
        let operation = operations
            .get_mut(id)
            .ok_or(StoreError::OperationNotFound(*id))?;

        let now = Utc::now();
        let takeover = match (&operation.claimed_by, operation.claimed_at) {
            (None, _) => true,
            (Some(current), _) if current == owner => true,
            (Some(_), Some(at)) => at + stale_after < now,
            // claim without a timestamp is treated as abandoned
            (Some(_), None) => true,
        };
        if !takeover {
            return Ok(None);
        }

        operation.claimed_by = Some(owner.to_string());
        operation.claimed_at = Some(now);
        Ok(Some(operation.clone()))
    }

    async fn release(&self, id: &OperationId, owner: &str) -> Result<(), StoreError> {
        let mut operations = self.operations.write().await;
        let operation = operations
            .get_mut(id)
            .ok_or(StoreError::OperationNotFound(*id))?;
        if operation.claimed_by.as_deref() == Some(owner) {
            operation.claimed_by = None;
            operation.claimed_at = None;
        }
        Ok(())
    }
}

/// In-memory instance store
#[derive(Clone, Default)]
pub struct InMemoryInstanceStore {
    instances: Arc<RwLock<HashMap<InstanceId, Instance>>>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceRepository for InMemoryInstanceStore {
    async fn insert(&self, instance: &Instance) -> Result<(), StoreError> {
        let mut instances = self.instances.write().await;
        if instances.contains_key(&instance.instance_id) {
            return Err(StoreError::Conflict(format!(
                "instance {} already exists",
                instance.instance_id
            )));
        }
        instances.insert(instance.instance_id.clone(), instance.clone());
        Ok(())
    }

    async fn update(&self, instance: &Instance) -> Result<(), StoreError> {
        let mut instances = self.instances.write().await;
        match instances.get_mut(&instance.instance_id) {
            Some(existing) => {
                *existing = instance.clone();
                Ok(())
            }
            None => Err(StoreError::InstanceNotFound(instance.instance_id.clone())),
        }
    }

    async fn get(&self, id: &InstanceId) -> Result<Option<Instance>, StoreError> {
        Ok(self.instances.read().await.get(id).cloned())
    }

    async fn get_by_runtime(
        &self,
        runtime_id: &RuntimeId,
    ) -> Result<Option<Instance>, StoreError> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .find(|i| i.runtime_id == *runtime_id)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Instance>, StoreError> {
        let instances = self.instances.read().await;
        let mut result: Vec<Instance> = instances.values().cloned().collect();
        result.sort_by_key(|i| i.created_at);
        Ok(result)
    }

    async fn list_active(&self) -> Result<Vec<Instance>, StoreError> {
        let instances = self.instances.read().await;
        let mut result: Vec<Instance> = instances
            .values()
            .filter(|i| i.is_active())
            .cloned()
            .collect();
        result.sort_by_key(|i| i.created_at);
        Ok(result)
    }
}

/// In-memory runtime state store. Append-only; insertion order is creation
/// order.
#[derive(Clone, Default)]
pub struct InMemoryRuntimeStateStore {
    states: Arc<RwLock<Vec<RuntimeState>>>,
}

impl InMemoryRuntimeStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuntimeStateRepository for InMemoryRuntimeStateStore {
    async fn insert(&self, state: &RuntimeState) -> Result<(), StoreError> {
        let mut states = self.states.write().await;
        if states.iter().any(|s| s.operation_id == state.operation_id) {
            return Err(StoreError::Conflict(format!(
                "operation {} already produced a runtime state",
                state.operation_id
            )));
        }
        states.push(state.clone());
        Ok(())
    }

    async fn get_latest_by_runtime(
        &self,
        runtime_id: &RuntimeId,
    ) -> Result<Option<RuntimeState>, StoreError> {
        let states = self.states.read().await;
        Ok(states
            .iter()
            .rev()
            .find(|s| s.runtime_id == *runtime_id)
            .cloned())
    }

    async fn list_by_runtime(
        &self,
        runtime_id: &RuntimeId,
    ) -> Result<Vec<RuntimeState>, StoreError> {
        let states = self.states.read().await;
        Ok(states
            .iter()
            .rev()
            .filter(|s| s.runtime_id == *runtime_id)
            .cloned()
            .collect())
    }

    async fn get_by_operation(
        &self,
        operation_id: &OperationId,
    ) -> Result<Option<RuntimeState>, StoreError> {
        let states = self.states.read().await;
        Ok(states
            .iter()
            .find(|s| s.operation_id == *operation_id)
            .cloned())
    }
}

/// In-memory orchestration store
#[derive(Clone, Default)]
pub struct InMemoryOrchestrationStore {
    orchestrations: Arc<RwLock<HashMap<OrchestrationId, Orchestration>>>,
}

impl InMemoryOrchestrationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrchestrationRepository for InMemoryOrchestrationStore {
    async fn insert(&self, orchestration: &Orchestration) -> Result<(), StoreError> {
        let mut orchestrations = self.orchestrations.write().await;
        if orchestrations.contains_key(&orchestration.id) {
            return Err(StoreError::Conflict(format!(
                "orchestration {} already exists",
                orchestration.id
            )));
        }
        orchestrations.insert(orchestration.id, orchestration.clone());
        Ok(())
    }

    async fn update(&self, orchestration: &Orchestration) -> Result<(), StoreError> {
        let mut orchestrations = self.orchestrations.write().await;
        match orchestrations.get_mut(&orchestration.id) {
            Some(existing) => {
                *existing = orchestration.clone();
                Ok(())
            }
            None => Err(StoreError::OrchestrationNotFound(orchestration.id)),
        }
    }

    async fn get(&self, id: &OrchestrationId) -> Result<Option<Orchestration>, StoreError> {
        Ok(self.orchestrations.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Orchestration>, StoreError> {
        let orchestrations = self.orchestrations.read().await;
        let mut result: Vec<Orchestration> = orchestrations.values().cloned().collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    async fn list_unfinished(&self) -> Result<Vec<Orchestration>, StoreError> {
        let orchestrations = self.orchestrations.read().await;
        let mut result: Vec<Orchestration> = orchestrations
            .values()
            .filter(|o| !o.is_terminal())
            .cloned()
            .collect();
        result.sort_by_key(|o| o.created_at);
        Ok(result)
    }
}
