//! Lifecycle service
//!
//! The creation surface for single-runtime lifecycle actions. It validates
//! the caller's parameters, keeps the instance inventory in sync, records the
//! operation and hands it to the step executor. Everything after acceptance
//! is the executor's business; this service never mutates a running
//! operation except for cancellation requests and audit annotations.

use crate::executor::StepExecutor;
use std::collections::BTreeMap;
use std::sync::Arc;
use stratus_core::{
    DomainError, Instance, InstanceId, Operation, OperationId, OperationKind, OperationParameters,
    RuntimeId,
};
use stratus_ports::{InstanceRepository, OperationRepository, StoreError};
use tracing::{debug, info};

#[derive(thiserror::Error, Debug)]
pub enum LifecycleError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(StoreError),

    #[error("instance {0} not found")]
    InstanceNotFound(InstanceId),

    #[error("operation {0} not found")]
    OperationNotFound(OperationId),

    /// The instance already has a lifecycle action in flight, or is not in a
    /// state that admits the requested action.
    #[error("instance {0}: {1}")]
    Conflict(InstanceId, String),
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        LifecycleError::Store(err)
    }
}

/// Accepts lifecycle actions and feeds them to the executor.
pub struct LifecycleService {
    operations: Arc<dyn OperationRepository>,
    instances: Arc<dyn InstanceRepository>,
    executor: Arc<StepExecutor>,
}

impl LifecycleService {
    pub fn new(
        operations: Arc<dyn OperationRepository>,
        instances: Arc<dyn InstanceRepository>,
        executor: Arc<StepExecutor>,
    ) -> Self {
        Self {
            operations,
            instances,
            executor,
        }
    }

    /// Accept a provisioning request for `instance_id`.
    ///
    /// A fresh instance gets an inventory record with a newly generated
    /// runtime id; a deprovisioned instance is revived under a fresh runtime
    /// id. An active instance rejects the request.
    ///
    /// # Errors
    /// `Domain` for missing parameters, `Conflict` when the instance is
    /// active or already has an operation in flight.
    pub async fn provision(
        &self,
        instance_id: InstanceId,
        parameters: OperationParameters,
    ) -> Result<OperationId, LifecycleError> {
        let name = require(&parameters.name, "name")?;
        let service_plan = require(&parameters.service_plan, "service_plan")?;
        let region = require(&parameters.region, "region")?;
        let global_account = require(&parameters.global_account_id, "global_account_id")?;
        let subaccount = require(&parameters.subaccount_id, "subaccount_id")?;

        let runtime_id = RuntimeId::new();
        match self.instances.get(&instance_id).await? {
            None => {
                let mut instance = Instance::new(
                    instance_id.clone(),
                    runtime_id,
                    name,
                    global_account,
                    subaccount,
                    service_plan,
                    region,
                );
                instance.maintenance_window = parameters.maintenance_window;
                self.instances.insert(&instance).await?;
                debug!("instance {} registered as runtime {}", instance_id, runtime_id);
            }
            Some(instance) if instance.is_active() => {
                return Err(LifecycleError::Conflict(
                    instance_id,
                    "instance is already provisioned".to_string(),
                ));
            }
            Some(mut instance) => {
                instance.revive(runtime_id);
                if parameters.maintenance_window.is_some() {
                    instance.maintenance_window = parameters.maintenance_window;
                }
                self.instances.update(&instance).await?;
                debug!("instance {} revived as runtime {}", instance_id, runtime_id);
            }
        }

        self.accept(instance_id, runtime_id, OperationKind::Provision, parameters)
            .await
    }

    /// Accept a configuration update for an active instance.
    ///
    /// # Errors
    /// `InstanceNotFound` for an unknown id, `Conflict` when the instance is
    /// not active or has an operation in flight.
    pub async fn update(
        &self,
        instance_id: InstanceId,
        parameters: OperationParameters,
    ) -> Result<OperationId, LifecycleError> {
        let instance = self.active_instance(&instance_id).await?;
        self.accept(instance_id, instance.runtime_id, OperationKind::Update, parameters)
            .await
    }

    /// Accept a teardown request for an active instance.
    ///
    /// # Errors
    /// `InstanceNotFound` for an unknown id, `Conflict` when the instance is
    /// not active or has an operation in flight.
    pub async fn deprovision(
        &self,
        instance_id: InstanceId,
        parameters: OperationParameters,
    ) -> Result<OperationId, LifecycleError> {
        let instance = self.active_instance(&instance_id).await?;
        self.accept(
            instance_id,
            instance.runtime_id,
            OperationKind::Deprovision,
            parameters,
        )
        .await
    }

    async fn active_instance(&self, instance_id: &InstanceId) -> Result<Instance, LifecycleError> {
        let instance = self
            .instances
            .get(instance_id)
            .await?
            .ok_or_else(|| LifecycleError::InstanceNotFound(instance_id.clone()))?;
        if !instance.is_active() {
            return Err(LifecycleError::Conflict(
                instance_id.clone(),
                "instance is not provisioned".to_string(),
            ));
        }
        Ok(instance)
    }

    /// Record the operation and enqueue it. The store's atomic conflict check
    /// is what keeps the one-in-flight-per-instance invariant.
    async fn accept(
        &self,
        instance_id: InstanceId,
        runtime_id: RuntimeId,
        kind: OperationKind,
        parameters: OperationParameters,
    ) -> Result<OperationId, LifecycleError> {
        let operation = Operation::new(
            OperationId::new(),
            instance_id.clone(),
            runtime_id,
            kind,
            parameters,
        );
        match self.operations.insert(&operation).await {
            Ok(()) => {}
            Err(StoreError::Conflict(reason)) => {
                return Err(LifecycleError::Conflict(instance_id, reason));
            }
            Err(err) => return Err(err.into()),
        }
        self.executor.enqueue(operation.id).await;
        info!(
            "operation {} ({} {}) accepted",
            operation.id, kind, instance_id
        );
        Ok(operation.id)
    }

    /// # Errors
    /// `OperationNotFound` for an unknown id.
    pub async fn get_operation(&self, id: &OperationId) -> Result<Operation, LifecycleError> {
        self.operations
            .get(id)
            .await?
            .ok_or(LifecycleError::OperationNotFound(*id))
    }

    pub async fn list_operations(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<Operation>, LifecycleError> {
        Ok(self.operations.list_by_instance(instance_id).await?)
    }

    /// Ask the executor to stop the operation at its next step boundary.
    /// Already applied side effects stay applied.
    ///
    /// # Errors
    /// `Domain` when the operation already finished.
    pub async fn cancel_operation(&self, id: &OperationId) -> Result<(), LifecycleError> {
        let mut operation = self.get_operation(id).await?;
        if operation.is_terminal() {
            return Err(DomainError::invalid_state_transition(
                operation.status.as_str(),
                "canceled",
            )
            .into());
        }
        operation.request_cancel();
        self.operations.update(&operation).await?;
        info!("operation {} cancellation requested", id);
        Ok(())
    }

    /// Merge audit annotations into the operation. Allowed on terminal
    /// records; annotations are the one field that stays mutable.
    ///
    /// # Errors
    /// `OperationNotFound` for an unknown id.
    pub async fn annotate_operation(
        &self,
        id: &OperationId,
        annotations: BTreeMap<String, String>,
    ) -> Result<Operation, LifecycleError> {
        let mut operation = self.get_operation(id).await?;
        operation.annotations.extend(annotations);
        self.operations.update(&operation).await?;
        Ok(operation)
    }
}

fn require<'a>(field: &'a Option<String>, name: &str) -> Result<&'a str, LifecycleError> {
    field
        .as_deref()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            DomainError::Validation(format!("provisioning requires {name}")).into()
        })
}
