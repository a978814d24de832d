//! Shared fixture for end-to-end tests.
//!
//! A [`Stack`] is the whole control plane over in-memory stores and scripted
//! mock clients, with timings tightened so a full provision pipeline finishes
//! in milliseconds. Tests drive it exclusively through the public surfaces:
//! the lifecycle service and the orchestration engine.

use std::sync::Arc;
use std::time::Duration;

use stratus_adapters::{
    InMemoryBus, InMemoryInstanceStore, InMemoryOperationStore, InMemoryOrchestrationStore,
    InMemoryRuntimeStateStore, MockProvisionerClient, MockReconcilerClient,
};
use stratus_core::{
    Instance, InstanceId, Operation, OperationId, OperationParameters, Orchestration,
    OrchestrationId,
};
use stratus_ports::{InstanceRepository, OperationRepository, OrchestrationRepository};
use stratus_modules::{
    ExecutorConfig, ExecutorContext, LifecycleService, OrchestrationConfig, OrchestrationEngine,
    StepExecutor,
};

pub struct Stack {
    pub operations: Arc<InMemoryOperationStore>,
    pub instances: Arc<InMemoryInstanceStore>,
    pub runtime_states: Arc<InMemoryRuntimeStateStore>,
    pub orchestrations: Arc<InMemoryOrchestrationStore>,
    pub provisioner: MockProvisionerClient,
    pub reconciler: MockReconcilerClient,
    pub bus: Arc<InMemoryBus>,
    pub executor: Arc<StepExecutor>,
    pub engine: Arc<OrchestrationEngine>,
    pub lifecycle: LifecycleService,
}

impl Stack {
    /// Build and start a full stack. The executor worker pool is running when
    /// this returns.
    pub fn start() -> Self {
        Self::start_with(ExecutorConfig {
            workers: 4,
            backoff_base_ms: 1,
            backoff_cap_ms: 4,
            poll_interval_ms: 10,
            ..Default::default()
        })
    }

    pub fn start_with(config: ExecutorConfig) -> Self {
        let operations = Arc::new(InMemoryOperationStore::new());
        let instances = Arc::new(InMemoryInstanceStore::new());
        let runtime_states = Arc::new(InMemoryRuntimeStateStore::new());
        let orchestrations = Arc::new(InMemoryOrchestrationStore::new());
        let provisioner = MockProvisionerClient::new();
        let reconciler = MockReconcilerClient::new();
        let bus = Arc::new(InMemoryBus::default());

        let executor = Arc::new(StepExecutor::new(ExecutorContext {
            operations: operations.clone(),
            instances: instances.clone(),
            runtime_states: runtime_states.clone(),
            provisioner: Arc::new(provisioner.clone()),
            reconciler: Arc::new(reconciler.clone()),
            events: bus.clone(),
            config,
        }));
        executor.start();

        let engine = Arc::new(OrchestrationEngine::new(
            orchestrations.clone(),
            operations.clone(),
            instances.clone(),
            executor.clone(),
            bus.clone(),
            OrchestrationConfig {
                member_poll_interval_ms: 10,
            },
        ));
        let lifecycle =
            LifecycleService::new(operations.clone(), instances.clone(), executor.clone());

        Self {
            operations,
            instances,
            runtime_states,
            orchestrations,
            provisioner,
            reconciler,
            bus,
            executor,
            engine,
            lifecycle,
        }
    }

    /// Standard provisioning parameters under subaccount `sa`.
    pub fn provision_parameters(sa: &str) -> OperationParameters {
        OperationParameters {
            name: Some("cluster-a".into()),
            service_plan: Some("azure".into()),
            region: Some("westeurope".into()),
            global_account_id: Some("ga-1".into()),
            subaccount_id: Some(sa.into()),
            ..Default::default()
        }
    }

    /// Provision `instance_id` and wait for the pipeline to finish.
    pub async fn provision_active(&self, instance_id: &str, sa: &str) -> Instance {
        let id = self
            .lifecycle
            .provision(InstanceId::new(instance_id), Self::provision_parameters(sa))
            .await
            .expect("provisioning accepted");
        let operation = self.await_operation(id).await;
        assert!(
            operation.status == stratus_core::OperationStatus::Succeeded,
            "provisioning of {instance_id} failed: {:?}",
            operation.last_error
        );
        self.instances
            .get(&InstanceId::new(instance_id))
            .await
            .unwrap()
            .expect("inventory record")
    }

    pub async fn await_operation(&self, id: OperationId) -> Operation {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let operation = self.operations.get(&id).await.unwrap().unwrap();
                if operation.is_terminal() {
                    return operation;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("operation should reach a terminal status")
    }

    pub async fn await_orchestration(&self, id: OrchestrationId) -> Orchestration {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let orchestration = self.orchestrations.get(&id).await.unwrap().unwrap();
                if orchestration.is_terminal() {
                    return orchestration;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("orchestration should reach a terminal status")
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.executor.shutdown();
    }
}
