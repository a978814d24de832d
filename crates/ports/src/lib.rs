//! Ports - Abstraction Layer
//!
//! This crate defines ports (traits) that represent the interfaces
//! needed by the executor and orchestration modules. These are implemented
//! by adapters in the infrastructure layer.

pub mod event_bus;
pub mod instance_repository;
pub mod operation_repository;
pub mod orchestration_repository;
pub mod provisioner_client;
pub mod reconciler_client;
pub mod runtime_state_repository;
pub mod store;

pub use crate::event_bus::{
    EventBusError, EventPublisher, EventReceiver, EventSubscriber, LifecycleEvent,
};
pub use crate::instance_repository::InstanceRepository;
pub use crate::operation_repository::OperationRepository;
pub use crate::orchestration_repository::OrchestrationRepository;
pub use crate::provisioner_client::{
    InfrastructureSpec, InfrastructureStatus, ProvisionerClient, ProvisionerError, TeardownSpec,
};
pub use crate::reconciler_client::{
    ReconcilerClient, ReconcilerError, ReconciliationQuery, ReconciliationRecord,
    ReconciliationStatus,
};
pub use crate::runtime_state_repository::RuntimeStateRepository;
pub use crate::store::StoreError;
