//! Adapters - Infrastructure Implementations
//!
//! This crate contains the implementations of the ports defined in
//! stratus-ports: in-memory and PostgreSQL stores, the in-process event bus,
//! and the HTTP clients for the provisioner and the reconciler, together with
//! their scripted mocks.

pub mod bus;
pub mod memory;
pub mod postgres;
pub mod provisioner_client;
pub mod reconciler_client;

pub use crate::bus::{InMemoryBus, InMemoryBusBuilder};
pub use crate::memory::{
    InMemoryInstanceStore, InMemoryOperationStore, InMemoryOrchestrationStore,
    InMemoryRuntimeStateStore,
};
pub use crate::postgres::{
    PostgresInstanceStore, PostgresOperationStore, PostgresOrchestrationStore,
    PostgresRuntimeStateStore, connect,
};
pub use crate::provisioner_client::{HttpProvisionerClient, MockProvisionerClient};
pub use crate::reconciler_client::{HttpReconcilerClient, MockReconcilerClient};
