//! Core domain model for the stratus control plane
//!
//! Pure domain types and invariants: lifecycle operations, instance
//! inventory, runtime-state snapshots and orchestrations. No IO lives here;
//! persistence and external services are reached through the port traits in
//! `stratus-ports`.

pub mod configuration;
pub mod error;
pub mod ids;
pub mod instance;
pub mod operation;
pub mod orchestration;
pub mod runtime_state;
pub mod target;

pub use configuration::{ClusterConfiguration, Component, DEFAULT_COMPONENTS};
pub use error::DomainError;
pub use ids::{
    InstanceId, OperationId, OrchestrationId, ReconciliationId, RuntimeId, RuntimeStateId,
};
pub use instance::{Instance, MaintenanceWindow};
pub use operation::{LastError, Operation, OperationKind, OperationParameters, OperationStatus};
pub use orchestration::{
    MemberStatus, Orchestration, OrchestrationMember, OrchestrationStatus, ScheduleKind,
    StrategyKind, StrategySpec, UpgradeParameters,
};
pub use runtime_state::RuntimeState;
pub use target::{TargetRule, TargetSpec};

// Domain result type
pub type Result<T> = std::result::Result<T, DomainError>;
