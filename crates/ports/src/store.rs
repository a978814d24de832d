//! Shared error type for the durable store ports.

use stratus_core::{InstanceId, OperationId, OrchestrationId};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("orchestration not found: {0}")]
    OrchestrationNotFound(OrchestrationId),

    /// A non-terminal operation already exists for the instance.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("invalid stored data: {0}")]
    Corrupt(String),
}
