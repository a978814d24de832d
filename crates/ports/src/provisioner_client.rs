//! Provisioner Client Port
//!
//! Interface to the external infrastructure provisioner. Requests are
//! asynchronous: the provisioner hands out a job id which the executor polls
//! through repeat semantics. Both request calls carry the operation id as an
//! idempotency key, so a resubmission after a crash resolves to the original
//! job instead of a second cluster.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stratus_core::{OperationId, RuntimeId};

/// Infrastructure request for a new runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfrastructureSpec {
    pub runtime_id: RuntimeId,
    pub operation_id: OperationId,
    pub name: String,
    pub service_plan: String,
    pub region: String,
}

/// Teardown request for an existing runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownSpec {
    pub runtime_id: RuntimeId,
    pub operation_id: OperationId,
}

/// State of a provisioner job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InfrastructureStatus {
    Pending,
    Succeeded,
    Failed { reason: String },
}

#[async_trait]
pub trait ProvisionerClient: Send + Sync {
    /// Request cluster compute. Returns the provisioner job id.
    async fn request_infrastructure(
        &self,
        spec: &InfrastructureSpec,
    ) -> Result<String, ProvisionerError>;

    /// Request cluster teardown. Returns the provisioner job id.
    async fn request_teardown(&self, spec: &TeardownSpec) -> Result<String, ProvisionerError>;

    async fn job_status(&self, job_id: &str) -> Result<InfrastructureStatus, ProvisionerError>;
}

#[derive(thiserror::Error, Debug)]
pub enum ProvisionerError {
    #[error("provisioner request timed out: {0}")]
    Timeout(String),

    #[error("provisioner unavailable: {0}")]
    Unavailable(String),

    #[error("provisioner rejected the request: {0}")]
    Rejected(String),

    #[error("provisioner protocol error: {0}")]
    Protocol(String),
}

impl ProvisionerError {
    /// Whether a retry may succeed without operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProvisionerError::Timeout(_) | ProvisionerError::Unavailable(_)
        )
    }
}
