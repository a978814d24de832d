//! Reconciler Client Port
//!
//! Interface to the external configuration reconciler. A submitted
//! configuration is identified by the reconciliation id the reconciler hands
//! back; convergence is observed by polling. The configuration payload
//! embeds the producing operation id, which the reconciler treats as an
//! idempotency key for resubmissions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stratus_core::{ClusterConfiguration, ReconciliationId, RuntimeId};

/// State of a submitted reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Pending,
    Succeeded,
    Failed { reason: String },
}

/// Filters for listing reconciliation records. Empty vectors mean
/// "no filter on this dimension"; state values are the reconciler's own
/// vocabulary (`ok`, `err`, `suspended`, `all`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationQuery {
    #[serde(default)]
    pub runtime_ids: Vec<String>,
    #[serde(default)]
    pub states: Vec<String>,
    #[serde(default)]
    pub shoots: Vec<String>,
}

impl ReconciliationQuery {
    pub fn is_empty(&self) -> bool {
        self.runtime_ids.is_empty() && self.states.is_empty() && self.shoots.is_empty()
    }
}

/// One reconciliation as reported by the reconciler's listing endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub reconciliation_id: String,
    pub runtime_id: String,
    #[serde(default)]
    pub shoot: Option<String>,
    pub status: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[async_trait]
pub trait ReconcilerClient: Send + Sync {
    /// Submit a desired configuration for a runtime.
    async fn submit_configuration(
        &self,
        runtime_id: &RuntimeId,
        configuration: &ClusterConfiguration,
    ) -> Result<ReconciliationId, ReconcilerError>;

    async fn configuration_status(
        &self,
        id: &ReconciliationId,
    ) -> Result<ReconciliationStatus, ReconcilerError>;

    /// List reconciliation records matching the query.
    async fn list_reconciliations(
        &self,
        query: &ReconciliationQuery,
    ) -> Result<Vec<ReconciliationRecord>, ReconcilerError>;
}

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("reconciler request timed out: {0}")]
    Timeout(String),

    #[error("reconciler unavailable: {0}")]
    Unavailable(String),

    #[error("reconciler rejected the configuration: {0}")]
    Rejected(String),

    #[error("reconciler protocol error: {0}")]
    Protocol(String),
}

impl ReconcilerError {
    /// Whether a retry may succeed without operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReconcilerError::Timeout(_) | ReconcilerError::Unavailable(_)
        )
    }
}
