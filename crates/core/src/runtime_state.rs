//! Runtime state snapshots
//!
//! One record per successfully converged configuration. A snapshot is written
//! only after the reconciler reports convergence, so the latest snapshot of a
//! runtime always describes a configuration that was actually reached.

use crate::{ClusterConfiguration, OperationId, ReconciliationId, RuntimeId, RuntimeStateId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub id: RuntimeStateId,
    pub runtime_id: RuntimeId,
    /// Operation that produced this state.
    pub operation_id: OperationId,
    pub reconciliation_id: ReconciliationId,
    pub configuration: ClusterConfiguration,
    /// Name of the secret holding the runtime's admin kubeconfig.
    pub kubeconfig_secret: String,
    pub created_at: DateTime<Utc>,
}

impl RuntimeState {
    pub fn new(
        operation_id: OperationId,
        reconciliation_id: ReconciliationId,
        configuration: ClusterConfiguration,
    ) -> Self {
        let runtime_id = configuration.runtime_id;
        Self {
            id: RuntimeStateId::new(),
            runtime_id,
            operation_id,
            reconciliation_id,
            configuration,
            kubeconfig_secret: format!("kubeconfig-{runtime_id}"),
            created_at: Utc::now(),
        }
    }
}
