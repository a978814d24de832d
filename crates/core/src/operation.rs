//! Lifecycle operation aggregate
//!
//! An operation is the unit of work driven by the step executor. It records
//! which step of its kind-specific sequence it has reached, how often the
//! current step failed transiently, and the external references (provisioner
//! job, reconciliation) produced along the way. Every field is persisted after
//! every step invocation so a restarted executor can resume mid-sequence.

use crate::{
    DomainError, InstanceId, MaintenanceWindow, OperationId, OrchestrationId, ReconciliationId,
    RuntimeId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The four lifecycle operation kinds. Each kind maps to a fixed, ordered
/// step sequence owned by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Provision,
    Update,
    Upgrade,
    Deprovision,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Provision => "provision",
            OperationKind::Update => "update",
            OperationKind::Upgrade => "upgrade",
            OperationKind::Deprovision => "deprovision",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation status. `Succeeded` and `Failed` are terminal; a canceled
/// operation finishes as `Failed` with a cancellation reason in `last_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Succeeded | OperationStatus::Failed)
    }

    pub fn can_transition_to(&self, next: &OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress) | (Pending, Failed) | (InProgress, Succeeded) | (InProgress, Failed)
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied inputs, kept on the operation for the steps to consume.
/// Which fields are required depends on the operation kind and is validated
/// by the lifecycle service before the operation is stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationParameters {
    pub name: Option<String>,
    pub service_plan: Option<String>,
    pub region: Option<String>,
    pub global_account_id: Option<String>,
    pub subaccount_id: Option<String>,
    /// Target runtime version. Optional for provisioning (a configured
    /// default applies), mandatory for upgrades.
    pub runtime_version: Option<String>,
    pub profile: Option<String>,
    /// Configuration overrides, `component.key` or bare `key` form.
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    /// Daily window in which deferred orchestrations may touch the runtime.
    #[serde(default)]
    pub maintenance_window: Option<MaintenanceWindow>,
}

/// Snapshot of the most recent step failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub step: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl LastError {
    pub fn new(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }
}

/// Lifecycle operation aggregate root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub instance_id: InstanceId,
    pub runtime_id: RuntimeId,
    pub kind: OperationKind,
    pub status: OperationStatus,
    /// Set when the operation was created as an orchestration member.
    pub orchestration_id: Option<OrchestrationId>,
    pub parameters: OperationParameters,
    /// Index into the kind's step sequence.
    pub current_step: u32,
    /// First invocation time of the current step. Bounds the repeat budget.
    pub step_started_at: Option<DateTime<Utc>>,
    /// Transient failures of the current step so far.
    pub attempts: u32,
    /// Version resolved by the version step, applied by later steps.
    pub runtime_version: Option<String>,
    /// Infrastructure job handed out by the provisioner.
    pub provisioner_job_id: Option<String>,
    /// Reconciliation accepted by the reconciler.
    pub reconciliation_id: Option<ReconciliationId>,
    pub last_error: Option<LastError>,
    /// Observed by the executor at step boundaries only.
    pub cancel_requested: bool,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Free-form audit annotations (requester, ticket, ...).
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Operation {
    /// Create a new pending operation.
    pub fn new(
        id: OperationId,
        instance_id: InstanceId,
        runtime_id: RuntimeId,
        kind: OperationKind,
        parameters: OperationParameters,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            instance_id,
            runtime_id,
            kind,
            status: OperationStatus::Pending,
            orchestration_id: None,
            parameters,
            current_step: 0,
            step_started_at: None,
            attempts: 0,
            runtime_version: None,
            provisioner_job_id: None,
            reconciliation_id: None,
            last_error: None,
            cancel_requested: false,
            claimed_by: None,
            claimed_at: None,
            annotations: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Transition to `InProgress`.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidStateTransition` if the operation is not
    /// pending.
    pub fn start(&mut self) -> crate::Result<()> {
        self.transition(OperationStatus::InProgress)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Transition to `Succeeded` (terminal).
    ///
    /// # Errors
    /// Returns `DomainError::InvalidStateTransition` if the operation is not
    /// in progress.
    pub fn succeed(&mut self) -> crate::Result<()> {
        self.transition(OperationStatus::Succeeded)?;
        let now = Utc::now();
        self.updated_at = now;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Transition to `Failed` (terminal), recording the failure.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidStateTransition` if the operation already
    /// finished.
    pub fn fail(&mut self, error: LastError) -> crate::Result<()> {
        self.transition(OperationStatus::Failed)?;
        let now = Utc::now();
        self.last_error = Some(error);
        self.updated_at = now;
        self.finished_at = Some(now);
        Ok(())
    }

    fn transition(&mut self, next: OperationStatus) -> crate::Result<()> {
        if !self.status.can_transition_to(&next) {
            return Err(DomainError::invalid_state_transition(
                self.status.as_str(),
                next.as_str(),
            ));
        }
        self.status = next;
        Ok(())
    }

    /// Record the first invocation time of the current step.
    pub fn mark_step_started(&mut self) {
        if self.step_started_at.is_none() {
            self.step_started_at = Some(Utc::now());
        }
    }

    /// Move to the next step, resetting per-step bookkeeping.
    pub fn advance_step(&mut self) {
        self.current_step += 1;
        self.attempts = 0;
        self.step_started_at = None;
        self.updated_at = Utc::now();
    }

    /// Record a transient step failure that will be retried.
    pub fn record_transient_failure(&mut self, error: LastError) {
        self.attempts += 1;
        self.last_error = Some(error);
        self.updated_at = Utc::now();
    }

    /// Ask the executor to stop this operation at the next step boundary.
    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_pending(&self) -> bool {
        self.status == OperationStatus::Pending
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == OperationStatus::InProgress
    }
}
