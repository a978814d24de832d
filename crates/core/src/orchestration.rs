//! Orchestration aggregate
//!
//! A batch upgrade request: a strategy, a target spec and a version to roll
//! out. Members are fixed at resolution time; the aggregate status is a pure
//! function of member statuses so it can be recomputed from storage at any
//! point.

use crate::{
    DomainError, InstanceId, OperationId, OrchestrationId, RuntimeId, TargetSpec,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Canceled,
}

impl OrchestrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestrationStatus::Pending => "pending",
            OrchestrationStatus::InProgress => "in_progress",
            OrchestrationStatus::Succeeded => "succeeded",
            OrchestrationStatus::Failed => "failed",
            OrchestrationStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Succeeded
                | OrchestrationStatus::Failed
                | OrchestrationStatus::Canceled
        )
    }
}

impl fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Parallel,
    Serial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Immediate,
    MaintenanceWindow,
}

/// Execution policy for an orchestration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategySpec {
    pub kind: StrategyKind,
    pub schedule: ScheduleKind,
    /// Concurrent members for `Parallel`; ignored for `Serial`.
    pub workers: usize,
}

impl StrategySpec {
    /// # Errors
    /// Returns `DomainError::Validation` for a parallel strategy without
    /// workers.
    pub fn validate(&self) -> crate::Result<()> {
        if self.kind == StrategyKind::Parallel && self.workers == 0 {
            return Err(DomainError::Validation(
                "parallel strategy requires workers >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Driver tasks to run: the configured worker count for parallel, one for
    /// serial.
    pub fn effective_workers(&self) -> usize {
        match self.kind {
            StrategyKind::Parallel => self.workers.max(1),
            StrategyKind::Serial => 1,
        }
    }
}

/// Version and configuration rolled out to every member.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpgradeParameters {
    pub runtime_version: String,
    pub profile: Option<String>,
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Queued,
    InProgress,
    Succeeded,
    Failed,
    Skipped,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::Queued => "queued",
            MemberStatus::InProgress => "in_progress",
            MemberStatus::Succeeded => "succeeded",
            MemberStatus::Failed => "failed",
            MemberStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MemberStatus::Succeeded | MemberStatus::Failed | MemberStatus::Skipped
        )
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One resolved runtime inside an orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationMember {
    pub runtime_id: RuntimeId,
    pub instance_id: InstanceId,
    /// Absent for skipped members (conflict, dry run).
    pub operation_id: Option<OperationId>,
    pub status: MemberStatus,
    pub reason: Option<String>,
    /// Earliest start, set under maintenance-window scheduling.
    pub not_before: Option<DateTime<Utc>>,
}

impl OrchestrationMember {
    pub fn queued(runtime_id: RuntimeId, instance_id: InstanceId, operation_id: OperationId) -> Self {
        Self {
            runtime_id,
            instance_id,
            operation_id: Some(operation_id),
            status: MemberStatus::Queued,
            reason: None,
            not_before: None,
        }
    }

    pub fn skipped(runtime_id: RuntimeId, instance_id: InstanceId, reason: impl Into<String>) -> Self {
        Self {
            runtime_id,
            instance_id,
            operation_id: None,
            status: MemberStatus::Skipped,
            reason: Some(reason.into()),
            not_before: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Orchestration {
    pub id: OrchestrationId,
    pub status: OrchestrationStatus,
    pub strategy: StrategySpec,
    pub targets: TargetSpec,
    pub parameters: UpgradeParameters,
    pub dry_run: bool,
    pub members: Vec<OrchestrationMember>,
    pub cancel_requested: bool,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Orchestration {
    /// Create a pending orchestration with an empty member list.
    ///
    /// # Errors
    /// Returns `DomainError::Validation` when the strategy or target spec is
    /// invalid.
    pub fn new(
        id: OrchestrationId,
        strategy: StrategySpec,
        targets: TargetSpec,
        parameters: UpgradeParameters,
        dry_run: bool,
    ) -> crate::Result<Self> {
        strategy.validate()?;
        targets.validate()?;
        if parameters.runtime_version.is_empty() {
            return Err(DomainError::Validation(
                "orchestration requires a target runtime version".to_string(),
            ));
        }
        let now = Utc::now();
        Ok(Self {
            id,
            status: OrchestrationStatus::Pending,
            strategy,
            targets,
            parameters,
            dry_run,
            members: Vec::new(),
            cancel_requested: false,
            description: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        })
    }

    /// Aggregate status as a pure function of member statuses and the cancel
    /// flag. Skipped members carry no outcome and are left out of the
    /// calculation; an orchestration whose every member was skipped (or that
    /// resolved no members at all) counts as succeeded.
    pub fn aggregate_status(
        members: &[OrchestrationMember],
        cancel_requested: bool,
    ) -> OrchestrationStatus {
        let active: Vec<&OrchestrationMember> = members
            .iter()
            .filter(|m| m.status != MemberStatus::Skipped)
            .collect();

        if active.iter().all(|m| m.status.is_terminal()) {
            let any_failed = active.iter().any(|m| m.status == MemberStatus::Failed);
            return if cancel_requested && any_failed {
                OrchestrationStatus::Canceled
            } else if any_failed {
                OrchestrationStatus::Failed
            } else {
                OrchestrationStatus::Succeeded
            };
        }

        if active.iter().all(|m| m.status == MemberStatus::Queued) {
            OrchestrationStatus::Pending
        } else {
            OrchestrationStatus::InProgress
        }
    }

    /// Recompute `status` from the member list, stamping `finished_at` on the
    /// transition into a terminal status.
    pub fn refresh_status(&mut self) {
        let next = Self::aggregate_status(&self.members, self.cancel_requested);
        if next != self.status {
            self.status = next;
            self.updated_at = Utc::now();
            if next.is_terminal() && self.finished_at.is_none() {
                self.finished_at = Some(Utc::now());
            }
        }
    }

    /// Flag the orchestration for cancellation.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidStateTransition` when already terminal.
    pub fn request_cancel(&mut self) -> crate::Result<()> {
        if self.status.is_terminal() {
            return Err(DomainError::invalid_state_transition(
                self.status.as_str(),
                OrchestrationStatus::Canceled.as_str(),
            ));
        }
        self.cancel_requested = true;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn member_mut(&mut self, runtime_id: &RuntimeId) -> Option<&mut OrchestrationMember> {
        self.members.iter_mut().find(|m| m.runtime_id == *runtime_id)
    }
}
