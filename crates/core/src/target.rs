//! Orchestration target selection
//!
//! Declarative include/exclude rules resolved against the instance inventory.
//! A rule matches when every present field matches; a rule with no fields set
//! matches every active instance.

use crate::{DomainError, Instance, RuntimeId};
use serde::{Deserialize, Serialize};

/// One selection rule. Fields are ANDed; absent fields are wildcards.
/// Unknown filter keys are rejected at deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetRule {
    pub subaccount: Option<String>,
    pub global_account: Option<String>,
    pub runtime_id: Option<RuntimeId>,
    pub region: Option<String>,
    pub plan: Option<String>,
}

impl TargetRule {
    pub fn matches(&self, instance: &Instance) -> bool {
        if let Some(ref sa) = self.subaccount {
            if *sa != instance.subaccount_id {
                return false;
            }
        }
        if let Some(ref ga) = self.global_account {
            if *ga != instance.global_account_id {
                return false;
            }
        }
        if let Some(ref id) = self.runtime_id {
            if *id != instance.runtime_id {
                return false;
            }
        }
        if let Some(ref region) = self.region {
            if *region != instance.region {
                return false;
            }
        }
        if let Some(ref plan) = self.plan {
            if *plan != instance.service_plan {
                return false;
            }
        }
        true
    }
}

/// Include rules are unioned, exclude rules subtracted from the result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub include: Vec<TargetRule>,
    #[serde(default)]
    pub exclude: Vec<TargetRule>,
}

impl TargetSpec {
    /// # Errors
    /// Returns `DomainError::Validation` when no include rule is given.
    pub fn validate(&self) -> crate::Result<()> {
        if self.include.is_empty() {
            return Err(DomainError::Validation(
                "target spec requires at least one include rule".to_string(),
            ));
        }
        Ok(())
    }

    pub fn selects(&self, instance: &Instance) -> bool {
        self.include.iter().any(|r| r.matches(instance))
            && !self.exclude.iter().any(|r| r.matches(instance))
    }
}
