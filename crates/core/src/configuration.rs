//! Cluster configuration payload
//!
//! The desired-state document submitted to the reconciler. Assembly is a pure
//! function of the operation inputs so a step re-run produces the identical
//! payload.

use crate::{OperationId, RuntimeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Components installed on every managed runtime.
pub const DEFAULT_COMPONENTS: &[&str] = &["service-mesh", "api-gateway", "eventing", "monitoring"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    pub runtime_id: RuntimeId,
    /// Producing operation, doubles as the submission idempotency key.
    pub operation_id: OperationId,
    pub runtime_version: String,
    pub profile: Option<String>,
    pub components: Vec<Component>,
    #[serde(default)]
    pub global_overrides: BTreeMap<String, String>,
}

impl ClusterConfiguration {
    /// Build the payload for a runtime at a given version.
    ///
    /// Override keys of the form `component.key` are routed to the named
    /// component when it is part of the installed set; everything else lands
    /// in the global section.
    pub fn assemble(
        runtime_id: RuntimeId,
        operation_id: OperationId,
        runtime_version: &str,
        profile: Option<&str>,
        overrides: &BTreeMap<String, String>,
    ) -> Self {
        let mut components: Vec<Component> = DEFAULT_COMPONENTS
            .iter()
            .map(|name| Component {
                name: (*name).to_string(),
                version: runtime_version.to_string(),
                overrides: BTreeMap::new(),
            })
            .collect();
        let mut global_overrides = BTreeMap::new();

        for (key, value) in overrides {
            match key.split_once('.') {
                Some((component, rest))
                    if components.iter().any(|c| c.name == component) && !rest.is_empty() =>
                {
                    if let Some(c) = components.iter_mut().find(|c| c.name == component) {
                        c.overrides.insert(rest.to_string(), value.clone());
                    }
                }
                _ => {
                    global_overrides.insert(key.clone(), value.clone());
                }
            }
        }

        Self {
            runtime_id,
            operation_id,
            runtime_version: runtime_version.to_string(),
            profile: profile.map(str::to_string),
            components,
            global_overrides,
        }
    }
}
