//! Target resolution
//!
//! Turns a declarative target spec into the concrete instance set of an
//! orchestration. Resolution runs against a point-in-time snapshot of the
//! active inventory and is deterministic for a fixed snapshot: include rules
//! are unioned, exclude rules subtracted, and the result is ordered by
//! instance id.

use stratus_core::{Instance, TargetSpec};

/// Resolve `spec` against an inventory snapshot.
pub fn resolve_targets(spec: &TargetSpec, snapshot: &[Instance]) -> Vec<Instance> {
    let mut resolved: Vec<Instance> = snapshot
        .iter()
        .filter(|instance| spec.selects(instance))
        .cloned()
        .collect();
    resolved.sort_by(|a, b| a.instance_id.as_str().cmp(b.instance_id.as_str()));
    resolved.dedup_by(|a, b| a.instance_id == b.instance_id);
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use stratus_core::{InstanceId, RuntimeId, TargetRule};

    fn instance(id: &str, subaccount: &str, region: &str, plan: &str) -> Instance {
        let mut instance = Instance::new(
            InstanceId::new(id),
            RuntimeId::new(),
            format!("cluster-{id}"),
            "ga-1",
            subaccount,
            plan,
            region,
        );
        instance.mark_provisioned("2.0.0");
        instance
    }

    fn ids(resolved: &[Instance]) -> Vec<&str> {
        resolved.iter().map(|i| i.instance_id.as_str()).collect()
    }

    #[test]
    fn test_resolution_is_ordered_by_instance_id() {
        let snapshot = vec![
            instance("inst-c", "sa-1", "westeurope", "azure"),
            instance("inst-a", "sa-1", "westeurope", "azure"),
            instance("inst-b", "sa-1", "westeurope", "azure"),
        ];
        let spec = TargetSpec {
            include: vec![TargetRule::default()],
            exclude: vec![],
        };

        assert_eq!(
            ids(&resolve_targets(&spec, &snapshot)),
            vec!["inst-a", "inst-b", "inst-c"]
        );
    }

    #[test]
    fn test_includes_union_excludes_subtract() {
        let snapshot = vec![
            instance("inst-1", "sa-1", "westeurope", "azure"),
            instance("inst-2", "sa-2", "eastus", "azure"),
            instance("inst-3", "sa-2", "westeurope", "trial"),
            instance("inst-4", "sa-3", "westeurope", "azure"),
        ];
        let spec = TargetSpec {
            include: vec![
                TargetRule {
                    subaccount: Some("sa-1".into()),
                    ..Default::default()
                },
                TargetRule {
                    subaccount: Some("sa-2".into()),
                    ..Default::default()
                },
            ],
            exclude: vec![TargetRule {
                plan: Some("trial".into()),
                ..Default::default()
            }],
        };

        assert_eq!(
            ids(&resolve_targets(&spec, &snapshot)),
            vec!["inst-1", "inst-2"]
        );
    }

    #[test]
    fn test_overlapping_includes_yield_one_member() {
        let snapshot = vec![instance("inst-1", "sa-1", "westeurope", "azure")];
        let spec = TargetSpec {
            include: vec![
                TargetRule {
                    subaccount: Some("sa-1".into()),
                    ..Default::default()
                },
                TargetRule {
                    region: Some("westeurope".into()),
                    ..Default::default()
                },
            ],
            exclude: vec![],
        };

        assert_eq!(resolve_targets(&spec, &snapshot).len(), 1);
    }

    #[test]
    fn test_no_match_resolves_empty() {
        let snapshot = vec![instance("inst-1", "sa-1", "westeurope", "azure")];
        let spec = TargetSpec {
            include: vec![TargetRule {
                subaccount: Some("sa-9".into()),
                ..Default::default()
            }],
            exclude: vec![],
        };

        assert!(resolve_targets(&spec, &snapshot).is_empty());
    }
}
