//! Service instance inventory
//!
//! One record per managed runtime, keyed by the caller-supplied instance id.
//! The record carries the account coordinates used by orchestration target
//! filters and the maintenance window used by window-scheduled orchestrations.

use crate::{DomainError, InstanceId, RuntimeId};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Daily maintenance window in UTC wall-clock time. A window may wrap past
/// midnight (`begin > end`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub begin: NaiveTime,
    pub end: NaiveTime,
}

impl MaintenanceWindow {
    /// # Errors
    /// Returns `DomainError::Validation` for a zero-length window.
    pub fn new(begin: NaiveTime, end: NaiveTime) -> crate::Result<Self> {
        if begin == end {
            return Err(DomainError::Validation(
                "maintenance window must not be zero-length".to_string(),
            ));
        }
        Ok(Self { begin, end })
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.begin < self.end {
            self.begin <= t && t < self.end
        } else {
            t >= self.begin || t < self.end
        }
    }

    /// Earliest instant at or after `from` that falls inside the window.
    pub fn next_opening(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        if self.contains(from.time()) {
            return from;
        }
        let today_begin = from.date_naive().and_time(self.begin).and_utc();
        if today_begin > from {
            today_begin
        } else {
            today_begin + Duration::days(1)
        }
    }
}

/// Inventory record for one managed runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: InstanceId,
    pub runtime_id: RuntimeId,
    pub name: String,
    pub global_account_id: String,
    pub subaccount_id: String,
    pub service_plan: String,
    pub region: String,
    /// Version currently applied to the runtime, if any.
    pub runtime_version: Option<String>,
    pub maintenance_window: Option<MaintenanceWindow>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub provisioned_at: Option<DateTime<Utc>>,
    pub deprovisioned_at: Option<DateTime<Utc>>,
}

impl Instance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: InstanceId,
        runtime_id: RuntimeId,
        name: impl Into<String>,
        global_account_id: impl Into<String>,
        subaccount_id: impl Into<String>,
        service_plan: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id,
            runtime_id,
            name: name.into(),
            global_account_id: global_account_id.into(),
            subaccount_id: subaccount_id.into(),
            service_plan: service_plan.into(),
            region: region.into(),
            runtime_version: None,
            maintenance_window: None,
            created_at: now,
            updated_at: now,
            provisioned_at: None,
            deprovisioned_at: None,
        }
    }

    /// Provisioned and not yet torn down.
    pub fn is_active(&self) -> bool {
        self.provisioned_at.is_some() && self.deprovisioned_at.is_none()
    }

    /// Record a successfully applied configuration. Idempotent: the first
    /// provisioning timestamp is kept.
    pub fn mark_provisioned(&mut self, version: impl Into<String>) {
        if self.provisioned_at.is_none() {
            self.provisioned_at = Some(Utc::now());
        }
        self.runtime_version = Some(version.into());
        self.updated_at = Utc::now();
    }

    /// Record completed teardown. Idempotent.
    pub fn mark_deprovisioned(&mut self) {
        if self.deprovisioned_at.is_none() {
            self.deprovisioned_at = Some(Utc::now());
        }
        self.updated_at = Utc::now();
    }

    /// Reuse a deprovisioned record for a fresh runtime.
    pub fn revive(&mut self, runtime_id: RuntimeId) {
        self.runtime_id = runtime_id;
        self.runtime_version = None;
        self.provisioned_at = None;
        self.deprovisioned_at = None;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window(begin: &str, end: &str) -> MaintenanceWindow {
        MaintenanceWindow::new(begin.parse().unwrap(), end.parse().unwrap()).unwrap()
    }

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    // ===== Maintenance window tests =====

    #[test]
    fn test_window_contains_plain_range() {
        let w = window("01:00:00", "05:00:00");
        assert!(w.contains("01:00:00".parse().unwrap()));
        assert!(w.contains("03:30:00".parse().unwrap()));
        assert!(!w.contains("05:00:00".parse().unwrap()));
        assert!(!w.contains("12:00:00".parse().unwrap()));
    }

    #[test]
    fn test_window_contains_wraps_midnight() {
        let w = window("22:00:00", "02:00:00");
        assert!(w.contains("23:15:00".parse().unwrap()));
        assert!(w.contains("01:59:00".parse().unwrap()));
        assert!(!w.contains("12:00:00".parse().unwrap()));
        assert!(!w.contains("02:00:00".parse().unwrap()));
    }

    #[test]
    fn test_window_rejects_zero_length() {
        let t: NaiveTime = "01:00:00".parse().unwrap();
        assert!(MaintenanceWindow::new(t, t).is_err());
    }

    #[test]
    fn test_next_opening_inside_window_is_now() {
        let w = window("01:00:00", "05:00:00");
        let from = at("2024-03-10T02:00:00Z");
        assert_eq!(w.next_opening(from), from);
    }

    #[test]
    fn test_next_opening_before_window_is_today() {
        let w = window("22:00:00", "23:00:00");
        let from = at("2024-03-10T12:00:00Z");
        assert_eq!(w.next_opening(from), at("2024-03-10T22:00:00Z"));
    }

    #[test]
    fn test_next_opening_after_window_is_tomorrow() {
        let w = window("01:00:00", "05:00:00");
        let from = at("2024-03-10T08:00:00Z");
        assert_eq!(w.next_opening(from), at("2024-03-11T01:00:00Z"));
    }

    #[test]
    fn test_next_opening_handles_utc_boundary() {
        let w = window("22:00:00", "02:00:00");
        let from = Utc.with_ymd_and_hms(2024, 3, 10, 23, 0, 0).unwrap();
        assert_eq!(w.next_opening(from), from);
    }

    // ===== Instance lifecycle tests =====

    fn instance() -> Instance {
        Instance::new(
            InstanceId::new("inst-1"),
            RuntimeId::new(),
            "cluster-a",
            "ga-1",
            "sa-1",
            "azure",
            "westeurope",
        )
    }

    #[test]
    fn test_new_instance_is_not_active() {
        let i = instance();
        assert!(!i.is_active());
        assert!(i.runtime_version.is_none());
    }

    #[test]
    fn test_mark_provisioned_keeps_first_timestamp() {
        let mut i = instance();
        i.mark_provisioned("2.0.0");
        let first = i.provisioned_at;
        i.mark_provisioned("2.1.0");
        assert_eq!(i.provisioned_at, first);
        assert_eq!(i.runtime_version.as_deref(), Some("2.1.0"));
        assert!(i.is_active());
    }

    #[test]
    fn test_mark_deprovisioned_ends_activity() {
        let mut i = instance();
        i.mark_provisioned("2.0.0");
        i.mark_deprovisioned();
        assert!(!i.is_active());
        assert!(i.deprovisioned_at.is_some());
    }

    #[test]
    fn test_revive_resets_runtime() {
        let mut i = instance();
        i.mark_provisioned("2.0.0");
        i.mark_deprovisioned();
        let fresh = RuntimeId::new();
        i.revive(fresh);
        assert_eq!(i.runtime_id, fresh);
        assert!(i.provisioned_at.is_none());
        assert!(i.deprovisioned_at.is_none());
        assert!(i.runtime_version.is_none());
    }
}
