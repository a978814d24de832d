//! Orchestration engine
//!
//! Translates a declarative batch-upgrade request into a supervised set of
//! upgrade operations. The engine resolves the target spec against the active
//! inventory once, fixes the member set, and then drives every member through
//! the shared step executor under the requested strategy: a bounded worker
//! group for `parallel`, a single driver in creation order for `serial`.
//!
//! Member outcomes are persisted as they land and the aggregate status is
//! recomputed on every transition, so a reader of the store always sees a
//! status that is consistent with the member list.

mod resolver;

pub use resolver::resolve_targets;

use crate::executor::{steps_for, StepExecutor};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use stratus_core::{
    Instance, LastError, MemberStatus, Operation, OperationId, OperationKind, OperationParameters,
    Orchestration, OrchestrationId, RuntimeId, ScheduleKind, StrategySpec, TargetSpec,
    UpgradeParameters,
};
use stratus_ports::{
    EventPublisher, InstanceRepository, LifecycleEvent, OperationRepository,
    OrchestrationRepository, StoreError,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum OrchestrationError {
    #[error(transparent)]
    Domain(#[from] stratus_core::DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("orchestration {0} not found")]
    NotFound(OrchestrationId),
}

/// Tuning knobs for the orchestration engine. Durations are milliseconds.
#[derive(Debug, Clone)]
pub struct OrchestrationConfig {
    /// Delay between checks of a driven member's operation status, and the
    /// granularity at which a parked driver notices cancellation.
    pub member_poll_interval_ms: u64,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            member_poll_interval_ms: 2_000,
        }
    }
}

impl OrchestrationConfig {
    fn member_poll_interval(&self) -> Duration {
        Duration::from_millis(self.member_poll_interval_ms)
    }
}

/// One queued member awaiting a driver.
struct MemberSlot {
    runtime_id: RuntimeId,
    operation_id: OperationId,
    not_before: Option<DateTime<Utc>>,
}

/// The orchestration engine. Construct once, wrap in an `Arc`, share with the
/// HTTP surface.
pub struct OrchestrationEngine {
    orchestrations: Arc<dyn OrchestrationRepository>,
    operations: Arc<dyn OperationRepository>,
    instances: Arc<dyn InstanceRepository>,
    executor: Arc<StepExecutor>,
    events: Arc<dyn EventPublisher>,
    config: OrchestrationConfig,
    /// Serializes read-modify-write cycles on orchestration records driven by
    /// this process.
    update_lock: Mutex<()>,
}

impl OrchestrationEngine {
    pub fn new(
        orchestrations: Arc<dyn OrchestrationRepository>,
        operations: Arc<dyn OperationRepository>,
        instances: Arc<dyn InstanceRepository>,
        executor: Arc<StepExecutor>,
        events: Arc<dyn EventPublisher>,
        config: OrchestrationConfig,
    ) -> Self {
        Self {
            orchestrations,
            operations,
            instances,
            executor,
            events,
            config,
            update_lock: Mutex::new(()),
        }
    }

    /// Resolve the targets, fix the member set and start driving it.
    ///
    /// Dry runs persist the orchestration record with the resolved member
    /// list for audit, but create no operations and finish immediately.
    ///
    /// # Errors
    /// Returns `OrchestrationError::Domain` for an invalid strategy or target
    /// spec and `OrchestrationError::Store` when persistence fails.
    pub async fn schedule(
        self: &Arc<Self>,
        strategy: StrategySpec,
        targets: TargetSpec,
        parameters: UpgradeParameters,
        dry_run: bool,
    ) -> Result<OrchestrationId, OrchestrationError> {
        let mut orchestration = Orchestration::new(
            OrchestrationId::new(),
            strategy,
            targets,
            parameters,
            dry_run,
        )?;

        let snapshot = self.instances.list_active().await?;
        let resolved = resolve_targets(&orchestration.targets, &snapshot);
        info!(
            "orchestration {} resolved {} of {} active runtimes{}",
            orchestration.id,
            resolved.len(),
            snapshot.len(),
            if dry_run { " (dry run)" } else { "" }
        );

        if dry_run {
            for instance in &resolved {
                orchestration.members.push(
                    stratus_core::OrchestrationMember::skipped(
                        instance.runtime_id,
                        instance.instance_id.clone(),
                        "dry run",
                    ),
                );
            }
            orchestration.refresh_status();
            self.orchestrations.insert(&orchestration).await?;
            return Ok(orchestration.id);
        }

        for instance in &resolved {
            self.enroll_member(&mut orchestration, instance).await?;
        }
        orchestration.refresh_status();
        self.orchestrations.insert(&orchestration).await?;

        if orchestration.is_terminal() {
            self.announce_if_terminal(&orchestration).await;
        } else {
            self.spawn_drivers(&orchestration);
        }
        Ok(orchestration.id)
    }

    /// Create the upgrade operation for one resolved instance, or record the
    /// instance as skipped when it already has a lifecycle action in flight.
    async fn enroll_member(
        &self,
        orchestration: &mut Orchestration,
        instance: &Instance,
    ) -> Result<(), OrchestrationError> {
        let mut operation = Operation::new(
            OperationId::new(),
            instance.instance_id.clone(),
            instance.runtime_id,
            OperationKind::Upgrade,
            OperationParameters {
                runtime_version: Some(orchestration.parameters.runtime_version.clone()),
                profile: orchestration.parameters.profile.clone(),
                overrides: orchestration.parameters.overrides.clone(),
                ..Default::default()
            },
        );
        operation.orchestration_id = Some(orchestration.id);

        match self.operations.insert(&operation).await {
            Ok(()) => {
                let mut member = stratus_core::OrchestrationMember::queued(
                    instance.runtime_id,
                    instance.instance_id.clone(),
                    operation.id,
                );
                member.not_before = match orchestration.strategy.schedule {
                    ScheduleKind::Immediate => None,
                    ScheduleKind::MaintenanceWindow => instance
                        .maintenance_window
                        .map(|window| window.next_opening(Utc::now())),
                };
                orchestration.members.push(member);
                Ok(())
            }
            Err(StoreError::Conflict(reason)) => {
                debug!(
                    "instance {} skipped for orchestration {}: {}",
                    instance.instance_id, orchestration.id, reason
                );
                orchestration.members.push(
                    stratus_core::OrchestrationMember::skipped(
                        instance.runtime_id,
                        instance.instance_id.clone(),
                        reason,
                    ),
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Spawn the driver group for every member that still needs driving.
    /// Queued members are ordered by (earliest start, creation order), which
    /// for the serial strategy is exactly the execution order.
    fn spawn_drivers(self: &Arc<Self>, orchestration: &Orchestration) {
        let mut slots: Vec<MemberSlot> = orchestration
            .members
            .iter()
            .filter(|member| !member.status.is_terminal())
            .filter_map(|member| {
                member.operation_id.map(|operation_id| MemberSlot {
                    runtime_id: member.runtime_id,
                    operation_id,
                    not_before: member.not_before,
                })
            })
            .collect();
        if slots.is_empty() {
            return;
        }
        slots.sort_by_key(|slot| slot.not_before.unwrap_or(DateTime::<Utc>::MIN_UTC));

        let drivers = orchestration.strategy.effective_workers().min(slots.len());
        let queue = Arc::new(Mutex::new(slots.into_iter().collect::<VecDeque<_>>()));
        let orchestration_id = orchestration.id;

        let engine = self.clone();
        tokio::spawn(async move {
            let mut handles = Vec::with_capacity(drivers);
            for _ in 0..drivers {
                let engine = engine.clone();
                let queue = queue.clone();
                handles.push(tokio::spawn(async move {
                    loop {
                        let slot = { queue.lock().await.pop_front() };
                        let Some(slot) = slot else { break };
                        engine.drive_member(orchestration_id, slot).await;
                    }
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
            engine.finalize(orchestration_id).await;
        });
    }

    /// Drive one member to a terminal status: wait for its start time, hand
    /// the operation to the executor, watch it finish and record the outcome.
    async fn drive_member(self: &Arc<Self>, orchestration_id: OrchestrationId, slot: MemberSlot) {
        if let Some(not_before) = slot.not_before {
            if !self.wait_until(orchestration_id, &slot, not_before).await {
                return;
            }
        }

        // Cancellation may have finished the member while it was queued.
        match self.member_is_terminal(orchestration_id, &slot.runtime_id).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(err) => {
                warn!(
                    "orchestration {} could not check member {}: {}",
                    orchestration_id, slot.runtime_id, err
                );
                return;
            }
        }

        if let Err(err) = self
            .update_member(orchestration_id, &slot.runtime_id, MemberStatus::InProgress, None)
            .await
        {
            warn!(
                "orchestration {} could not start member {}: {}",
                orchestration_id, slot.runtime_id, err
            );
            return;
        }

        self.executor.enqueue(slot.operation_id).await;

        let operation = loop {
            match self.operations.get(&slot.operation_id).await {
                Ok(Some(operation)) if operation.is_terminal() => break operation,
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!(
                        "operation {} of orchestration {} disappeared",
                        slot.operation_id, orchestration_id
                    );
                    return;
                }
                Err(err) => {
                    warn!(
                        "watching operation {} failed, retrying: {}",
                        slot.operation_id, err
                    );
                }
            }
            tokio::time::sleep(self.config.member_poll_interval()).await;
        };

        let (status, reason) = match operation.status {
            stratus_core::OperationStatus::Succeeded => (MemberStatus::Succeeded, None),
            _ => (
                MemberStatus::Failed,
                operation.last_error.map(|error| error.message),
            ),
        };
        if let Err(err) = self
            .update_member(orchestration_id, &slot.runtime_id, status, reason)
            .await
        {
            warn!(
                "orchestration {} could not record member {}: {}",
                orchestration_id, slot.runtime_id, err
            );
        }
    }

    /// Park until `not_before`, waking periodically to notice cancellation.
    /// Returns false when the member finished while parked.
    async fn wait_until(
        &self,
        orchestration_id: OrchestrationId,
        slot: &MemberSlot,
        not_before: DateTime<Utc>,
    ) -> bool {
        loop {
            let remaining = not_before - Utc::now();
            let Ok(remaining) = remaining.to_std() else {
                return true;
            };
            if remaining.is_zero() {
                return true;
            }
            tokio::time::sleep(remaining.min(self.config.member_poll_interval())).await;
            match self.member_is_terminal(orchestration_id, &slot.runtime_id).await {
                Ok(true) => return false,
                Ok(false) => {}
                Err(err) => warn!(
                    "orchestration {} could not check parked member {}: {}",
                    orchestration_id, slot.runtime_id, err
                ),
            }
        }
    }

    async fn member_is_terminal(
        &self,
        orchestration_id: OrchestrationId,
        runtime_id: &RuntimeId,
    ) -> Result<bool, OrchestrationError> {
        let orchestration = self.get(&orchestration_id).await?;
        Ok(orchestration
            .members
            .iter()
            .find(|member| member.runtime_id == *runtime_id)
            .is_none_or(|member| member.status.is_terminal()))
    }

    /// Read-modify-write one member's status and the aggregate. Terminal
    /// member statuses are never overwritten.
    async fn update_member(
        &self,
        orchestration_id: OrchestrationId,
        runtime_id: &RuntimeId,
        status: MemberStatus,
        reason: Option<String>,
    ) -> Result<(), OrchestrationError> {
        let _guard = self.update_lock.lock().await;
        let mut orchestration = self.get(&orchestration_id).await?;
        let was_terminal = orchestration.is_terminal();
        let Some(member) = orchestration.member_mut(runtime_id) else {
            return Ok(());
        };
        if member.status.is_terminal() {
            return Ok(());
        }
        member.status = status;
        if reason.is_some() {
            member.reason = reason;
        }
        orchestration.refresh_status();
        self.orchestrations.update(&orchestration).await?;
        if !was_terminal {
            self.announce_if_terminal(&orchestration).await;
        }
        Ok(())
    }

    /// Recompute the aggregate once every driver has finished. Normally a
    /// no-op; catches members that were finished by cancellation while their
    /// driver was parked.
    async fn finalize(&self, orchestration_id: OrchestrationId) {
        let _guard = self.update_lock.lock().await;
        let Ok(mut orchestration) = self.get(&orchestration_id).await else {
            return;
        };
        let was_terminal = orchestration.is_terminal();
        orchestration.refresh_status();
        if orchestration.is_terminal() {
            if let Err(err) = self.orchestrations.update(&orchestration).await {
                warn!("orchestration {} final update failed: {}", orchestration_id, err);
                return;
            }
            if !was_terminal {
                self.announce_if_terminal(&orchestration).await;
            }
            info!(
                "orchestration {} finished: {}",
                orchestration_id, orchestration.status
            );
        }
    }

    async fn announce_if_terminal(&self, orchestration: &Orchestration) {
        if !orchestration.is_terminal() {
            return;
        }
        let event = LifecycleEvent::OrchestrationFinished {
            orchestration_id: orchestration.id,
            status: orchestration.status,
        };
        if self.events.publish(event).await.is_err() {
            warn!(
                "finished event for orchestration {} was not delivered",
                orchestration.id
            );
        }
    }

    /// Request cancellation. Members still queued have their pending
    /// operations failed right away; members in flight are stopped by the
    /// executor at the next step boundary. Applied configuration is never
    /// rolled back.
    ///
    /// # Errors
    /// Returns `OrchestrationError::Domain` when the orchestration is already
    /// terminal.
    pub async fn cancel(&self, id: &OrchestrationId) -> Result<(), OrchestrationError> {
        let _guard = self.update_lock.lock().await;
        let mut orchestration = self.get(id).await?;
        orchestration.request_cancel()?;
        info!("orchestration {} cancellation requested", id);

        for index in 0..orchestration.members.len() {
            let (member_status, operation_id) = {
                let member = &orchestration.members[index];
                (member.status, member.operation_id)
            };
            let Some(operation_id) = operation_id else {
                continue;
            };
            match member_status {
                MemberStatus::Queued => {
                    if let Some(mut operation) = self.operations.get(&operation_id).await? {
                        if !operation.is_terminal() {
                            let step = steps_for(operation.kind)
                                .get(operation.current_step as usize)
                                .map_or("canceled", |step| step.name());
                            operation.request_cancel();
                            operation
                                .fail(LastError::new(step, "operation canceled"))
                                .ok();
                            self.operations.update(&operation).await?;
                        }
                    }
                    let member = &mut orchestration.members[index];
                    member.status = MemberStatus::Failed;
                    member.reason = Some("canceled".to_string());
                }
                MemberStatus::InProgress => {
                    if let Some(mut operation) = self.operations.get(&operation_id).await? {
                        if !operation.is_terminal() {
                            operation.request_cancel();
                            self.operations.update(&operation).await?;
                        }
                    }
                }
                _ => {}
            }
        }

        orchestration.refresh_status();
        self.orchestrations.update(&orchestration).await?;
        self.announce_if_terminal(&orchestration).await;
        Ok(())
    }

    /// Re-attach drivers to every unfinished orchestration, typically at
    /// process start. The executor re-seeds the member operations itself;
    /// this only restores the watching side.
    pub async fn resume_unfinished(self: &Arc<Self>) -> Result<usize, OrchestrationError> {
        let unfinished = self.orchestrations.list_unfinished().await?;
        let count = unfinished.len();
        for orchestration in &unfinished {
            self.spawn_drivers(orchestration);
        }
        if count > 0 {
            info!("resuming {} unfinished orchestrations", count);
        }
        Ok(count)
    }

    /// # Errors
    /// Returns `OrchestrationError::NotFound` for an unknown id.
    pub async fn get(&self, id: &OrchestrationId) -> Result<Orchestration, OrchestrationError> {
        self.orchestrations
            .get(id)
            .await?
            .ok_or(OrchestrationError::NotFound(*id))
    }

    pub async fn list(&self) -> Result<Vec<Orchestration>, OrchestrationError> {
        Ok(self.orchestrations.list().await?)
    }

    /// Member operations of an orchestration, for the listing surface.
    pub async fn list_operations(
        &self,
        id: &OrchestrationId,
    ) -> Result<Vec<Operation>, OrchestrationError> {
        // Existence check first so an unknown id is a 404, not an empty list.
        let orchestration = self.get(id).await?;
        Ok(self
            .operations
            .list_by_orchestration(&orchestration.id)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorConfig, ExecutorContext};
    use pretty_assertions::assert_eq;
    use stratus_adapters::{
        InMemoryBus, InMemoryInstanceStore, InMemoryOperationStore, InMemoryOrchestrationStore,
        InMemoryRuntimeStateStore, MockProvisionerClient, MockReconcilerClient,
    };
    use stratus_core::{
        InstanceId, MaintenanceWindow, OperationStatus, OrchestrationStatus, StrategyKind,
        TargetRule,
    };
    use stratus_ports::{ReconcilerError, RuntimeStateRepository};

    struct Fixture {
        engine: Arc<OrchestrationEngine>,
        executor: Arc<StepExecutor>,
        operations: Arc<InMemoryOperationStore>,
        orchestrations: Arc<InMemoryOrchestrationStore>,
        instances: Arc<InMemoryInstanceStore>,
        runtime_states: Arc<InMemoryRuntimeStateStore>,
        reconciler: MockReconcilerClient,
    }

    fn fixture() -> Fixture {
        let operations = Arc::new(InMemoryOperationStore::new());
        let orchestrations = Arc::new(InMemoryOrchestrationStore::new());
        let instances = Arc::new(InMemoryInstanceStore::new());
        let runtime_states = Arc::new(InMemoryRuntimeStateStore::new());
        let provisioner = MockProvisionerClient::new();
        let reconciler = MockReconcilerClient::new();
        let bus = Arc::new(InMemoryBus::default());

        let executor = Arc::new(StepExecutor::new(ExecutorContext {
            operations: operations.clone(),
            instances: instances.clone(),
            runtime_states: runtime_states.clone(),
            provisioner: Arc::new(provisioner),
            reconciler: Arc::new(reconciler.clone()),
            events: bus.clone(),
            config: ExecutorConfig {
                workers: 4,
                backoff_base_ms: 1,
                backoff_cap_ms: 4,
                poll_interval_ms: 10,
                ..Default::default()
            },
        }));
        executor.start();

        let engine = Arc::new(OrchestrationEngine::new(
            orchestrations.clone(),
            operations.clone(),
            instances.clone(),
            executor.clone(),
            bus,
            OrchestrationConfig {
                member_poll_interval_ms: 10,
            },
        ));
        Fixture {
            engine,
            executor,
            operations,
            orchestrations,
            instances,
            runtime_states,
            reconciler,
        }
    }

    async fn seed_instance(fixture: &Fixture, id: &str, subaccount: &str) -> Instance {
        let mut instance = Instance::new(
            InstanceId::new(id),
            RuntimeId::new(),
            format!("cluster-{id}"),
            "ga-1",
            subaccount,
            "azure",
            "westeurope",
        );
        instance.mark_provisioned("2.0.0");
        fixture.instances.insert(&instance).await.unwrap();
        instance
    }

    fn subaccount_spec(subaccount: &str) -> TargetSpec {
        TargetSpec {
            include: vec![TargetRule {
                subaccount: Some(subaccount.into()),
                ..Default::default()
            }],
            exclude: vec![],
        }
    }

    fn strategy(kind: StrategyKind, workers: usize) -> StrategySpec {
        StrategySpec {
            kind,
            schedule: ScheduleKind::Immediate,
            workers,
        }
    }

    fn upgrade_to(version: &str) -> UpgradeParameters {
        UpgradeParameters {
            runtime_version: version.into(),
            ..Default::default()
        }
    }

    async fn await_terminal(fixture: &Fixture, id: OrchestrationId) -> Orchestration {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let orchestration = fixture.orchestrations.get(&id).await.unwrap().unwrap();
                if orchestration.is_terminal() {
                    return orchestration;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("orchestration should reach a terminal status")
    }

    #[tokio::test]
    async fn test_parallel_upgrade_drives_all_members_to_success() {
        let fixture = fixture();
        for id in ["inst-1", "inst-2", "inst-3"] {
            seed_instance(&fixture, id, "sa-1").await;
        }
        seed_instance(&fixture, "inst-other", "sa-2").await;

        let id = fixture
            .engine
            .schedule(
                strategy(StrategyKind::Parallel, 2),
                subaccount_spec("sa-1"),
                upgrade_to("2.1.0"),
                false,
            )
            .await
            .unwrap();

        let finished = await_terminal(&fixture, id).await;
        fixture.executor.shutdown();

        assert_eq!(finished.status, OrchestrationStatus::Succeeded);
        assert_eq!(finished.members.len(), 3);
        assert!(finished
            .members
            .iter()
            .all(|m| m.status == MemberStatus::Succeeded));

        let operations = fixture.operations.list_by_orchestration(&id).await.unwrap();
        assert_eq!(operations.len(), 3);
        for operation in &operations {
            assert_eq!(operation.status, OperationStatus::Succeeded);
            assert_eq!(operation.kind, OperationKind::Upgrade);
            let state = fixture
                .runtime_states
                .get_latest_by_runtime(&operation.runtime_id)
                .await
                .unwrap()
                .expect("upgrade records a runtime state");
            assert_eq!(state.configuration.runtime_version, "2.1.0");
        }
    }

    #[tokio::test]
    async fn test_serial_upgrade_submits_in_creation_order() {
        let fixture = fixture();
        // Seeded out of order on purpose; resolution orders by instance id.
        for id in ["inst-b", "inst-a", "inst-c"] {
            seed_instance(&fixture, id, "sa-1").await;
        }

        let id = fixture
            .engine
            .schedule(
                strategy(StrategyKind::Serial, 0),
                subaccount_spec("sa-1"),
                upgrade_to("2.1.0"),
                false,
            )
            .await
            .unwrap();

        let finished = await_terminal(&fixture, id).await;
        fixture.executor.shutdown();
        assert_eq!(finished.status, OrchestrationStatus::Succeeded);

        let members: Vec<&str> = finished
            .members
            .iter()
            .map(|m| m.instance_id.as_str())
            .collect();
        assert_eq!(members, vec!["inst-a", "inst-b", "inst-c"]);

        // Serial driving means the reconciler saw the submissions in member
        // order.
        let submitted: Vec<_> = fixture
            .reconciler
            .submissions()
            .await
            .iter()
            .map(|c| c.runtime_id)
            .collect();
        let expected: Vec<_> = finished.members.iter().map(|m| m.runtime_id).collect();
        assert_eq!(submitted, expected);
    }

    #[tokio::test]
    async fn test_dry_run_creates_no_operations() {
        let fixture = fixture();
        seed_instance(&fixture, "inst-1", "sa-1").await;
        seed_instance(&fixture, "inst-2", "sa-1").await;

        let id = fixture
            .engine
            .schedule(
                strategy(StrategyKind::Parallel, 2),
                subaccount_spec("sa-1"),
                upgrade_to("2.1.0"),
                true,
            )
            .await
            .unwrap();

        let orchestration = fixture.orchestrations.get(&id).await.unwrap().unwrap();
        assert_eq!(orchestration.status, OrchestrationStatus::Succeeded);
        assert_eq!(orchestration.members.len(), 2);
        assert!(orchestration
            .members
            .iter()
            .all(|m| m.status == MemberStatus::Skipped && m.operation_id.is_none()));
        assert!(fixture
            .operations
            .list_by_orchestration(&id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_empty_target_set_succeeds_immediately() {
        let fixture = fixture();
        seed_instance(&fixture, "inst-1", "sa-other").await;

        let id = fixture
            .engine
            .schedule(
                strategy(StrategyKind::Parallel, 2),
                subaccount_spec("sa-1"),
                upgrade_to("2.1.0"),
                false,
            )
            .await
            .unwrap();

        let orchestration = fixture.orchestrations.get(&id).await.unwrap().unwrap();
        assert_eq!(orchestration.status, OrchestrationStatus::Succeeded);
        assert!(orchestration.members.is_empty());
    }

    #[tokio::test]
    async fn test_instance_with_inflight_operation_is_skipped() {
        let fixture = fixture();
        let busy = seed_instance(&fixture, "inst-busy", "sa-1").await;
        seed_instance(&fixture, "inst-free", "sa-1").await;

        // A lifecycle action already holds the instance.
        let blocker = Operation::new(
            OperationId::new(),
            busy.instance_id.clone(),
            busy.runtime_id,
            OperationKind::Update,
            OperationParameters::default(),
        );
        fixture.operations.insert(&blocker).await.unwrap();

        let id = fixture
            .engine
            .schedule(
                strategy(StrategyKind::Parallel, 2),
                subaccount_spec("sa-1"),
                upgrade_to("2.1.0"),
                false,
            )
            .await
            .unwrap();

        let finished = await_terminal(&fixture, id).await;
        fixture.executor.shutdown();

        assert_eq!(finished.status, OrchestrationStatus::Succeeded);
        let skipped = finished
            .members
            .iter()
            .find(|m| m.instance_id == busy.instance_id)
            .unwrap();
        assert_eq!(skipped.status, MemberStatus::Skipped);
        assert!(skipped.operation_id.is_none());
        assert_eq!(
            fixture.operations.list_by_orchestration(&id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_member_failure_yields_failed_aggregate() {
        let fixture = fixture();
        seed_instance(&fixture, "inst-1", "sa-1").await;
        seed_instance(&fixture, "inst-2", "sa-1").await;

        // First submission is rejected outright; the other converges.
        fixture
            .reconciler
            .fail_next_submissions(vec![ReconcilerError::Rejected(
                "unknown component".into(),
            )])
            .await;

        let id = fixture
            .engine
            .schedule(
                strategy(StrategyKind::Serial, 0),
                subaccount_spec("sa-1"),
                upgrade_to("2.1.0"),
                false,
            )
            .await
            .unwrap();

        let finished = await_terminal(&fixture, id).await;
        fixture.executor.shutdown();

        assert_eq!(finished.status, OrchestrationStatus::Failed);
        let statuses: Vec<MemberStatus> = finished.members.iter().map(|m| m.status).collect();
        assert_eq!(statuses, vec![MemberStatus::Failed, MemberStatus::Succeeded]);
        let failed = &finished.members[0];
        assert!(failed
            .reason
            .as_deref()
            .is_some_and(|r| r.contains("unknown component")));
    }

    #[tokio::test]
    async fn test_cancel_fails_queued_members_without_waiting() {
        let fixture = fixture();
        // A window far from now parks the member for hours.
        let mut instance = seed_instance(&fixture, "inst-1", "sa-1").await;
        let begin = (Utc::now() + chrono::Duration::hours(10)).time();
        let end = (Utc::now() + chrono::Duration::hours(12)).time();
        instance.maintenance_window = Some(MaintenanceWindow::new(begin, end).unwrap());
        fixture.instances.update(&instance).await.unwrap();

        let id = fixture
            .engine
            .schedule(
                StrategySpec {
                    kind: StrategyKind::Parallel,
                    schedule: ScheduleKind::MaintenanceWindow,
                    workers: 2,
                },
                subaccount_spec("sa-1"),
                upgrade_to("2.1.0"),
                false,
            )
            .await
            .unwrap();

        let parked = fixture.orchestrations.get(&id).await.unwrap().unwrap();
        assert!(parked.members[0].not_before.is_some());

        fixture.engine.cancel(&id).await.unwrap();
        let finished = await_terminal(&fixture, id).await;
        fixture.executor.shutdown();

        assert_eq!(finished.status, OrchestrationStatus::Canceled);
        assert_eq!(finished.members[0].status, MemberStatus::Failed);
        assert_eq!(finished.members[0].reason.as_deref(), Some("canceled"));

        let operation = fixture
            .operations
            .get(&finished.members[0].operation_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(operation.status, OperationStatus::Failed);
        assert!(operation
            .last_error
            .as_ref()
            .is_some_and(|e| e.message.contains("canceled")));
    }

    #[tokio::test]
    async fn test_cancel_terminal_orchestration_is_rejected() {
        let fixture = fixture();
        let id = fixture
            .engine
            .schedule(
                strategy(StrategyKind::Parallel, 2),
                subaccount_spec("sa-1"),
                upgrade_to("2.1.0"),
                false,
            )
            .await
            .unwrap();
        // No members: terminal right away.
        assert!(fixture.engine.cancel(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_strategy_is_rejected_before_resolution() {
        let fixture = fixture();
        let result = fixture
            .engine
            .schedule(
                strategy(StrategyKind::Parallel, 0),
                subaccount_spec("sa-1"),
                upgrade_to("2.1.0"),
                false,
            )
            .await;
        assert!(matches!(result, Err(OrchestrationError::Domain(_))));
        assert!(fixture.orchestrations.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_operations_rejects_unknown_orchestration() {
        let fixture = fixture();
        let result = fixture.engine.list_operations(&OrchestrationId::new()).await;
        assert!(matches!(result, Err(OrchestrationError::NotFound(_))));
    }
}
