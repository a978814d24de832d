//! Step pipeline executor
//!
//! Drives every lifecycle operation through its kind-specific step sequence.
//! One claimed invocation runs steps back to back until a step asks to be
//! re-invoked later, fails, or the sequence ends; the operation is persisted
//! after every step invocation, so a crashed or restarted process resumes
//! exactly at the recorded step.
//!
//! Exclusivity is a store-side claim with a staleness TTL. A parked or
//! finished operation releases its claim; a claim whose TTL elapsed may be
//! taken over by any worker, which is how operations owned by a dead process
//! get adopted. A janitor task additionally sweeps the store for unfinished
//! operations nobody has touched recently and re-enqueues them, covering
//! queue entries lost to process crashes.

mod queue;
mod step;

pub use queue::DelayQueue;
pub use step::{steps_for, StepError, StepErrorKind, StepKind, StepOutcome};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use stratus_core::{LastError, Operation, OperationId, OperationStatus};
use stratus_ports::{
    EventPublisher, InstanceRepository, LifecycleEvent, OperationRepository, ProvisionerClient,
    ReconcilerClient, RuntimeStateRepository, StoreError,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Tuning knobs for the executor. Durations are milliseconds.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Concurrent worker tasks draining the operation queue.
    pub workers: usize,
    /// Transient failures tolerated per step before the operation fails.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Delay between poll invocations of a waiting step.
    pub poll_interval_ms: u64,
    /// Wall-clock budget for one step across all of its invocations.
    pub max_step_wait_ms: u64,
    /// Age after which another worker may take over a claim.
    pub claim_ttl_ms: u64,
    /// Period of the janitor sweep for stalled operations.
    pub recovery_interval_ms: u64,
    /// Inactivity after which an unfinished operation counts as stalled.
    pub recovery_after_ms: u64,
    /// Version applied when a provisioning request names none.
    pub default_runtime_version: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            poll_interval_ms: 5_000,
            max_step_wait_ms: 1_800_000,
            claim_ttl_ms: 300_000,
            recovery_interval_ms: 60_000,
            recovery_after_ms: 180_000,
            default_runtime_version: "2.0.0".to_string(),
        }
    }
}

impl ExecutorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_step_wait(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.max_step_wait_ms as i64)
    }

    pub fn claim_ttl(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.claim_ttl_ms as i64)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }

    pub fn recovery_after(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.recovery_after_ms as i64)
    }
}

/// Everything a step invocation may touch, assembled once at startup.
#[derive(Clone)]
pub struct ExecutorContext {
    pub operations: Arc<dyn OperationRepository>,
    pub instances: Arc<dyn InstanceRepository>,
    pub runtime_states: Arc<dyn RuntimeStateRepository>,
    pub provisioner: Arc<dyn ProvisionerClient>,
    pub reconciler: Arc<dyn ReconcilerClient>,
    pub events: Arc<dyn EventPublisher>,
    pub config: ExecutorConfig,
}

/// The executor itself: a delay queue of operation ids plus the worker tasks
/// draining it.
pub struct StepExecutor {
    ctx: ExecutorContext,
    queue: Arc<DelayQueue<OperationId>>,
    owner_prefix: String,
    shutdown_tx: watch::Sender<bool>,
}

impl StepExecutor {
    pub fn new(ctx: ExecutorContext) -> Self {
        let process = Uuid::new_v4().simple().to_string();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ctx,
            queue: Arc::new(DelayQueue::new()),
            owner_prefix: format!("stratus-{}", &process[..8]),
            shutdown_tx,
        }
    }

    pub fn context(&self) -> &ExecutorContext {
        &self.ctx
    }

    /// Make the operation eligible for execution now.
    pub async fn enqueue(&self, id: OperationId) {
        self.queue.push(id).await;
    }

    /// Make the operation eligible for execution at `not_before`.
    pub async fn enqueue_at(&self, id: OperationId, not_before: DateTime<Utc>) {
        self.queue.push_at(id, not_before).await;
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.len().await
    }

    /// Spawn the worker pool and the janitor.
    pub fn start(&self) {
        for index in 0..self.ctx.config.workers.max(1) {
            let ctx = self.ctx.clone();
            let queue = self.queue.clone();
            let owner = format!("{}-w{}", self.owner_prefix, index);
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                debug!("executor worker {} started", owner);
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        id = queue.pop() => {
                            Self::drive(&ctx, &queue, &owner, id).await;
                        }
                    }
                }
                debug!("executor worker {} stopped", owner);
            });
        }

        let ctx = self.ctx.clone();
        let queue = self.queue.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(ctx.config.recovery_interval()) => {
                        Self::recover_stalled(&ctx, &queue).await;
                    }
                }
            }
        });
    }

    /// Stop the worker pool. Invocations already running finish their current
    /// step persistence before the task exits.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Re-enqueue every unfinished operation, typically at process start.
    pub async fn resume_unfinished(&self) -> Result<usize, StoreError> {
        let operations = self.ctx.operations.list_unfinished().await?;
        let count = operations.len();
        for operation in operations {
            self.queue.push(operation.id).await;
        }
        if count > 0 {
            info!("resuming {} unfinished operations", count);
        }
        Ok(count)
    }

    /// One claimed invocation: run steps until the operation parks, fails, or
    /// finishes.
    async fn drive(
        ctx: &ExecutorContext,
        queue: &DelayQueue<OperationId>,
        owner: &str,
        id: OperationId,
    ) {
        let mut operation = match ctx.operations.claim(&id, owner, ctx.config.claim_ttl()).await {
            Ok(Some(operation)) => operation,
            Ok(None) => {
                debug!("operation {} is claimed elsewhere, dropping queue entry", id);
                return;
            }
            Err(StoreError::OperationNotFound(_)) => {
                warn!("operation {} no longer exists", id);
                return;
            }
            Err(err) => {
                warn!("claiming operation {} failed, retrying later: {}", id, err);
                queue.push_at(id, due_at(ctx.config.poll_interval())).await;
                return;
            }
        };

        if operation.is_terminal() {
            let _ = ctx.operations.release(&id, owner).await;
            return;
        }

        if operation.is_pending() {
            if let Err(err) = operation.start() {
                error!("operation {} refused to start: {}", id, err);
                let _ = ctx.operations.release(&id, owner).await;
                return;
            }
            info!(
                "operation {} ({} {}) started",
                id,
                operation.kind.as_str(),
                operation.instance_id
            );
            let started = LifecycleEvent::OperationStarted {
                operation_id: operation.id,
                instance_id: operation.instance_id.clone(),
                kind: operation.kind,
            };
            if ctx.events.publish(started).await.is_err() {
                warn!("started event for operation {} was not delivered", id);
            }
        }

        loop {
            let Some(step) = steps_for(operation.kind)
                .get(operation.current_step as usize)
                .copied()
            else {
                if let Err(err) = operation.succeed() {
                    error!("operation {} could not finish: {}", id, err);
                }
                break;
            };

            // Cancellation is observed here and only here, between steps.
            if operation.cancel_requested {
                info!("operation {} canceled before step {}", id, step.name());
                record_failure(
                    &mut operation,
                    LastError::new(step.name(), "operation canceled"),
                );
                break;
            }

            operation.mark_step_started();
            if let Some(started_at) = operation.step_started_at {
                if Utc::now() - started_at > ctx.config.max_step_wait() {
                    record_failure(
                        &mut operation,
                        LastError::new(
                            step.name(),
                            format!(
                                "step did not finish within the {}ms wait budget",
                                ctx.config.max_step_wait_ms
                            ),
                        ),
                    );
                    break;
                }
            }

            match step.run(ctx, &mut operation).await {
                StepOutcome::Done => {
                    operation.advance_step();
                    if let Err(err) = ctx.operations.update(&operation).await {
                        warn!(
                            "failed to persist operation {} after step {}: {}",
                            id,
                            step.name(),
                            err
                        );
                        let _ = ctx.operations.release(&id, owner).await;
                        return;
                    }
                    debug!("step {} of operation {} done", step.name(), id);
                }
                StepOutcome::Repeat(delay) => {
                    Self::suspend(ctx, queue, owner, &operation, delay, step.name()).await;
                    return;
                }
                StepOutcome::Failed(error) if error.is_transient() => {
                    operation
                        .record_transient_failure(LastError::new(step.name(), error.message.clone()));
                    if operation.attempts >= ctx.config.max_attempts {
                        let message =
                            format!("{} (after {} attempts)", error.message, operation.attempts);
                        record_failure(&mut operation, LastError::new(step.name(), message));
                        break;
                    }
                    let delay = backoff_delay(&ctx.config, operation.attempts);
                    warn!(
                        "step {} of operation {} failed transiently (attempt {}/{}): {}",
                        step.name(),
                        id,
                        operation.attempts,
                        ctx.config.max_attempts,
                        error.message
                    );
                    Self::suspend(ctx, queue, owner, &operation, delay, "retry backoff").await;
                    return;
                }
                StepOutcome::Failed(error) => {
                    warn!(
                        "step {} of operation {} failed: {}",
                        step.name(),
                        id,
                        error.message
                    );
                    record_failure(&mut operation, LastError::new(step.name(), error.message));
                    break;
                }
            }
        }

        Self::finish(ctx, owner, &operation).await;
    }

    /// Persist and park a non-terminal operation for a later invocation. The
    /// claim is released before the queue entry exists, so whichever worker
    /// pops it can claim immediately.
    async fn suspend(
        ctx: &ExecutorContext,
        queue: &DelayQueue<OperationId>,
        owner: &str,
        operation: &Operation,
        delay: Duration,
        why: &str,
    ) {
        if let Err(err) = ctx.operations.update(operation).await {
            warn!(
                "failed to persist operation {} before parking: {}",
                operation.id, err
            );
            let _ = ctx.operations.release(&operation.id, owner).await;
            return;
        }
        let _ = ctx.operations.release(&operation.id, owner).await;
        queue.push_at(operation.id, due_at(delay)).await;
        debug!("operation {} parked for {:?} ({})", operation.id, delay, why);
    }

    /// Persist a terminal operation, announce it, release the claim.
    async fn finish(ctx: &ExecutorContext, owner: &str, operation: &Operation) {
        if let Err(err) = ctx.operations.update(operation).await {
            warn!(
                "failed to persist finished operation {}: {}",
                operation.id, err
            );
            let _ = ctx.operations.release(&operation.id, owner).await;
            return;
        }
        let finished = LifecycleEvent::OperationFinished {
            operation_id: operation.id,
            instance_id: operation.instance_id.clone(),
            orchestration_id: operation.orchestration_id,
            kind: operation.kind,
            status: operation.status,
        };
        if ctx.events.publish(finished).await.is_err() {
            warn!("finished event for operation {} was not delivered", operation.id);
        }
        let _ = ctx.operations.release(&operation.id, owner).await;
        match operation.status {
            OperationStatus::Succeeded => info!("operation {} succeeded", operation.id),
            _ => {
                let reason = operation
                    .last_error
                    .as_ref()
                    .map(|e| e.message.as_str())
                    .unwrap_or("unknown");
                info!("operation {} failed: {}", operation.id, reason);
            }
        }
    }

    /// Re-enqueue unfinished operations nobody has updated recently. Claim
    /// deduplication makes a duplicate queue entry harmless.
    async fn recover_stalled(ctx: &ExecutorContext, queue: &DelayQueue<OperationId>) {
        let cutoff = Utc::now() - ctx.config.recovery_after();
        match ctx.operations.list_unfinished().await {
            Ok(operations) => {
                for operation in operations {
                    if operation.updated_at < cutoff {
                        warn!(
                            "re-enqueueing stalled operation {} (last update {})",
                            operation.id, operation.updated_at
                        );
                        queue.push(operation.id).await;
                    }
                }
            }
            Err(err) => warn!("stalled-operation sweep failed: {}", err),
        }
    }
}

fn record_failure(operation: &mut Operation, error: LastError) {
    if let Err(err) = operation.fail(error) {
        error!(
            "operation {} could not transition to failed: {}",
            operation.id, err
        );
    }
}

/// Exponential backoff with a cap and up to 25% jitter.
fn backoff_delay(config: &ExecutorConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let capped = config
        .backoff_base_ms
        .saturating_mul(1u64 << exp)
        .min(config.backoff_cap_ms);
    let jitter = rand::thread_rng().gen_range(0..=capped / 4);
    Duration::from_millis(capped + jitter)
}

fn due_at(delay: Duration) -> DateTime<Utc> {
    let millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    Utc::now() + ChronoDuration::milliseconds(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use stratus_adapters::{
        InMemoryBus, InMemoryInstanceStore, InMemoryOperationStore, InMemoryRuntimeStateStore,
        MockProvisionerClient, MockReconcilerClient,
    };
    use stratus_core::{
        Instance, InstanceId, OperationKind, OperationParameters, RuntimeId,
    };
    use stratus_ports::{EventSubscriber, InfrastructureStatus, ProvisionerError};

    struct Fixture {
        executor: StepExecutor,
        provisioner: MockProvisionerClient,
        reconciler: MockReconcilerClient,
        operations: Arc<InMemoryOperationStore>,
        instances: Arc<InMemoryInstanceStore>,
        runtime_states: Arc<InMemoryRuntimeStateStore>,
        bus: Arc<InMemoryBus>,
    }

    fn fixture(config: ExecutorConfig) -> Fixture {
        let provisioner = MockProvisionerClient::new();
        let reconciler = MockReconcilerClient::new();
        let operations = Arc::new(InMemoryOperationStore::new());
        let instances = Arc::new(InMemoryInstanceStore::new());
        let runtime_states = Arc::new(InMemoryRuntimeStateStore::new());
        let bus = Arc::new(InMemoryBus::default());
        let ctx = ExecutorContext {
            operations: operations.clone(),
            instances: instances.clone(),
            runtime_states: runtime_states.clone(),
            provisioner: Arc::new(provisioner.clone()),
            reconciler: Arc::new(reconciler.clone()),
            events: bus.clone(),
            config,
        };
        Fixture {
            executor: StepExecutor::new(ctx),
            provisioner,
            reconciler,
            operations,
            instances,
            runtime_states,
            bus,
        }
    }

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            workers: 2,
            max_attempts: 5,
            backoff_base_ms: 1,
            backoff_cap_ms: 4,
            poll_interval_ms: 10,
            max_step_wait_ms: 5_000,
            claim_ttl_ms: 1_000,
            recovery_interval_ms: 60_000,
            recovery_after_ms: 180_000,
            default_runtime_version: "2.0.0".into(),
        }
    }

    async fn seed_instance(fixture: &Fixture, operation: &Operation) {
        let instance = Instance::new(
            operation.instance_id.clone(),
            operation.runtime_id,
            "cluster-a",
            "ga-1",
            "sa-1",
            "azure",
            "westeurope",
        );
        fixture.instances.insert(&instance).await.unwrap();
    }

    fn operation(kind: OperationKind) -> Operation {
        Operation::new(
            OperationId::new(),
            InstanceId::new("inst-1"),
            RuntimeId::new(),
            kind,
            OperationParameters::default(),
        )
    }

    async fn await_terminal(fixture: &Fixture, id: OperationId) -> Operation {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let operation = fixture.operations.get(&id).await.unwrap().unwrap();
                if operation.is_terminal() {
                    return operation;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("operation should reach a terminal status")
    }

    // ===== Single invocation tests =====

    #[tokio::test]
    async fn test_one_invocation_runs_until_a_step_parks() {
        let fixture = fixture(fast_config());
        let op = operation(OperationKind::Provision);
        seed_instance(&fixture, &op).await;
        fixture.operations.insert(&op).await.unwrap();

        let ctx = fixture.executor.context().clone();
        let queue = fixture.executor.queue.clone();
        StepExecutor::drive(&ctx, &queue, "stratus-test-w0", op.id).await;

        // Three steps completed in one invocation, then the configuration
        // submission parked the operation for its first poll.
        let parked = fixture.operations.get(&op.id).await.unwrap().unwrap();
        assert!(parked.is_in_progress());
        assert_eq!(parked.current_step, 3);
        assert!(parked.reconciliation_id.is_some());
        assert!(parked.claimed_by.is_none());
        assert_eq!(queue.len().await, 1);

        StepExecutor::drive(&ctx, &queue, "stratus-test-w0", op.id).await;
        let finished = fixture.operations.get(&op.id).await.unwrap().unwrap();
        assert_eq!(finished.status, OperationStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_queue_entry_for_terminal_operation_is_dropped() {
        let fixture = fixture(fast_config());
        let mut op = operation(OperationKind::Provision);
        seed_instance(&fixture, &op).await;
        op.start().unwrap();
        op.succeed().unwrap();
        fixture.operations.insert(&op).await.unwrap();

        let ctx = fixture.executor.context().clone();
        let queue = fixture.executor.queue.clone();
        StepExecutor::drive(&ctx, &queue, "stratus-test-w0", op.id).await;

        assert_eq!(fixture.provisioner.jobs_created().await, 0);
        let untouched = fixture.operations.get(&op.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, OperationStatus::Succeeded);
    }

    // ===== End-to-end worker pool tests =====

    #[tokio::test]
    async fn test_provision_operation_runs_to_completion() {
        let fixture = fixture(fast_config());
        let op = operation(OperationKind::Provision);
        seed_instance(&fixture, &op).await;
        fixture.operations.insert(&op).await.unwrap();

        fixture.executor.start();
        fixture.executor.enqueue(op.id).await;

        let finished = await_terminal(&fixture, op.id).await;
        fixture.executor.shutdown();

        assert_eq!(finished.status, OperationStatus::Succeeded);
        assert_eq!(finished.runtime_version.as_deref(), Some("2.0.0"));
        assert_eq!(fixture.provisioner.jobs_created().await, 1);
        assert_eq!(fixture.reconciler.submission_count().await, 1);

        let instance = fixture
            .instances
            .get(&op.instance_id)
            .await
            .unwrap()
            .unwrap();
        assert!(instance.is_active());

        let state = fixture
            .runtime_states
            .get_latest_by_runtime(&op.runtime_id)
            .await
            .unwrap()
            .expect("converged state recorded");
        assert_eq!(state.operation_id, op.id);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_within_budget() {
        let fixture = fixture(fast_config());
        fixture
            .provisioner
            .fail_next_requests(vec![
                ProvisionerError::Timeout("10s elapsed".into()),
                ProvisionerError::Timeout("10s elapsed".into()),
                ProvisionerError::Timeout("10s elapsed".into()),
            ])
            .await;
        let op = operation(OperationKind::Provision);
        seed_instance(&fixture, &op).await;
        fixture.operations.insert(&op).await.unwrap();

        fixture.executor.start();
        fixture.executor.enqueue(op.id).await;
        let finished = await_terminal(&fixture, op.id).await;
        fixture.executor.shutdown();

        assert_eq!(finished.status, OperationStatus::Succeeded);
        assert_eq!(fixture.provisioner.jobs_created().await, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retry_budget_fails_the_operation() {
        let mut config = fast_config();
        config.max_attempts = 2;
        let fixture = fixture(config);
        fixture
            .provisioner
            .fail_next_requests(vec![
                ProvisionerError::Timeout("10s elapsed".into()),
                ProvisionerError::Timeout("10s elapsed".into()),
                ProvisionerError::Timeout("10s elapsed".into()),
            ])
            .await;
        let op = operation(OperationKind::Provision);
        seed_instance(&fixture, &op).await;
        fixture.operations.insert(&op).await.unwrap();

        fixture.executor.start();
        fixture.executor.enqueue(op.id).await;
        let finished = await_terminal(&fixture, op.id).await;
        fixture.executor.shutdown();

        assert_eq!(finished.status, OperationStatus::Failed);
        let error = finished.last_error.expect("failure recorded");
        assert_eq!(error.step, "request_infrastructure");
        assert!(error.message.contains("after 2 attempts"));
        assert_eq!(fixture.provisioner.jobs_created().await, 0);
    }

    #[tokio::test]
    async fn test_fatal_step_failure_ends_the_operation() {
        let fixture = fixture(fast_config());
        fixture
            .provisioner
            .script_job_statuses(vec![InfrastructureStatus::Failed {
                reason: "quota exceeded".into(),
            }])
            .await;
        let op = operation(OperationKind::Provision);
        seed_instance(&fixture, &op).await;
        fixture.operations.insert(&op).await.unwrap();

        fixture.executor.start();
        fixture.executor.enqueue(op.id).await;
        let finished = await_terminal(&fixture, op.id).await;
        fixture.executor.shutdown();

        assert_eq!(finished.status, OperationStatus::Failed);
        let error = finished.last_error.expect("failure recorded");
        assert_eq!(error.step, "wait_for_infrastructure");
        assert!(error.message.contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_cancellation_is_observed_at_the_next_step_boundary() {
        let mut config = fast_config();
        config.poll_interval_ms = 150;
        let fixture = fixture(config);
        fixture
            .provisioner
            .script_job_statuses(vec![InfrastructureStatus::Pending])
            .await;
        let op = operation(OperationKind::Provision);
        seed_instance(&fixture, &op).await;
        fixture.operations.insert(&op).await.unwrap();

        fixture.executor.start();
        fixture.executor.enqueue(op.id).await;

        // Wait for the operation to park inside the infrastructure poll.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = fixture.operations.get(&op.id).await.unwrap().unwrap();
                if current.current_step == 2 && current.claimed_by.is_none() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("operation should reach the polling step");

        let mut current = fixture.operations.get(&op.id).await.unwrap().unwrap();
        current.request_cancel();
        fixture.operations.update(&current).await.unwrap();

        let finished = await_terminal(&fixture, op.id).await;
        fixture.executor.shutdown();

        assert_eq!(finished.status, OperationStatus::Failed);
        let error = finished.last_error.expect("cancellation recorded");
        assert_eq!(error.step, "wait_for_infrastructure");
        assert_eq!(error.message, "operation canceled");
    }

    #[tokio::test]
    async fn test_step_wait_budget_bounds_polling() {
        let mut config = fast_config();
        config.max_step_wait_ms = 60;
        let fixture = fixture(config);
        fixture
            .provisioner
            .script_job_statuses(vec![InfrastructureStatus::Pending])
            .await;
        let op = operation(OperationKind::Provision);
        seed_instance(&fixture, &op).await;
        fixture.operations.insert(&op).await.unwrap();

        fixture.executor.start();
        fixture.executor.enqueue(op.id).await;
        let finished = await_terminal(&fixture, op.id).await;
        fixture.executor.shutdown();

        assert_eq!(finished.status, OperationStatus::Failed);
        let error = finished.last_error.expect("budget failure recorded");
        assert_eq!(error.step, "wait_for_infrastructure");
        assert!(error.message.contains("wait budget"));
    }

    #[tokio::test]
    async fn test_resume_drives_an_operation_from_its_recorded_step() {
        let fixture = fixture(fast_config());
        let mut op = operation(OperationKind::Provision);
        seed_instance(&fixture, &op).await;
        // Mid-sequence snapshot as a crashed process would leave it.
        op.start().unwrap();
        op.current_step = 3;
        op.runtime_version = Some("2.0.0".into());
        fixture.operations.insert(&op).await.unwrap();

        let resumed = fixture.executor.resume_unfinished().await.unwrap();
        assert_eq!(resumed, 1);

        fixture.executor.start();
        let finished = await_terminal(&fixture, op.id).await;
        fixture.executor.shutdown();

        assert_eq!(finished.status, OperationStatus::Succeeded);
        // The infrastructure steps were already behind it.
        assert_eq!(fixture.provisioner.jobs_created().await, 0);
        assert_eq!(fixture.reconciler.submission_count().await, 1);
    }

    #[tokio::test]
    async fn test_stale_claim_is_taken_over() {
        let mut config = fast_config();
        config.claim_ttl_ms = 50;
        let fixture = fixture(config);
        let op = operation(OperationKind::Provision);
        seed_instance(&fixture, &op).await;
        fixture.operations.insert(&op).await.unwrap();

        // A dead process still holds the claim.
        fixture
            .operations
            .claim(&op.id, "stratus-dead-w0", ChronoDuration::milliseconds(50))
            .await
            .unwrap()
            .expect("initial claim");

        tokio::time::sleep(Duration::from_millis(80)).await;
        fixture.executor.start();
        fixture.executor.enqueue(op.id).await;
        let finished = await_terminal(&fixture, op.id).await;
        fixture.executor.shutdown();

        assert_eq!(finished.status, OperationStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_operation_events_are_published() {
        let fixture = fixture(fast_config());
        let op = operation(OperationKind::Provision);
        seed_instance(&fixture, &op).await;
        fixture.operations.insert(&op).await.unwrap();

        let mut receiver = fixture.bus.subscribe().await.unwrap();
        fixture.executor.start();
        fixture.executor.enqueue(op.id).await;
        await_terminal(&fixture, op.id).await;
        fixture.executor.shutdown();

        let first = receiver.recv().await.unwrap();
        assert!(matches!(
            first,
            LifecycleEvent::OperationStarted { operation_id, .. } if operation_id == op.id
        ));
        let second = receiver.recv().await.unwrap();
        assert!(matches!(
            second,
            LifecycleEvent::OperationFinished { operation_id, status: OperationStatus::Succeeded, .. }
                if operation_id == op.id
        ));
    }

    // ===== Janitor tests =====

    #[tokio::test]
    async fn test_janitor_re_enqueues_stalled_operations() {
        let mut config = fast_config();
        config.recovery_after_ms = 50;
        let fixture = fixture(config);
        let mut op = operation(OperationKind::Provision);
        seed_instance(&fixture, &op).await;
        op.start().unwrap();
        op.updated_at = Utc::now() - ChronoDuration::milliseconds(200);
        fixture.operations.insert(&op).await.unwrap();

        let ctx = fixture.executor.context().clone();
        let queue = fixture.executor.queue.clone();
        StepExecutor::recover_stalled(&ctx, &queue).await;
        assert_eq!(queue.len().await, 1);

        // A freshly touched operation is left alone.
        let mut fresh = operation(OperationKind::Provision);
        fresh.start().unwrap();
        fixture.operations.insert(&fresh).await.unwrap();
        StepExecutor::recover_stalled(&ctx, &queue).await;
        assert_eq!(queue.len().await, 2);
    }

    // ===== Backoff tests =====

    #[test]
    fn test_backoff_grows_exponentially_up_to_the_cap() {
        let config = ExecutorConfig {
            backoff_base_ms: 100,
            backoff_cap_ms: 1_000,
            ..Default::default()
        };
        let first = backoff_delay(&config, 1).as_millis() as u64;
        assert!((100..=125).contains(&first), "got {first}");
        let third = backoff_delay(&config, 3).as_millis() as u64;
        assert!((400..=500).contains(&third), "got {third}");
        let huge = backoff_delay(&config, 30).as_millis() as u64;
        assert!((1_000..=1_250).contains(&huge), "got {huge}");
    }
}
