//! Lifecycle steps
//!
//! Each operation kind maps to a fixed, ordered sequence of steps. Steps are
//! a closed set of tagged variants sharing one capability: run once against
//! the executor context and report whether the sequence may advance, the same
//! step must be re-invoked later, or the operation has failed.
//!
//! Steps are written to be invoked any number of times. Side effects against
//! the provisioner and reconciler record their external reference (job id,
//! reconciliation id) on the operation before they are treated as done, so a
//! re-invoked step re-queries instead of re-submitting.

use super::ExecutorContext;
use std::time::Duration;
use stratus_core::{
    ClusterConfiguration, Instance, Operation, OperationKind, ReconciliationId, RuntimeState,
};
use stratus_ports::{
    InfrastructureSpec, InfrastructureStatus, ProvisionerError, ReconcilerError,
    ReconciliationStatus, StoreError, TeardownSpec,
};
use tracing::{debug, info};

/// Verdict of one step invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step completed; the operation advances to the next step.
    Done,
    /// The step is waiting on an external system; re-invoke after the delay.
    Repeat(Duration),
    /// The step failed; transient failures are retried, fatal ones end the
    /// operation.
    Failed(StepError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepErrorKind {
    Transient,
    Fatal,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == StepErrorKind::Transient
    }
}

impl From<ProvisionerError> for StepError {
    fn from(err: ProvisionerError) -> Self {
        if err.is_transient() {
            StepError::transient(err.to_string())
        } else {
            StepError::fatal(err.to_string())
        }
    }
}

impl From<ReconcilerError> for StepError {
    fn from(err: ReconcilerError) -> Self {
        if err.is_transient() {
            StepError::transient(err.to_string())
        } else {
            StepError::fatal(err.to_string())
        }
    }
}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(_) => StepError::transient(err.to_string()),
            _ => StepError::fatal(err.to_string()),
        }
    }
}

/// The closed set of lifecycle steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    InitializeRuntime,
    ResolveRuntimeVersion,
    ResolveUpgradeVersion,
    RequestInfrastructure,
    WaitForInfrastructure,
    ApplyConfiguration,
    RequestTeardown,
    WaitForTeardown,
    ReleaseRuntime,
}

const PROVISION_STEPS: [StepKind; 4] = [
    StepKind::InitializeRuntime,
    StepKind::RequestInfrastructure,
    StepKind::WaitForInfrastructure,
    StepKind::ApplyConfiguration,
];

const UPDATE_STEPS: [StepKind; 2] = [StepKind::ResolveRuntimeVersion, StepKind::ApplyConfiguration];

const UPGRADE_STEPS: [StepKind; 2] =
    [StepKind::ResolveUpgradeVersion, StepKind::ApplyConfiguration];

const DEPROVISION_STEPS: [StepKind; 3] = [
    StepKind::RequestTeardown,
    StepKind::WaitForTeardown,
    StepKind::ReleaseRuntime,
];

/// Ordered step sequence for an operation kind.
pub fn steps_for(kind: OperationKind) -> &'static [StepKind] {
    match kind {
        OperationKind::Provision => &PROVISION_STEPS,
        OperationKind::Update => &UPDATE_STEPS,
        OperationKind::Upgrade => &UPGRADE_STEPS,
        OperationKind::Deprovision => &DEPROVISION_STEPS,
    }
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::InitializeRuntime => "initialize_runtime",
            StepKind::ResolveRuntimeVersion => "resolve_runtime_version",
            StepKind::ResolveUpgradeVersion => "resolve_upgrade_version",
            StepKind::RequestInfrastructure => "request_infrastructure",
            StepKind::WaitForInfrastructure => "wait_for_infrastructure",
            StepKind::ApplyConfiguration => "apply_configuration",
            StepKind::RequestTeardown => "request_teardown",
            StepKind::WaitForTeardown => "wait_for_teardown",
            StepKind::ReleaseRuntime => "release_runtime",
        }
    }

    /// Invoke the step once. Mutations to `operation` are persisted by the
    /// executor after the invocation returns.
    pub async fn run(&self, ctx: &ExecutorContext, operation: &mut Operation) -> StepOutcome {
        let result = match self {
            StepKind::InitializeRuntime => initialize_runtime(ctx, operation).await,
            StepKind::ResolveRuntimeVersion => resolve_runtime_version(ctx, operation).await,
            StepKind::ResolveUpgradeVersion => resolve_upgrade_version(operation),
            StepKind::RequestInfrastructure => request_infrastructure(ctx, operation).await,
            StepKind::WaitForInfrastructure => wait_for_infrastructure(ctx, operation).await,
            StepKind::ApplyConfiguration => apply_configuration(ctx, operation).await,
            StepKind::RequestTeardown => request_teardown(ctx, operation).await,
            StepKind::WaitForTeardown => wait_for_teardown(ctx, operation).await,
            StepKind::ReleaseRuntime => release_runtime(ctx, operation).await,
        };
        match result {
            Ok(outcome) => outcome,
            Err(error) => StepOutcome::Failed(error),
        }
    }
}

async fn load_instance(
    ctx: &ExecutorContext,
    operation: &Operation,
) -> Result<Instance, StepError> {
    ctx.instances
        .get(&operation.instance_id)
        .await?
        .ok_or_else(|| StepError::fatal(format!("instance {} not found", operation.instance_id)))
}

fn assemble_configuration(operation: &Operation, version: &str) -> ClusterConfiguration {
    ClusterConfiguration::assemble(
        operation.runtime_id,
        operation.id,
        version,
        operation.parameters.profile.as_deref(),
        &operation.parameters.overrides,
    )
}

/// Checks the inventory record and pins the runtime version the remaining
/// steps will apply.
async fn initialize_runtime(
    ctx: &ExecutorContext,
    operation: &mut Operation,
) -> Result<StepOutcome, StepError> {
    load_instance(ctx, operation).await?;
    let version = operation
        .parameters
        .runtime_version
        .clone()
        .unwrap_or_else(|| ctx.config.default_runtime_version.clone());
    debug!(
        "operation {} provisions runtime {} at version {}",
        operation.id, operation.runtime_id, version
    );
    operation.runtime_version = Some(version);
    Ok(StepOutcome::Done)
}

/// Updates re-apply the version already on the runtime unless the request
/// names another one.
async fn resolve_runtime_version(
    ctx: &ExecutorContext,
    operation: &mut Operation,
) -> Result<StepOutcome, StepError> {
    let instance = load_instance(ctx, operation).await?;
    let version = operation
        .parameters
        .runtime_version
        .clone()
        .or(instance.runtime_version)
        .unwrap_or_else(|| ctx.config.default_runtime_version.clone());
    operation.runtime_version = Some(version);
    Ok(StepOutcome::Done)
}

/// Upgrades never guess: a missing target version is an invalid request.
fn resolve_upgrade_version(operation: &mut Operation) -> Result<StepOutcome, StepError> {
    let version = operation
        .parameters
        .runtime_version
        .clone()
        .ok_or_else(|| StepError::fatal("upgrade requires a target runtime version"))?;
    operation.runtime_version = Some(version);
    Ok(StepOutcome::Done)
}

async fn request_infrastructure(
    ctx: &ExecutorContext,
    operation: &mut Operation,
) -> Result<StepOutcome, StepError> {
    if operation.provisioner_job_id.is_some() {
        return Ok(StepOutcome::Done);
    }
    let instance = load_instance(ctx, operation).await?;
    let spec = InfrastructureSpec {
        runtime_id: operation.runtime_id,
        operation_id: operation.id,
        name: instance.name,
        service_plan: instance.service_plan,
        region: instance.region,
    };
    let job_id = ctx.provisioner.request_infrastructure(&spec).await?;
    info!(
        "infrastructure job {} requested for runtime {}",
        job_id, operation.runtime_id
    );
    operation.provisioner_job_id = Some(job_id);
    Ok(StepOutcome::Done)
}

async fn wait_for_infrastructure(
    ctx: &ExecutorContext,
    operation: &mut Operation,
) -> Result<StepOutcome, StepError> {
    let job_id = operation
        .provisioner_job_id
        .clone()
        .ok_or_else(|| StepError::fatal("no infrastructure job recorded"))?;
    match ctx.provisioner.job_status(&job_id).await? {
        InfrastructureStatus::Pending => Ok(StepOutcome::Repeat(ctx.config.poll_interval())),
        InfrastructureStatus::Succeeded => Ok(StepOutcome::Done),
        InfrastructureStatus::Failed { reason } => Err(StepError::fatal(format!(
            "infrastructure provisioning failed: {reason}"
        ))),
    }
}

/// Submit the desired configuration once, then poll until the reconciler
/// reports convergence. A converged configuration is recorded as a runtime
/// state snapshot and reflected on the inventory record.
async fn apply_configuration(
    ctx: &ExecutorContext,
    operation: &mut Operation,
) -> Result<StepOutcome, StepError> {
    let version = operation
        .runtime_version
        .clone()
        .ok_or_else(|| StepError::fatal("no runtime version resolved"))?;

    let reconciliation_id = match operation.reconciliation_id.clone() {
        Some(id) => id,
        None => {
            let configuration = assemble_configuration(operation, &version);
            let id = ctx
                .reconciler
                .submit_configuration(&operation.runtime_id, &configuration)
                .await?;
            debug!(
                "reconciliation {} accepted for runtime {} at version {}",
                id, operation.runtime_id, version
            );
            operation.reconciliation_id = Some(id);
            return Ok(StepOutcome::Repeat(ctx.config.poll_interval()));
        }
    };

    match ctx.reconciler.configuration_status(&reconciliation_id).await? {
        ReconciliationStatus::Pending => Ok(StepOutcome::Repeat(ctx.config.poll_interval())),
        ReconciliationStatus::Failed { reason } => Err(StepError::fatal(format!(
            "configuration did not converge: {reason}"
        ))),
        ReconciliationStatus::Succeeded => {
            record_converged_state(ctx, operation, &version, reconciliation_id).await?;
            info!(
                "runtime {} converged at version {}",
                operation.runtime_id, version
            );
            Ok(StepOutcome::Done)
        }
    }
}

async fn record_converged_state(
    ctx: &ExecutorContext,
    operation: &Operation,
    version: &str,
    reconciliation_id: ReconciliationId,
) -> Result<(), StepError> {
    if ctx
        .runtime_states
        .get_by_operation(&operation.id)
        .await?
        .is_none()
    {
        let configuration = assemble_configuration(operation, version);
        let state = RuntimeState::new(operation.id, reconciliation_id, configuration);
        match ctx.runtime_states.insert(&state).await {
            Ok(()) | Err(StoreError::Conflict(_)) => {}
            Err(err) => return Err(err.into()),
        }
    }
    let mut instance = load_instance(ctx, operation).await?;
    instance.mark_provisioned(version);
    ctx.instances.update(&instance).await?;
    Ok(())
}

async fn request_teardown(
    ctx: &ExecutorContext,
    operation: &mut Operation,
) -> Result<StepOutcome, StepError> {
    if operation.provisioner_job_id.is_some() {
        return Ok(StepOutcome::Done);
    }
    let spec = TeardownSpec {
        runtime_id: operation.runtime_id,
        operation_id: operation.id,
    };
    let job_id = ctx.provisioner.request_teardown(&spec).await?;
    info!(
        "teardown job {} requested for runtime {}",
        job_id, operation.runtime_id
    );
    operation.provisioner_job_id = Some(job_id);
    Ok(StepOutcome::Done)
}

async fn wait_for_teardown(
    ctx: &ExecutorContext,
    operation: &mut Operation,
) -> Result<StepOutcome, StepError> {
    let job_id = operation
        .provisioner_job_id
        .clone()
        .ok_or_else(|| StepError::fatal("no teardown job recorded"))?;
    match ctx.provisioner.job_status(&job_id).await? {
        InfrastructureStatus::Pending => Ok(StepOutcome::Repeat(ctx.config.poll_interval())),
        InfrastructureStatus::Succeeded => Ok(StepOutcome::Done),
        InfrastructureStatus::Failed { reason } => Err(StepError::fatal(format!(
            "infrastructure teardown failed: {reason}"
        ))),
    }
}

async fn release_runtime(
    ctx: &ExecutorContext,
    operation: &mut Operation,
) -> Result<StepOutcome, StepError> {
    let mut instance = load_instance(ctx, operation).await?;
    if instance.deprovisioned_at.is_none() {
        instance.mark_deprovisioned();
        ctx.instances.update(&instance).await?;
        info!("runtime {} released", operation.runtime_id);
    }
    Ok(StepOutcome::Done)
}
