//! HTTP surface
//!
//! Thin mapping of routes onto the lifecycle service and the orchestration
//! engine. Handlers validate nothing themselves; they translate requests
//! into service calls and service errors into status codes.

use crate::metrics::MetricsRegistry;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use stratus_core::{
    DomainError, InstanceId, LastError, MaintenanceWindow, Operation, OperationId, OperationKind,
    OperationParameters, OperationStatus, Orchestration, OrchestrationId, OrchestrationMember,
    OrchestrationStatus, RuntimeId, StrategySpec, TargetSpec, UpgradeParameters,
};
use stratus_modules::executor::steps_for;
use stratus_modules::{LifecycleError, LifecycleService, OrchestrationEngine, OrchestrationError};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<LifecycleService>,
    pub engine: Arc<OrchestrationEngine>,
    pub metrics: MetricsRegistry,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(gather_metrics))
        .route("/runtimes/{instance_id}/provision", post(provision))
        .route("/runtimes/{instance_id}/update", post(update))
        .route("/runtimes/{instance_id}/deprovision", post(deprovision))
        .route("/operations/{id}", get(get_operation))
        .route("/operations/{id}/cancel", post(cancel_operation))
        .route("/operations/{id}/annotations", post(annotate_operation))
        .route("/upgrade/runtime", post(upgrade_runtime))
        .route("/orchestrations", get(list_orchestrations))
        .route("/orchestrations/{id}", get(get_orchestration))
        .route(
            "/orchestrations/{id}/operations",
            get(list_orchestration_operations),
        )
        .route("/orchestrations/{id}/cancel", post(cancel_orchestration))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

type ApiError = (StatusCode, Json<Value>);

// ===== Request bodies =====

#[derive(Debug, Deserialize)]
pub struct MaintenanceWindowBody {
    pub begin: String,
    pub end: String,
}

/// Parameters of a single-runtime lifecycle action. Which fields matter
/// depends on the action; the lifecycle service validates.
#[derive(Debug, Default, Deserialize)]
pub struct LifecycleRequest {
    pub name: Option<String>,
    pub service_plan: Option<String>,
    pub region: Option<String>,
    pub global_account_id: Option<String>,
    pub subaccount_id: Option<String>,
    pub runtime_version: Option<String>,
    pub profile: Option<String>,
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    pub maintenance_window: Option<MaintenanceWindowBody>,
}

impl LifecycleRequest {
    fn into_parameters(self) -> Result<OperationParameters, ApiError> {
        let maintenance_window = match self.maintenance_window {
            Some(body) => {
                let begin = body.begin.parse().map_err(|_| {
                    bad_request(format!("invalid maintenance window begin {:?}", body.begin))
                })?;
                let end = body.end.parse().map_err(|_| {
                    bad_request(format!("invalid maintenance window end {:?}", body.end))
                })?;
                Some(MaintenanceWindow::new(begin, end).map_err(|err| bad_request(err.to_string()))?)
            }
            None => None,
        };
        Ok(OperationParameters {
            name: self.name,
            service_plan: self.service_plan,
            region: self.region,
            global_account_id: self.global_account_id,
            subaccount_id: self.subaccount_id,
            runtime_version: self.runtime_version,
            profile: self.profile,
            overrides: self.overrides,
            maintenance_window,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct UpgradeTarget {
    pub version: String,
    pub profile: Option<String>,
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct UpgradeRequest {
    pub strategy: StrategySpec,
    pub targets: TargetSpec,
    pub runtime: UpgradeTarget,
    #[serde(default, alias = "dryRun")]
    pub dry_run: bool,
}

// ===== Response bodies =====

#[derive(Debug, Serialize)]
pub struct OperationSummary {
    pub operation_id: OperationId,
    pub instance_id: InstanceId,
    pub runtime_id: RuntimeId,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub orchestration_id: Option<OrchestrationId>,
    pub current_step: Option<String>,
    pub attempts: u32,
    pub runtime_version: Option<String>,
    pub last_error: Option<LastError>,
    pub cancel_requested: bool,
    pub annotations: BTreeMap<String, String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<Operation> for OperationSummary {
    fn from(operation: Operation) -> Self {
        let current_step = steps_for(operation.kind)
            .get(operation.current_step as usize)
            .map(|step| step.name().to_string());
        Self {
            operation_id: operation.id,
            instance_id: operation.instance_id,
            runtime_id: operation.runtime_id,
            kind: operation.kind,
            status: operation.status,
            orchestration_id: operation.orchestration_id,
            current_step,
            attempts: operation.attempts,
            runtime_version: operation.runtime_version,
            last_error: operation.last_error,
            cancel_requested: operation.cancel_requested,
            annotations: operation.annotations,
            created_at: operation.created_at,
            updated_at: operation.updated_at,
            finished_at: operation.finished_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OrchestrationSummary {
    pub orchestration_id: OrchestrationId,
    pub status: OrchestrationStatus,
    pub strategy: StrategySpec,
    pub runtime_version: String,
    pub dry_run: bool,
    pub cancel_requested: bool,
    pub members: Vec<OrchestrationMember>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<Orchestration> for OrchestrationSummary {
    fn from(orchestration: Orchestration) -> Self {
        Self {
            orchestration_id: orchestration.id,
            status: orchestration.status,
            strategy: orchestration.strategy,
            runtime_version: orchestration.parameters.runtime_version,
            dry_run: orchestration.dry_run,
            cancel_requested: orchestration.cancel_requested,
            members: orchestration.members,
            created_at: orchestration.created_at,
            updated_at: orchestration.updated_at,
            finished_at: orchestration.finished_at,
        }
    }
}

// ===== Handlers =====

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "stratus-server",
    }))
}

async fn gather_metrics(State(state): State<AppState>) -> Result<String, ApiError> {
    state.metrics.gather().map_err(|err| {
        warn!("gathering metrics failed: {}", err);
        internal_error()
    })
}

async fn provision(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(request): Json<LifecycleRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let parameters = request.into_parameters()?;
    let id = state
        .lifecycle
        .provision(InstanceId::new(instance_id), parameters)
        .await
        .map_err(lifecycle_error)?;
    state.metrics.operation_created(OperationKind::Provision);
    Ok(accepted_operation(id))
}

async fn update(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(request): Json<LifecycleRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let parameters = request.into_parameters()?;
    let id = state
        .lifecycle
        .update(InstanceId::new(instance_id), parameters)
        .await
        .map_err(lifecycle_error)?;
    state.metrics.operation_created(OperationKind::Update);
    Ok(accepted_operation(id))
}

async fn deprovision(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(request): Json<LifecycleRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let parameters = request.into_parameters()?;
    let id = state
        .lifecycle
        .deprovision(InstanceId::new(instance_id), parameters)
        .await
        .map_err(lifecycle_error)?;
    state.metrics.operation_created(OperationKind::Deprovision);
    Ok(accepted_operation(id))
}

async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<OperationId>,
) -> Result<Json<OperationSummary>, ApiError> {
    let operation = state
        .lifecycle
        .get_operation(&id)
        .await
        .map_err(lifecycle_error)?;
    Ok(Json(operation.into()))
}

async fn cancel_operation(
    State(state): State<AppState>,
    Path(id): Path<OperationId>,
) -> Result<StatusCode, ApiError> {
    state
        .lifecycle
        .cancel_operation(&id)
        .await
        .map_err(lifecycle_error)?;
    Ok(StatusCode::ACCEPTED)
}

async fn annotate_operation(
    State(state): State<AppState>,
    Path(id): Path<OperationId>,
    Json(annotations): Json<BTreeMap<String, String>>,
) -> Result<Json<OperationSummary>, ApiError> {
    let operation = state
        .lifecycle
        .annotate_operation(&id, annotations)
        .await
        .map_err(lifecycle_error)?;
    Ok(Json(operation.into()))
}

async fn upgrade_runtime(
    State(state): State<AppState>,
    Json(request): Json<UpgradeRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let parameters = UpgradeParameters {
        runtime_version: request.runtime.version,
        profile: request.runtime.profile,
        overrides: request.runtime.overrides,
    };
    let id = state
        .engine
        .schedule(request.strategy, request.targets, parameters, request.dry_run)
        .await
        .map_err(orchestration_error)?;
    state.metrics.orchestration_created();
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "orchestration_id": id })),
    ))
}

async fn list_orchestrations(
    State(state): State<AppState>,
) -> Result<Json<Vec<OrchestrationSummary>>, ApiError> {
    let orchestrations = state.engine.list().await.map_err(orchestration_error)?;
    Ok(Json(orchestrations.into_iter().map(Into::into).collect()))
}

async fn get_orchestration(
    State(state): State<AppState>,
    Path(id): Path<OrchestrationId>,
) -> Result<Json<OrchestrationSummary>, ApiError> {
    let orchestration = state.engine.get(&id).await.map_err(orchestration_error)?;
    Ok(Json(orchestration.into()))
}

async fn list_orchestration_operations(
    State(state): State<AppState>,
    Path(id): Path<OrchestrationId>,
) -> Result<Json<Vec<OperationSummary>>, ApiError> {
    let operations = state
        .engine
        .list_operations(&id)
        .await
        .map_err(orchestration_error)?;
    Ok(Json(operations.into_iter().map(Into::into).collect()))
}

async fn cancel_orchestration(
    State(state): State<AppState>,
    Path(id): Path<OrchestrationId>,
) -> Result<StatusCode, ApiError> {
    state.engine.cancel(&id).await.map_err(orchestration_error)?;
    Ok(StatusCode::ACCEPTED)
}

// ===== Error mapping =====

fn accepted_operation(id: OperationId) -> (StatusCode, Json<Value>) {
    (StatusCode::ACCEPTED, Json(json!({ "operation_id": id })))
}

fn bad_request(message: String) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn internal_error() -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error" })),
    )
}

fn domain_status(err: &DomainError) -> StatusCode {
    match err {
        DomainError::Validation(_) => StatusCode::BAD_REQUEST,
        DomainError::NotFound(_) => StatusCode::NOT_FOUND,
        DomainError::InvalidStateTransition { .. } | DomainError::Conflict(_) => {
            StatusCode::CONFLICT
        }
    }
}

fn lifecycle_error(err: LifecycleError) -> ApiError {
    let status = match &err {
        LifecycleError::Domain(domain) => domain_status(domain),
        LifecycleError::InstanceNotFound(_) | LifecycleError::OperationNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        LifecycleError::Conflict(_, _) => StatusCode::CONFLICT,
        LifecycleError::Store(inner) => {
            warn!("store failure behind the lifecycle surface: {}", inner);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": err.to_string() })))
}

fn orchestration_error(err: OrchestrationError) -> ApiError {
    let status = match &err {
        OrchestrationError::Domain(domain) => domain_status(domain),
        OrchestrationError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestrationError::Store(inner) => {
            warn!("store failure behind the orchestration surface: {}", inner);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": err.to_string() })))
}
