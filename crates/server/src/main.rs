//! Stratus server binary.
//!
//! Wires the stores, the collaborator clients, the executor and the
//! orchestration engine from environment configuration, resumes unfinished
//! work and serves the HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use stratus_adapters::{
    connect, HttpProvisionerClient, HttpReconcilerClient, InMemoryBus, InMemoryInstanceStore,
    InMemoryOperationStore, InMemoryOrchestrationStore, InMemoryRuntimeStateStore,
    MockProvisionerClient, MockReconcilerClient, PostgresInstanceStore, PostgresOperationStore,
    PostgresOrchestrationStore, PostgresRuntimeStateStore,
};
use stratus_modules::{
    ExecutorConfig, ExecutorContext, LifecycleService, OrchestrationConfig, OrchestrationEngine,
    StepExecutor,
};
use stratus_ports::{
    EventSubscriber, InstanceRepository, OperationRepository, OrchestrationRepository,
    ProvisionerClient, ReconcilerClient, RuntimeStateRepository,
};
use stratus_server::{build_router, AppState, MetricsRegistry, ServerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

type Stores = (
    Arc<dyn OperationRepository>,
    Arc<dyn InstanceRepository>,
    Arc<dyn RuntimeStateRepository>,
    Arc<dyn OrchestrationRepository>,
);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()?;
    info!("starting stratus server");

    let (operations, instances, runtime_states, orchestrations) = build_stores(&config).await?;

    let timeout = Duration::from_millis(config.http_timeout_ms);
    let provisioner: Arc<dyn ProvisionerClient> = match &config.provisioner_url {
        Some(url) => Arc::new(HttpProvisionerClient::new(url.clone(), timeout)),
        None => {
            info!("no provisioner configured, using the mock client");
            Arc::new(MockProvisionerClient::new())
        }
    };
    let reconciler: Arc<dyn ReconcilerClient> = match &config.reconciler_url {
        Some(url) => Arc::new(HttpReconcilerClient::new(url.clone(), timeout)),
        None => {
            info!("no reconciler configured, using the mock client");
            Arc::new(MockReconcilerClient::new())
        }
    };

    let bus = Arc::new(InMemoryBus::default());

    let executor = Arc::new(StepExecutor::new(ExecutorContext {
        operations: operations.clone(),
        instances: instances.clone(),
        runtime_states,
        provisioner,
        reconciler,
        events: bus.clone(),
        config: ExecutorConfig {
            workers: config.executor_workers,
            default_runtime_version: config.default_runtime_version.clone(),
            ..Default::default()
        },
    }));
    executor.start();
    executor.resume_unfinished().await?;

    let engine = Arc::new(OrchestrationEngine::new(
        orchestrations,
        operations.clone(),
        instances.clone(),
        executor.clone(),
        bus.clone(),
        OrchestrationConfig::default(),
    ));
    engine.resume_unfinished().await?;

    let lifecycle = Arc::new(LifecycleService::new(operations, instances, executor.clone()));

    let metrics = MetricsRegistry::new()?;
    metrics.clone().observe(bus.subscribe().await?);

    let app = build_router(AppState {
        lifecycle,
        engine,
        metrics,
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    executor.shutdown();
    Ok(())
}

async fn build_stores(config: &ServerConfig) -> Result<Stores, Box<dyn std::error::Error>> {
    match &config.database_url {
        Some(url) => {
            let pool = connect(url, config.max_db_connections).await?;
            let operations = PostgresOperationStore::new(pool.clone());
            operations.init().await?;
            let instances = PostgresInstanceStore::new(pool.clone());
            instances.init().await?;
            let runtime_states = PostgresRuntimeStateStore::new(pool.clone());
            runtime_states.init().await?;
            let orchestrations = PostgresOrchestrationStore::new(pool);
            orchestrations.init().await?;
            info!("using postgresql stores");
            Ok((
                Arc::new(operations),
                Arc::new(instances),
                Arc::new(runtime_states),
                Arc::new(orchestrations),
            ))
        }
        None => {
            info!("no database configured, using in-memory stores");
            Ok((
                Arc::new(InMemoryOperationStore::new()),
                Arc::new(InMemoryInstanceStore::new()),
                Arc::new(InMemoryRuntimeStateStore::new()),
                Arc::new(InMemoryOrchestrationStore::new()),
            ))
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}
