//! HTTP surface tests against a real listener with in-memory stores and mock
//! collaborator clients.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use stratus_adapters::{
    InMemoryBus, InMemoryInstanceStore, InMemoryOperationStore, InMemoryOrchestrationStore,
    InMemoryRuntimeStateStore, MockProvisionerClient, MockReconcilerClient,
};
use stratus_modules::{
    ExecutorConfig, ExecutorContext, LifecycleService, OrchestrationConfig, OrchestrationEngine,
    StepExecutor,
};
use stratus_ports::EventSubscriber;
use stratus_server::{build_router, AppState, MetricsRegistry};

async fn spawn_server() -> String {
    let operations = Arc::new(InMemoryOperationStore::new());
    let instances = Arc::new(InMemoryInstanceStore::new());
    let runtime_states = Arc::new(InMemoryRuntimeStateStore::new());
    let orchestrations = Arc::new(InMemoryOrchestrationStore::new());
    let bus = Arc::new(InMemoryBus::default());

    let executor = Arc::new(StepExecutor::new(ExecutorContext {
        operations: operations.clone(),
        instances: instances.clone(),
        runtime_states,
        provisioner: Arc::new(MockProvisionerClient::new()),
        reconciler: Arc::new(MockReconcilerClient::new()),
        events: bus.clone(),
        config: ExecutorConfig {
            workers: 2,
            backoff_base_ms: 1,
            backoff_cap_ms: 4,
            poll_interval_ms: 10,
            ..Default::default()
        },
    }));
    executor.start();

    let engine = Arc::new(OrchestrationEngine::new(
        orchestrations,
        operations.clone(),
        instances.clone(),
        executor.clone(),
        bus.clone(),
        OrchestrationConfig {
            member_poll_interval_ms: 10,
        },
    ));
    let lifecycle = Arc::new(LifecycleService::new(operations, instances, executor));

    let metrics = MetricsRegistry::new().unwrap();
    metrics.clone().observe(bus.subscribe().await.unwrap());

    let app = build_router(AppState {
        lifecycle,
        engine,
        metrics,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn provision_body() -> Value {
    json!({
        "name": "cluster-a",
        "service_plan": "azure",
        "region": "westeurope",
        "global_account_id": "ga-1",
        "subaccount_id": "sa-1",
    })
}

async fn await_operation_status(client: &reqwest::Client, base: &str, id: &str, status: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let body: Value = client
                .get(format!("{base}/operations/{id}"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if body["status"] == status {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("operation should reach the expected status")
}

#[tokio::test]
async fn test_health_endpoint() {
    let base = spawn_server().await;
    let body: Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_provision_is_accepted_and_runs_to_success() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/runtimes/inst-1/provision"))
        .json(&provision_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    let body: Value = response.json().await.unwrap();
    let operation_id = body["operation_id"].as_str().unwrap().to_string();

    let finished = await_operation_status(&client, &base, &operation_id, "succeeded").await;
    assert_eq!(finished["kind"], "provision");
    assert_eq!(finished["instance_id"], "inst-1");
}

#[tokio::test]
async fn test_provision_missing_fields_is_rejected() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/runtimes/inst-1/provision"))
        .json(&json!({ "name": "cluster-a" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_second_action_while_busy_is_a_conflict() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    // Two back-to-back submissions; at most one can be in flight.
    client
        .post(format!("{base}/runtimes/inst-1/provision"))
        .json(&provision_body())
        .send()
        .await
        .unwrap();
    let second = client
        .post(format!("{base}/runtimes/inst-1/provision"))
        .json(&provision_body())
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), reqwest::StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_unknown_operation_is_404() {
    let base = spawn_server().await;
    let response = reqwest::get(format!(
        "{base}/operations/00000000-0000-4000-8000-000000000000"
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_update_flow_and_annotations() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{base}/runtimes/inst-1/provision"))
        .json(&provision_body())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = body["operation_id"].as_str().unwrap().to_string();
    await_operation_status(&client, &base, &id, "succeeded").await;

    let update: Value = client
        .post(format!("{base}/runtimes/inst-1/update"))
        .json(&json!({ "runtime_version": "2.1.0" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let update_id = update["operation_id"].as_str().unwrap().to_string();
    let finished = await_operation_status(&client, &base, &update_id, "succeeded").await;
    assert_eq!(finished["runtime_version"], "2.1.0");

    let annotated: Value = client
        .post(format!("{base}/operations/{update_id}/annotations"))
        .json(&json!({ "ticket": "OPS-41" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(annotated["annotations"]["ticket"], "OPS-41");
}

#[tokio::test]
async fn test_upgrade_orchestration_over_provisioned_runtimes() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    for instance in ["inst-1", "inst-2"] {
        let body: Value = client
            .post(format!("{base}/runtimes/{instance}/provision"))
            .json(&provision_body())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = body["operation_id"].as_str().unwrap().to_string();
        await_operation_status(&client, &base, &id, "succeeded").await;
    }

    let response = client
        .post(format!("{base}/upgrade/runtime"))
        .json(&json!({
            "strategy": { "kind": "parallel", "schedule": "immediate", "workers": 2 },
            "targets": { "include": [ { "subaccount": "sa-1" } ] },
            "runtime": { "version": "2.1.0" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    let body: Value = response.json().await.unwrap();
    let orchestration_id = body["orchestration_id"].as_str().unwrap().to_string();

    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let body: Value = client
                .get(format!("{base}/orchestrations/{orchestration_id}"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if body["status"] == "succeeded" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("orchestration should succeed");
    assert_eq!(finished["members"].as_array().unwrap().len(), 2);

    let operations: Value = client
        .get(format!("{base}/orchestrations/{orchestration_id}/operations"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(operations.as_array().unwrap().len(), 2);

    let listed: Value = client
        .get(format!("{base}/orchestrations"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_dry_run_creates_members_but_no_operations() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{base}/runtimes/inst-1/provision"))
        .json(&provision_body())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = body["operation_id"].as_str().unwrap().to_string();
    await_operation_status(&client, &base, &id, "succeeded").await;

    let body: Value = client
        .post(format!("{base}/upgrade/runtime"))
        .json(&json!({
            "strategy": { "kind": "serial", "schedule": "immediate", "workers": 0 },
            "targets": { "include": [ {} ] },
            "runtime": { "version": "2.1.0" },
            "dryRun": true,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let orchestration_id = body["orchestration_id"].as_str().unwrap().to_string();

    let orchestration: Value = client
        .get(format!("{base}/orchestrations/{orchestration_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(orchestration["status"], "succeeded");
    assert_eq!(orchestration["dry_run"], true);
    assert_eq!(orchestration["members"][0]["status"], "skipped");

    let operations: Value = client
        .get(format!("{base}/orchestrations/{orchestration_id}/operations"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(operations.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_unknown_orchestration_is_404() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!(
            "{base}/orchestrations/00000000-0000-4000-8000-000000000000/cancel"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_endpoint_reports_counters() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    client
        .post(format!("{base}/runtimes/inst-1/provision"))
        .json(&provision_body())
        .send()
        .await
        .unwrap();

    let text = client
        .get(format!("{base}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("stratus_operations_created_total{kind=\"provision\"} 1"));
}
