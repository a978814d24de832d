//! End-to-end lifecycle flows over the in-memory stack.

use pretty_assertions::assert_eq;
use stratus_core::{InstanceId, OperationParameters, OperationStatus};
use stratus_integration_tests::Stack;
use stratus_ports::{InstanceRepository, ReconciliationStatus, RuntimeStateRepository};

#[tokio::test]
async fn test_provision_update_deprovision_round_trip() {
    let stack = Stack::start();
    let instance_id = InstanceId::new("inst-1");

    let instance = stack.provision_active("inst-1", "sa-1").await;
    assert!(instance.is_active());
    assert_eq!(instance.runtime_version.as_deref(), Some("2.0.0"));
    assert_eq!(stack.provisioner.jobs_created().await, 1);

    let update = stack
        .lifecycle
        .update(
            instance_id.clone(),
            OperationParameters {
                runtime_version: Some("2.1.0".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let finished = stack.await_operation(update).await;
    assert_eq!(finished.status, OperationStatus::Succeeded);

    let updated = stack.instances.get(&instance_id).await.unwrap().unwrap();
    assert_eq!(updated.runtime_version.as_deref(), Some("2.1.0"));

    // Two converged configurations means two immutable snapshots.
    let states = stack
        .runtime_states
        .list_by_runtime(&updated.runtime_id)
        .await
        .unwrap();
    assert_eq!(states.len(), 2);

    let deprovision = stack
        .lifecycle
        .deprovision(instance_id.clone(), OperationParameters::default())
        .await
        .unwrap();
    let finished = stack.await_operation(deprovision).await;
    assert_eq!(finished.status, OperationStatus::Succeeded);
    assert_eq!(stack.provisioner.teardowns_created().await, 1);

    let torn_down = stack.instances.get(&instance_id).await.unwrap().unwrap();
    assert!(!torn_down.is_active());
}

#[tokio::test]
async fn test_convergence_failure_leaves_no_runtime_state() {
    let stack = Stack::start();
    stack
        .reconciler
        .script_statuses(vec![ReconciliationStatus::Failed {
            reason: "component apply failed".into(),
        }])
        .await;

    let id = stack
        .lifecycle
        .provision(
            InstanceId::new("inst-1"),
            Stack::provision_parameters("sa-1"),
        )
        .await
        .unwrap();
    let finished = stack.await_operation(id).await;

    assert_eq!(finished.status, OperationStatus::Failed);
    let error = finished.last_error.expect("failure recorded");
    assert_eq!(error.step, "apply_configuration");
    assert!(error.message.contains("component apply failed"));

    // The configuration was submitted but never converged.
    assert_eq!(stack.reconciler.submission_count().await, 1);
    let states = stack
        .runtime_states
        .list_by_runtime(&finished.runtime_id)
        .await
        .unwrap();
    assert!(states.is_empty());

    let instance = stack
        .instances
        .get(&InstanceId::new("inst-1"))
        .await
        .unwrap()
        .unwrap();
    assert!(!instance.is_active());
}

#[tokio::test]
async fn test_restart_resumes_operations_from_their_recorded_step() {
    let stack = Stack::start();
    let id = stack
        .lifecycle
        .provision(
            InstanceId::new("inst-1"),
            Stack::provision_parameters("sa-1"),
        )
        .await
        .unwrap();
    let finished = stack.await_operation(id).await;
    assert_eq!(finished.status, OperationStatus::Succeeded);

    // A restarted process finds nothing unfinished and re-seeds nothing.
    let resumed = stack.executor.resume_unfinished().await.unwrap();
    assert_eq!(resumed, 0);

    // One converged configuration, despite the extra sweep.
    assert_eq!(stack.reconciler.submission_count().await, 1);
}
