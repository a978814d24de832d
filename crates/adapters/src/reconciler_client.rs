//! Reconciler Client Implementations
//!
//! `HttpReconcilerClient` talks to a real reconciler service;
//! `MockReconcilerClient` is a scripted stand-in for the test suites.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use stratus_core::{ClusterConfiguration, OperationId, ReconciliationId, RuntimeId};
use stratus_ports::{
    ReconcilerClient, ReconcilerError, ReconciliationQuery, ReconciliationRecord,
    ReconciliationStatus,
};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error};

#[derive(Debug, Deserialize)]
struct ReconciliationAccepted {
    reconciliation_id: String,
}

#[derive(Debug, Deserialize)]
struct ReconciliationList {
    reconciliations: Vec<ReconciliationRecord>,
}

/// HTTP-based reconciler client
pub struct HttpReconcilerClient {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpReconcilerClient {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
            timeout,
        }
    }

    pub fn with_default_timeout(base_url: String) -> Self {
        Self::new(base_url, Duration::from_secs(10))
    }

    fn map_status(status: reqwest::StatusCode, body: String) -> ReconcilerError {
        if status.is_server_error() {
            ReconcilerError::Unavailable(format!("{status}: {body}"))
        } else {
            ReconcilerError::Rejected(format!("{status}: {body}"))
        }
    }
}

#[async_trait]
impl ReconcilerClient for HttpReconcilerClient {
    async fn submit_configuration(
        &self,
        runtime_id: &RuntimeId,
        configuration: &ClusterConfiguration,
    ) -> Result<ReconciliationId, ReconcilerError> {
        let url = format!("{}/v1/clusters/{}/reconciliations", self.base_url, runtime_id);
        debug!(
            "submitting configuration {} for runtime {}",
            configuration.runtime_version, runtime_id
        );

        let response = timeout(self.timeout, async {
            self.client.post(&url).json(configuration).send().await
        })
        .await
        .map_err(|_| {
            ReconcilerError::Timeout(format!("submission timed out after {:?}", self.timeout))
        })?
        .map_err(|e| {
            error!("reconciler submission failed: {}", e);
            ReconcilerError::Unavailable(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_status(status, body));
        }

        let accepted: ReconciliationAccepted = response
            .json()
            .await
            .map_err(|e| ReconcilerError::Protocol(format!("bad submission response: {e}")))?;
        Ok(ReconciliationId::new(accepted.reconciliation_id))
    }

    async fn configuration_status(
        &self,
        id: &ReconciliationId,
    ) -> Result<ReconciliationStatus, ReconcilerError> {
        let url = format!("{}/v1/reconciliations/{}/status", self.base_url, id);

        let response = timeout(self.timeout, async { self.client.get(&url).send().await })
            .await
            .map_err(|_| {
                ReconcilerError::Timeout(format!("status poll timed out after {:?}", self.timeout))
            })?
            .map_err(|e| ReconcilerError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_status(status, body));
        }

        response
            .json()
            .await
            .map_err(|e| ReconcilerError::Protocol(format!("bad status response: {e}")))
    }

    async fn list_reconciliations(
        &self,
        query: &ReconciliationQuery,
    ) -> Result<Vec<ReconciliationRecord>, ReconcilerError> {
        let url = format!("{}/v1/reconciliations", self.base_url);
        let mut params = Vec::new();
        if !query.runtime_ids.is_empty() {
            params.push(("runtime_id", query.runtime_ids.join(",")));
        }
        if !query.states.is_empty() {
            params.push(("state", query.states.join(",")));
        }
        if !query.shoots.is_empty() {
            params.push(("shoot", query.shoots.join(",")));
        }

        let response = timeout(self.timeout, async {
            self.client.get(&url).query(&params).send().await
        })
        .await
        .map_err(|_| ReconcilerError::Timeout(format!("listing timed out after {:?}", self.timeout)))?
        .map_err(|e| ReconcilerError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_status(status, body));
        }

        let list: ReconciliationList = response
            .json()
            .await
            .map_err(|e| ReconcilerError::Protocol(format!("bad listing response: {e}")))?;
        Ok(list.reconciliations)
    }
}

#[derive(Default)]
struct ReconciliationPoll {
    script: Vec<ReconciliationStatus>,
    polled: usize,
}

#[derive(Default)]
struct MockReconcilerState {
    submit_errors: VecDeque<ReconcilerError>,
    status_errors: VecDeque<ReconcilerError>,
    /// Status sequence for newly accepted reconciliations; last entry repeats.
    status_script: Vec<ReconciliationStatus>,
    reconciliations: HashMap<ReconciliationId, ReconciliationPoll>,
    by_operation: HashMap<OperationId, ReconciliationId>,
    submissions: Vec<ClusterConfiguration>,
    records: Vec<ReconciliationRecord>,
    next_id: u32,
}

/// Scripted reconciler used in tests and reconciler-less deployments.
///
/// Submissions are deduplicated by the operation id embedded in the
/// configuration payload, mirroring the real reconciler's idempotency-key
/// handling.
#[derive(Clone, Default)]
pub struct MockReconcilerClient {
    state: Arc<Mutex<MockReconcilerState>>,
}

impl MockReconcilerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_next_submissions(&self, errors: Vec<ReconcilerError>) {
        let mut state = self.state.lock().await;
        state.submit_errors.extend(errors);
    }

    pub async fn fail_next_status_checks(&self, errors: Vec<ReconcilerError>) {
        let mut state = self.state.lock().await;
        state.status_errors.extend(errors);
    }

    /// Status sequence for reconciliations accepted from now on. The last
    /// entry repeats once the sequence is exhausted.
    pub async fn script_statuses(&self, statuses: Vec<ReconciliationStatus>) {
        let mut state = self.state.lock().await;
        state.status_script = statuses;
    }

    /// Accepted configuration payloads, in submission order. Idempotent
    /// repeats are not recorded.
    pub async fn submissions(&self) -> Vec<ClusterConfiguration> {
        self.state.lock().await.submissions.clone()
    }

    pub async fn submission_count(&self) -> usize {
        self.state.lock().await.submissions.len()
    }

    /// Records served by `list_reconciliations`.
    pub async fn seed_records(&self, records: Vec<ReconciliationRecord>) {
        let mut state = self.state.lock().await;
        state.records = records;
    }
}

fn record_matches(record: &ReconciliationRecord, query: &ReconciliationQuery) -> bool {
    if !query.runtime_ids.is_empty() && !query.runtime_ids.contains(&record.runtime_id) {
        return false;
    }
    let all_states = query.states.iter().any(|s| s == "all");
    if !query.states.is_empty() && !all_states && !query.states.contains(&record.status) {
        return false;
    }
    if !query.shoots.is_empty() {
        match &record.shoot {
            Some(shoot) if query.shoots.contains(shoot) => {}
            _ => return false,
        }
    }
    true
}

#[async_trait]
impl ReconcilerClient for MockReconcilerClient {
    async fn submit_configuration(
        &self,
        _runtime_id: &RuntimeId,
        configuration: &ClusterConfiguration,
    ) -> Result<ReconciliationId, ReconcilerError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.submit_errors.pop_front() {
            return Err(err);
        }
        if let Some(existing) = state.by_operation.get(&configuration.operation_id) {
            return Ok(existing.clone());
        }

        let id = ReconciliationId::new(format!("rec-{}", state.next_id));
        state.next_id += 1;
        let script = if state.status_script.is_empty() {
            vec![ReconciliationStatus::Succeeded]
        } else {
            state.status_script.clone()
        };
        state
            .reconciliations
            .insert(id.clone(), ReconciliationPoll { script, polled: 0 });
        state
            .by_operation
            .insert(configuration.operation_id, id.clone());
        state.submissions.push(configuration.clone());
        Ok(id)
    }

    async fn configuration_status(
        &self,
        id: &ReconciliationId,
    ) -> Result<ReconciliationStatus, ReconcilerError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.status_errors.pop_front() {
            return Err(err);
        }
        let poll = state
            .reconciliations
            .get_mut(id)
            .ok_or_else(|| ReconcilerError::Rejected(format!("unknown reconciliation {id}")))?;
        let idx = poll.polled.min(poll.script.len() - 1);
        poll.polled += 1;
        Ok(poll.script[idx].clone())
    }

    async fn list_reconciliations(
        &self,
        query: &ReconciliationQuery,
    ) -> Result<Vec<ReconciliationRecord>, ReconcilerError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .filter(|record| record_matches(record, query))
            .cloned()
            .collect())
    }
}
