//! Provisioner Client Implementations
//!
//! `HttpProvisionerClient` talks to a real provisioner service;
//! `MockProvisionerClient` is a scripted stand-in used by the test suites and
//! by deployments running without infrastructure backing.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use stratus_core::OperationId;
use stratus_ports::{InfrastructureSpec, InfrastructureStatus, ProvisionerClient, ProvisionerError, TeardownSpec};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error};

#[derive(Debug, Deserialize)]
struct JobAccepted {
    job_id: String,
}

/// HTTP-based provisioner client
pub struct HttpProvisionerClient {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProvisionerClient {
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

    fn map_status(status: reqwest::StatusCode, body: String) -> ProvisionerError {
        if status.is_server_error() {
            ProvisionerError::Unavailable(format!("{status}: {body}"))
        } else {
            ProvisionerError::Rejected(format!("{status}: {body}"))
        }
    }

    async fn post_job(&self, url: String, payload: serde_json::Value) -> Result<String, ProvisionerError> {
        let response = timeout(self.timeout, async {
            self.client.post(&url).json(&payload).send().await
        })
        .await
        .map_err(|_| {
            ProvisionerError::Timeout(format!("request timed out after {:?}", self.timeout))
        })?
        .map_err(|e| {
            error!("provisioner request failed: {}", e);
            ProvisionerError::Unavailable(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_status(status, body));
        }

        let accepted: JobAccepted = response
            .json()
            .await
            .map_err(|e| ProvisionerError::Protocol(format!("bad job response: {e}")))?;
        Ok(accepted.job_id)
    }
}

#[async_trait]
impl ProvisionerClient for HttpProvisionerClient {
    async fn request_infrastructure(
        &self,
        spec: &InfrastructureSpec,
    ) -> Result<String, ProvisionerError> {
        let url = format!("{}/v1/infrastructure", self.base_url);
        debug!(
            "requesting infrastructure for runtime {} (operation {})",
            spec.runtime_id, spec.operation_id
        );
        let payload = serde_json::to_value(spec)
            .map_err(|e| ProvisionerError::Protocol(format!("bad request payload: {e}")))?;
        self.post_job(url, payload).await
    }

    async fn request_teardown(&self, spec: &TeardownSpec) -> Result<String, ProvisionerError> {
        let url = format!("{}/v1/teardown", self.base_url);
        debug!(
            "requesting teardown for runtime {} (operation {})",
            spec.runtime_id, spec.operation_id
        );
        let payload = serde_json::to_value(spec)
            .map_err(|e| ProvisionerError::Protocol(format!("bad request payload: {e}")))?;
        self.post_job(url, payload).await
    }

    async fn job_status(&self, job_id: &str) -> Result<InfrastructureStatus, ProvisionerError> {
        let url = format!("{}/v1/jobs/{}", self.base_url, job_id);

        let response = timeout(self.timeout, async { self.client.get(&url).send().await })
            .await
            .map_err(|_| {
                ProvisionerError::Timeout(format!("status poll timed out after {:?}", self.timeout))
            })?
            .map_err(|e| ProvisionerError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_status(status, body));
        }

        response
            .json()
            .await
            .map_err(|e| ProvisionerError::Protocol(format!("bad status response: {e}")))
    }
}

#[derive(Default)]
struct JobPoll {
    script: Vec<InfrastructureStatus>,
    polled: usize,
}

#[derive(Default)]
struct MockProvisionerState {
    request_errors: VecDeque<ProvisionerError>,
    status_errors: VecDeque<ProvisionerError>,
    /// Status sequence assigned to newly created jobs; the last entry repeats.
    job_script: Vec<InfrastructureStatus>,
    jobs: HashMap<String, JobPoll>,
    infrastructure_by_operation: HashMap<OperationId, String>,
    teardown_by_operation: HashMap<OperationId, String>,
    jobs_created: u32,
    teardowns_created: u32,
    next_job: u32,
}

/// Scripted provisioner used in tests and infrastructure-less deployments.
///
/// Requests are deduplicated by operation id the way the real provisioner
/// deduplicates by idempotency key: a repeated request returns the original
/// job without creating a new one.
#[derive(Clone, Default)]
pub struct MockProvisionerClient {
    state: Arc<Mutex<MockProvisionerState>>,
}

impl MockProvisionerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue errors returned by the next infrastructure/teardown requests.
    pub async fn fail_next_requests(&self, errors: Vec<ProvisionerError>) {
        let mut state = self.state.lock().await;
        state.request_errors.extend(errors);
    }

    /// Queue errors returned by the next status polls.
    pub async fn fail_next_status_checks(&self, errors: Vec<ProvisionerError>) {
        let mut state = self.state.lock().await;
        state.status_errors.extend(errors);
    }

    /// Status sequence for jobs created from now on. The last entry repeats
    /// once the sequence is exhausted.
    pub async fn script_job_statuses(&self, statuses: Vec<InfrastructureStatus>) {
        let mut state = self.state.lock().await;
        state.job_script = statuses;
    }

    /// Number of infrastructure jobs actually created (idempotent repeats do
    /// not count).
    pub async fn jobs_created(&self) -> u32 {
        self.state.lock().await.jobs_created
    }

    pub async fn teardowns_created(&self) -> u32 {
        self.state.lock().await.teardowns_created
    }

    fn create_job(state: &mut MockProvisionerState) -> String {
        let job_id = format!("job-{}", state.next_job);
        state.next_job += 1;
        let script = if state.job_script.is_empty() {
            vec![InfrastructureStatus::Succeeded]
        } else {
            state.job_script.clone()
        };
        state.jobs.insert(job_id.clone(), JobPoll { script, polled: 0 });
        job_id
    }
}

#[async_trait]
impl ProvisionerClient for MockProvisionerClient {
    async fn request_infrastructure(
        &self,
        spec: &InfrastructureSpec,
    ) -> Result<String, ProvisionerError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.request_errors.pop_front() {
            return Err(err);
        }
        if let Some(existing) = state.infrastructure_by_operation.get(&spec.operation_id) {
            return Ok(existing.clone());
        }
        let job_id = Self::create_job(&mut state);
        state
            .infrastructure_by_operation
            .insert(spec.operation_id, job_id.clone());
        state.jobs_created += 1;
        Ok(job_id)
    }

    async fn request_teardown(&self, spec: &TeardownSpec) -> Result<String, ProvisionerError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.request_errors.pop_front() {
            return Err(err);
        }
        if let Some(existing) = state.teardown_by_operation.get(&spec.operation_id) {
            return Ok(existing.clone());
        }
        let job_id = Self::create_job(&mut state);
        state
            .teardown_by_operation
            .insert(spec.operation_id, job_id.clone());
        state.teardowns_created += 1;
        Ok(job_id)
    }

    async fn job_status(&self, job_id: &str) -> Result<InfrastructureStatus, ProvisionerError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.status_errors.pop_front() {
            return Err(err);
        }
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ProvisionerError::Rejected(format!("unknown job {job_id}")))?;
        let idx = job.polled.min(job.script.len() - 1);
        job.polled += 1;
        Ok(job.script[idx].clone())
    }
}
