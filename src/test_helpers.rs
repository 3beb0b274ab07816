//! Test helpers: an in-process bulk API and executor wiring for controller
//! tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::bulk_data::BulkData;
use crate::controller::{Backends, ControllerOptions, JobController};
use crate::error::Endpoint;
use crate::executor::remote::{
    BatchInfo, BatchState, BulkOperation, BulkSettings, BulkTransport, JobInfo, RemoteExecutor,
    Session, TransportError,
};
use crate::executor::{EmbeddedSqlite, Executor, LocalExecutor};
use crate::job::Job;

#[derive(Default)]
struct FakeState {
    calls: HashMap<&'static str, usize>,
    expire: HashMap<&'static str, usize>,
    pending_polls: usize,
    stuck: bool,
    fail_batches: bool,
    reject_value: Option<String>,
    query_chunks: Vec<String>,
    jobs: Vec<(BulkOperation, String)>,
    batches: Vec<(String, String)>,
    next_id: usize,
}

/// Scripted bulk API. Counts every call per method, failing ones included.
#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Query jobs answer with these result chunks, in order.
    pub fn with_query_chunks(chunks: &[&str]) -> Self {
        let fake = Self::new();
        fake.state.lock().unwrap().query_chunks = chunks.iter().map(|c| c.to_string()).collect();
        fake
    }

    /// Fail the next `times` calls of `method` with an expired session.
    pub fn expire(self, method: &'static str, times: usize) -> Self {
        self.state.lock().unwrap().expire.insert(method, times);
        self
    }

    /// Report `polls` in-progress statuses before batches complete.
    pub fn pending_polls(self, polls: usize) -> Self {
        self.state.lock().unwrap().pending_polls = polls;
        self
    }

    /// Batches never finish.
    pub fn stuck(self) -> Self {
        self.state.lock().unwrap().stuck = true;
        self
    }

    pub fn failing_batches(self) -> Self {
        self.state.lock().unwrap().fail_batches = true;
        self
    }

    /// Mutation rows whose first value equals `value` come back unsuccessful.
    pub fn rejecting(self, value: &str) -> Self {
        self.state.lock().unwrap().reject_value = Some(value.to_string());
        self
    }

    pub fn calls(&self, method: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    pub fn jobs(&self) -> Vec<(BulkOperation, String)> {
        self.state.lock().unwrap().jobs.clone()
    }

    /// Payloads of every submitted batch, in submission order.
    pub fn payloads(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .batches
            .iter()
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    fn enter(&self, method: &'static str) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(method).or_default() += 1;
        if let Some(left) = state.expire.get_mut(method) {
            if *left > 0 {
                *left -= 1;
                return Err(TransportError::SessionExpired);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BulkTransport for FakeTransport {
    async fn login(&self) -> Result<Session, TransportError> {
        self.enter("login")?;
        Ok(Session {
            instance_url: "https://fake.example.com".to_string(),
            session_id: format!("session-{}", self.calls("login")),
        })
    }

    async fn create_job(
        &self,
        _session: &Session,
        operation: BulkOperation,
        object: &str,
    ) -> Result<JobInfo, TransportError> {
        self.enter("create_job")?;
        let mut state = self.state.lock().unwrap();
        state.jobs.push((operation, object.to_string()));
        Ok(JobInfo {
            id: format!("750{}", state.jobs.len()),
            state: "Open".to_string(),
        })
    }

    async fn add_batch(
        &self,
        _session: &Session,
        _job_id: &str,
        payload: &str,
    ) -> Result<BatchInfo, TransportError> {
        self.enter("add_batch")?;
        let mut state = self.state.lock().unwrap();
        let id = format!("751{}", state.batches.len());
        state.batches.push((id.clone(), payload.to_string()));
        Ok(BatchInfo {
            id,
            state: BatchState::Queued,
            state_message: None,
        })
    }

    async fn batch_info(
        &self,
        _session: &Session,
        _job_id: &str,
        batch_id: &str,
    ) -> Result<BatchInfo, TransportError> {
        self.enter("batch_info")?;
        let mut state = self.state.lock().unwrap();
        let (batch_state, message) = if state.stuck {
            (BatchState::InProgress, None)
        } else if state.pending_polls > 0 {
            state.pending_polls -= 1;
            (BatchState::InProgress, None)
        } else if state.fail_batches {
            (
                BatchState::Failed,
                Some("InvalidBatch : Field name not found : Nope".to_string()),
            )
        } else {
            (BatchState::Completed, None)
        };
        Ok(BatchInfo {
            id: batch_id.to_string(),
            state: batch_state,
            state_message: message,
        })
    }

    async fn close_job(&self, _session: &Session, job_id: &str) -> Result<JobInfo, TransportError> {
        self.enter("close_job")?;
        Ok(JobInfo {
            id: job_id.to_string(),
            state: "Closed".to_string(),
        })
    }

    async fn query_result_ids(
        &self,
        _session: &Session,
        _job_id: &str,
        _batch_id: &str,
    ) -> Result<Vec<String>, TransportError> {
        self.enter("query_result_ids")?;
        let state = self.state.lock().unwrap();
        Ok((0..state.query_chunks.len()).map(|i| format!("752{}", i)).collect())
    }

    async fn query_result_chunk(
        &self,
        _session: &Session,
        _job_id: &str,
        _batch_id: &str,
        result_id: &str,
    ) -> Result<String, TransportError> {
        self.enter("query_result_chunk")?;
        let state = self.state.lock().unwrap();
        let idx: usize = result_id
            .strip_prefix("752")
            .and_then(|i| i.parse().ok())
            .ok_or_else(|| TransportError::Protocol(format!("unknown result {}", result_id)))?;
        Ok(state.query_chunks[idx].clone())
    }

    async fn batch_results(
        &self,
        _session: &Session,
        _job_id: &str,
        batch_id: &str,
    ) -> Result<String, TransportError> {
        self.enter("batch_results")?;
        let mut state = self.state.lock().unwrap();
        let payload = state
            .batches
            .iter()
            .find(|(id, _)| id == batch_id)
            .map(|(_, payload)| payload.clone())
            .ok_or_else(|| TransportError::Protocol(format!("unknown batch {}", batch_id)))?;
        let input = BulkData::from_csv(&payload).map_err(|e| TransportError::Protocol(e.to_string()))?;

        let mut rows = Vec::new();
        for row in input.rows() {
            let rejected = state.reject_value.as_deref() == row.first().map(String::as_str);
            state.next_id += 1;
            rows.push(if rejected {
                vec![
                    String::new(),
                    "false".to_string(),
                    "false".to_string(),
                    "REQUIRED_FIELD_MISSING:Required fields are missing: [Name]".to_string(),
                ]
            } else {
                vec![
                    format!("001{:05}", state.next_id),
                    "true".to_string(),
                    "true".to_string(),
                    String::new(),
                ]
            });
        }
        let fields = ["Id", "Success", "Created", "Error"]
            .iter()
            .map(|f| f.to_string())
            .collect();
        let output = BulkData::new(fields, rows).map_err(|e| TransportError::Protocol(e.to_string()))?;
        Ok(output.to_csv())
    }
}

/// Settings that never sleep long.
pub fn fast_settings() -> BulkSettings {
    BulkSettings {
        max_batch_rows: 10_000,
        poll_interval: Duration::from_millis(1),
        poll_timeout: Some(Duration::from_secs(5)),
        relogin_delay: Duration::ZERO,
    }
}

pub fn remote(endpoint: Endpoint, transport: &Arc<FakeTransport>) -> RemoteExecutor {
    let transport: Arc<dyn BulkTransport> = transport.clone();
    RemoteExecutor::new(endpoint, transport, fast_settings())
}

/// Controller with the embedded engine and optional fake remote endpoints.
pub fn controller(
    script: &str,
    options: ControllerOptions,
    src: Option<&Arc<FakeTransport>>,
    dst: Option<&Arc<FakeTransport>>,
) -> JobController {
    let job = Job::parse(script).expect("script should parse");
    let backends = Backends {
        local: Box::new(LocalExecutor::new(EmbeddedSqlite)),
        src: src.map(|t| Box::new(remote(Endpoint::Src, t)) as Box<dyn Executor>),
        dst: dst.map(|t| Box::new(remote(Endpoint::Dst, t)) as Box<dyn Executor>),
    };
    JobController::new(job, backends, options)
}
