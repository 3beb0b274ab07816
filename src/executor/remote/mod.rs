//! Remote backend: queries and mutations through the asynchronous bulk API.
//!
//! One request is one bulk job:
//!
//! ```text
//! Created -> BatchesSubmitted -> Polling -> Completed | Failed
//! ```
//!
//! Rows are split into batches of at most `max_batch_rows`. Batches are
//! polled until each reaches a terminal state or `poll_timeout` runs out.
//! Every transport call goes through [`RemoteExecutor::call`], which retries
//! exactly once after an expired session: wait `relogin_delay`, log in again,
//! repeat the call with the new session.

pub mod http;
pub mod transport;
mod xml;


use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Executor, Outcome, Request, Shape};
use crate::bulk_data::BulkData;
use crate::error::{Backend, Endpoint, JobError};
use crate::job::MutationOp;

pub use http::{Credentials, HttpBulkTransport};
pub use transport::{
    BatchInfo, BatchState, BulkOperation, BulkTransport, JobInfo, Session, TransportError,
};

/// Body the service returns instead of CSV for an empty query result.
const NO_RECORDS: &str = "Records not found for this query";

/// Fields of the per-row outcome table of an insert/update.
pub const OUTCOME_FIELDS: [&str; 4] = ["Id", "Success", "Created", "Error"];

/// Tuning for bulk jobs.
#[derive(Debug, Clone)]
pub struct BulkSettings {
    pub max_batch_rows: usize,
    pub poll_interval: Duration,
    /// `None` waits until every batch is terminal
    pub poll_timeout: Option<Duration>,
    pub relogin_delay: Duration,
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self {
            max_batch_rows: 10_000,
            poll_interval: Duration::from_secs(2),
            poll_timeout: Some(Duration::from_secs(3600)),
            relogin_delay: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobPhase {
    Created,
    BatchesSubmitted,
    Polling,
    Completed,
    Failed,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobPhase::Created => "created",
            JobPhase::BatchesSubmitted => "batches_submitted",
            JobPhase::Polling => "polling",
            JobPhase::Completed => "completed",
            JobPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub struct RemoteExecutor {
    endpoint: Endpoint,
    transport: Arc<dyn BulkTransport>,
    session: Option<Session>,
    settings: BulkSettings,
}

impl RemoteExecutor {
    pub fn new(endpoint: Endpoint, transport: Arc<dyn BulkTransport>, settings: BulkSettings) -> Self {
        Self {
            endpoint,
            transport,
            session: None,
            settings,
        }
    }

    fn fail(&self, message: impl Into<String>) -> JobError {
        JobError::execution(Backend::Remote(self.endpoint), message)
    }

    fn enter(&self, job_id: &str, phase: JobPhase) {
        info!(endpoint = %self.endpoint, job_id, phase = %phase, "Bulk job phase");
    }

    /// Current session, logging in on first use.
    async fn session(&mut self) -> Result<Session, JobError> {
        if let Some(session) = &self.session {
            return Ok(session.clone());
        }
        let session = self
            .transport
            .login()
            .await
            .map_err(|e| self.fail(format!("login failed: {}", e)))?;
        debug!(endpoint = %self.endpoint, instance = %session.instance_url, "Logged in");
        self.session = Some(session.clone());
        Ok(session)
    }

    async fn relogin(&mut self) -> Result<Session, JobError> {
        self.session = None;
        tokio::time::sleep(self.settings.relogin_delay).await;
        self.session().await
    }

    /// Run one transport call, retrying once on an expired session.
    async fn call<T, F, Fut>(&mut self, what: &str, op: F) -> Result<T, JobError>
    where
        F: Fn(Arc<dyn BulkTransport>, Session) -> Fut + Send,
        Fut: Future<Output = Result<T, TransportError>> + Send,
        T: Send,
    {
        let session = self.session().await?;
        match op(Arc::clone(&self.transport), session).await {
            Ok(value) => Ok(value),
            Err(TransportError::SessionExpired) => {
                warn!(
                    endpoint = %self.endpoint,
                    operation = what,
                    delay_secs = self.settings.relogin_delay.as_secs(),
                    "Session expired, logging in again and retrying once"
                );
                let session = self.relogin().await?;
                match op(Arc::clone(&self.transport), session).await {
                    Ok(value) => Ok(value),
                    Err(TransportError::SessionExpired) => Err(self.fail(format!(
                        "{}: session expired again after logging in",
                        what
                    ))),
                    Err(e) => Err(self.fail(format!("{}: {}", what, e))),
                }
            }
            Err(e) => Err(self.fail(format!("{}: {}", what, e))),
        }
    }

    async fn create_job(&mut self, operation: BulkOperation, object: &str) -> Result<JobInfo, JobError> {
        let job = self
            .call("create job", |t, s| {
                let object = object.to_string();
                async move { t.create_job(&s, operation, &object).await }
            })
            .await?;
        self.enter(&job.id, JobPhase::Created);
        Ok(job)
    }

    async fn submit(&mut self, job_id: &str, payloads: Vec<String>) -> Result<Vec<BatchInfo>, JobError> {
        let mut batches = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let batch = self
                .call("add batch", |t, s| {
                    let job_id = job_id.to_string();
                    let payload = payload.clone();
                    async move { t.add_batch(&s, &job_id, &payload).await }
                })
                .await?;
            debug!(job_id, batch_id = %batch.id, "Batch submitted");
            batches.push(batch);
        }

        self.call("close job", |t, s| {
            let job_id = job_id.to_string();
            async move { t.close_job(&s, &job_id).await }
        })
        .await?;
        self.enter(job_id, JobPhase::BatchesSubmitted);
        Ok(batches)
    }

    /// Poll until every batch is terminal. Any batch that did not complete
    /// fails the job.
    async fn wait(&mut self, job_id: &str, mut batches: Vec<BatchInfo>) -> Result<Vec<BatchInfo>, JobError> {
        self.enter(job_id, JobPhase::Polling);
        let started = Instant::now();

        loop {
            let mut pending = 0;
            for batch in batches.iter_mut() {
                if batch.state.is_terminal() {
                    continue;
                }
                let batch_id = batch.id.clone();
                *batch = self
                    .call("batch status", |t, s| {
                        let job_id = job_id.to_string();
                        let batch_id = batch_id.clone();
                        async move { t.batch_info(&s, &job_id, &batch_id).await }
                    })
                    .await?;
                if !batch.state.is_terminal() {
                    pending += 1;
                }
            }
            if pending == 0 {
                break;
            }
            if let Some(timeout) = self.settings.poll_timeout {
                if started.elapsed() >= timeout {
                    self.enter(job_id, JobPhase::Failed);
                    return Err(self.fail(format!(
                        "job {}: {} batch(es) not finished after {}s",
                        job_id,
                        pending,
                        timeout.as_secs_f64()
                    )));
                }
            }
            debug!(job_id, pending, "Waiting for batches");
            tokio::time::sleep(self.settings.poll_interval).await;
        }

        if let Some(bad) = batches.iter().find(|b| b.state != BatchState::Completed) {
            self.enter(job_id, JobPhase::Failed);
            return Err(self.fail(format!(
                "job {}: batch {} ended {:?}: {}",
                job_id,
                bad.id,
                bad.state,
                bad.state_message.as_deref().unwrap_or("no message")
            )));
        }
        self.enter(job_id, JobPhase::Completed);
        Ok(batches)
    }

    async fn query(&mut self, soql: &str, object: &str, shape: Shape) -> Result<Outcome, JobError> {
        let job = self.create_job(BulkOperation::Query, object).await?;
        let batches = self.submit(&job.id, vec![soql.to_string()]).await?;
        let batches = self.wait(&job.id, batches).await?;

        let mut parts = Vec::new();
        for batch in &batches {
            let result_ids = self
                .call("list query results", |t, s| {
                    let job_id = job.id.clone();
                    let batch_id = batch.id.clone();
                    async move { t.query_result_ids(&s, &job_id, &batch_id).await }
                })
                .await?;
            for result_id in result_ids {
                let text = self
                    .call("fetch query result", |t, s| {
                        let job_id = job.id.clone();
                        let batch_id = batch.id.clone();
                        let result_id = result_id.clone();
                        async move {
                            t.query_result_chunk(&s, &job_id, &batch_id, &result_id)
                                .await
                        }
                    })
                    .await?;
                if text.trim() == NO_RECORDS {
                    continue;
                }
                let chunk = BulkData::from_csv(&text)
                    .map_err(|e| self.fail(format!("result chunk {}: {}", result_id, e)))?;
                debug!(job_id = %job.id, result_id = %result_id, rows = chunk.len(), "Result chunk");
                parts.push(chunk);
            }
        }

        let data = BulkData::concat(parts).map_err(|e| self.fail(e.to_string()))?;
        Ok(match shape {
            Shape::Table => Outcome::Table(data),
            Shape::Scalar => Outcome::Scalar(data.first_value().unwrap_or_default().to_string()),
        })
    }

    async fn mutate(&mut self, op: MutationOp, object: &str, rows: &BulkData) -> Result<Outcome, JobError> {
        if rows.is_empty() {
            debug!(object, "No rows to {}", op.as_str());
            let fields = OUTCOME_FIELDS.iter().map(|f| f.to_string()).collect();
            return BulkData::new(fields, Vec::new())
                .map(Outcome::Table)
                .map_err(|e| self.fail(e.to_string()));
        }

        let operation = match op {
            MutationOp::Insert => BulkOperation::Insert,
            MutationOp::Update => BulkOperation::Update,
        };
        let job = self.create_job(operation, object).await?;
        let payloads = rows
            .chunks(self.settings.max_batch_rows)
            .iter()
            .map(BulkData::to_csv)
            .collect();
        let batches = self.submit(&job.id, payloads).await?;
        let batches = self.wait(&job.id, batches).await?;

        let mut parts = Vec::with_capacity(batches.len());
        for batch in &batches {
            let text = self
                .call("fetch batch results", |t, s| {
                    let job_id = job.id.clone();
                    let batch_id = batch.id.clone();
                    async move { t.batch_results(&s, &job_id, &batch_id).await }
                })
                .await?;
            let part = BulkData::from_csv(&text)
                .map_err(|e| self.fail(format!("batch {} results: {}", batch.id, e)))?;
            parts.push(part);
        }
        let outcome = BulkData::concat(parts).map_err(|e| self.fail(e.to_string()))?;
        self.report_rejected(object, op, &outcome);
        Ok(Outcome::Table(outcome))
    }

    /// Rows the service refused are logged, not raised.
    fn report_rejected(&self, object: &str, op: MutationOp, outcome: &BulkData) {
        let Some(success) = outcome.column_index("Success") else {
            return;
        };
        let error = outcome.column_index("Error");
        let mut rejected = 0;
        for (idx, row) in outcome.rows().iter().enumerate() {
            if row[success].eq_ignore_ascii_case("false") {
                rejected += 1;
                warn!(
                    endpoint = %self.endpoint,
                    object,
                    op = op.as_str(),
                    row = idx + 1,
                    error = error.map(|e| row[e].as_str()).unwrap_or(""),
                    "Row rejected by remote"
                );
            }
        }
        info!(
            endpoint = %self.endpoint,
            object,
            op = op.as_str(),
            rows = outcome.len(),
            rejected,
            "Bulk mutation finished"
        );
    }
}

#[async_trait]
impl Executor for RemoteExecutor {
    fn backend(&self) -> Backend {
        Backend::Remote(self.endpoint)
    }

    async fn execute(&mut self, request: Request<'_>) -> Result<Outcome, JobError> {
        match request {
            Request::Query {
                sql,
                object: Some(object),
                shape,
                ..
            } => self.query(sql, object, shape).await,
            Request::Query { object: None, .. } => {
                Err(self.fail("remote query names no object to read"))
            }
            Request::Mutate { op, object, rows } => self.mutate(op, object, rows).await,
        }
    }
}
