//! Wire-level operations of the asynchronous bulk API.
//!
//! Every call takes the [`Session`] explicitly. Refreshing an expired
//! session is the caller's job: the transport only reports
//! [`TransportError::SessionExpired`].

use std::fmt;

use async_trait::async_trait;

/// Authenticated handle for one remote org.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Base URL of the org instance, e.g. `https://na1.salesforce.com`
    pub instance_url: String,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("session expired or invalid")]
    SessionExpired,

    #[error("api error {code}: {message}")]
    Api { code: String, message: String },

    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected response: {0}")]
    Protocol(String),
}

/// Bulk job operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOperation {
    Query,
    Insert,
    Update,
}

impl BulkOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkOperation::Query => "query",
            BulkOperation::Insert => "insert",
            BulkOperation::Update => "update",
        }
    }
}

impl fmt::Display for BulkOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub id: String,
    pub state: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Queued,
    InProgress,
    Completed,
    Failed,
    NotProcessed,
}

impl BatchState {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "Queued" => Some(BatchState::Queued),
            "InProgress" => Some(BatchState::InProgress),
            "Completed" => Some(BatchState::Completed),
            "Failed" => Some(BatchState::Failed),
            "Not Processed" | "NotProcessed" => Some(BatchState::NotProcessed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Completed | BatchState::Failed | BatchState::NotProcessed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchInfo {
    pub id: String,
    pub state: BatchState,
    pub state_message: Option<String>,
}

/// The remote bulk API, one method per endpoint.
#[async_trait]
pub trait BulkTransport: Send + Sync {
    async fn login(&self) -> Result<Session, TransportError>;

    async fn create_job(
        &self,
        session: &Session,
        operation: BulkOperation,
        object: &str,
    ) -> Result<JobInfo, TransportError>;

    /// Submit one batch: a query string or delimited rows.
    async fn add_batch(
        &self,
        session: &Session,
        job_id: &str,
        payload: &str,
    ) -> Result<BatchInfo, TransportError>;

    async fn batch_info(
        &self,
        session: &Session,
        job_id: &str,
        batch_id: &str,
    ) -> Result<BatchInfo, TransportError>;

    async fn close_job(&self, session: &Session, job_id: &str) -> Result<JobInfo, TransportError>;

    /// Result chunk ids of a completed query batch, in service order.
    async fn query_result_ids(
        &self,
        session: &Session,
        job_id: &str,
        batch_id: &str,
    ) -> Result<Vec<String>, TransportError>;

    async fn query_result_chunk(
        &self,
        session: &Session,
        job_id: &str,
        batch_id: &str,
        result_id: &str,
    ) -> Result<String, TransportError>;

    /// Per-row outcome of an insert/update batch as delimited text.
    async fn batch_results(
        &self,
        session: &Session,
        job_id: &str,
        batch_id: &str,
    ) -> Result<String, TransportError>;
}
