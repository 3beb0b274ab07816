//! HTTP implementation of [`BulkTransport`] for the Salesforce-style async
//! bulk API.
//!
//! `ureq` is blocking, so each request runs on tokio's blocking pool. Login
//! uses the SOAP partner endpoint; everything else lives under
//! `{instance}/services/async/{version}/job`.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::transport::{
    BatchInfo, BatchState, BulkOperation, BulkTransport, JobInfo, Session, TransportError,
};
use super::xml;

const JOB_NS: &str = "http://www.force.com/2009/06/asyncapi/dataload";
const SESSION_HEADER: &str = "X-SFDC-Session";
const CONTENT_XML: &str = "application/xml; charset=UTF-8";
const CONTENT_CSV: &str = "text/csv; charset=UTF-8";

/// Login details for one org.
#[derive(Clone)]
pub struct Credentials {
    pub login_url: String,
    pub username: String,
    pub password: String,
    pub security_token: String,
    pub api_version: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login_url", &self.login_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("api_version", &self.api_version)
            .finish()
    }
}

pub struct HttpBulkTransport {
    credentials: Credentials,
    agent: ureq::Agent,
}

impl HttpBulkTransport {
    pub fn new(credentials: Credentials, timeout: Duration) -> Self {
        Self {
            credentials,
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    fn job_url(&self, session: &Session, tail: &str) -> String {
        format!(
            "{}/services/async/{}/job{}",
            session.instance_url.trim_end_matches('/'),
            self.credentials.api_version,
            tail
        )
    }

    async fn send(
        &self,
        method: &'static str,
        url: String,
        headers: Vec<(&'static str, String)>,
        body: Option<String>,
    ) -> Result<String, TransportError> {
        let agent = self.agent.clone();
        debug!(method, url = %url, "Bulk API request");

        tokio::task::spawn_blocking(move || {
            let mut request = agent.request(method, &url);
            for (name, value) in &headers {
                request = request.set(name, value);
            }
            let response = match body {
                Some(body) => request.send_string(&body),
                None => request.call(),
            };
            match response {
                Ok(response) => response
                    .into_string()
                    .map_err(|e| TransportError::Http(e.to_string())),
                Err(ureq::Error::Status(code, response)) => {
                    let body = response.into_string().unwrap_or_default();
                    Err(classify_error(code, &body))
                }
                Err(ureq::Error::Transport(err)) => Err(TransportError::Http(err.to_string())),
            }
        })
        .await
        .map_err(|e| TransportError::Http(format!("request task failed: {}", e)))?
    }

    async fn get(&self, session: &Session, tail: &str) -> Result<String, TransportError> {
        let url = self.job_url(session, tail);
        self.send("GET", url, vec![(SESSION_HEADER, session.session_id.clone())], None)
            .await
    }

    async fn post(
        &self,
        session: &Session,
        tail: &str,
        content_type: &str,
        body: String,
    ) -> Result<String, TransportError> {
        let url = self.job_url(session, tail);
        self.send(
            "POST",
            url,
            vec![
                (SESSION_HEADER, session.session_id.clone()),
                ("Content-Type", content_type.to_string()),
            ],
            Some(body),
        )
        .await
    }
}

/// Map an error response body to a transport error.
fn classify_error(status: u16, body: &str) -> TransportError {
    if let Some(code) = xml::tag_value(body, "exceptionCode") {
        if code == "InvalidSessionId" {
            return TransportError::SessionExpired;
        }
        let message = xml::tag_value(body, "exceptionMessage").unwrap_or_default();
        return TransportError::Api { code, message };
    }
    if let Some(code) = xml::tag_value(body, "faultcode") {
        if code.ends_with("INVALID_SESSION_ID") {
            return TransportError::SessionExpired;
        }
        let message = xml::tag_value(body, "faultstring").unwrap_or_default();
        return TransportError::Api { code, message };
    }
    TransportError::Http(format!("status {}: {}", status, body.trim()))
}

fn parse_job(body: &str) -> Result<JobInfo, TransportError> {
    let id = xml::tag_value(body, "id")
        .ok_or_else(|| TransportError::Protocol("jobInfo without id".to_string()))?;
    let state = xml::tag_value(body, "state").unwrap_or_default();
    Ok(JobInfo { id, state })
}

fn parse_batch(body: &str) -> Result<BatchInfo, TransportError> {
    let id = xml::tag_value(body, "id")
        .ok_or_else(|| TransportError::Protocol("batchInfo without id".to_string()))?;
    let state_text = xml::tag_value(body, "state").unwrap_or_default();
    let state = BatchState::parse(&state_text).ok_or_else(|| {
        TransportError::Protocol(format!("unknown batch state '{}'", state_text))
    })?;
    Ok(BatchInfo {
        id,
        state,
        state_message: xml::tag_value(body, "stateMessage").filter(|m| !m.is_empty()),
    })
}

fn login_envelope(credentials: &Credentials) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8" ?>"#,
            r#"<env:Envelope xmlns:xsd="http://www.w3.org/2001/XMLSchema" "#,
            r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" "#,
            r#"xmlns:env="http://schemas.xmlsoap.org/soap/envelope/">"#,
            r#"<env:Body><n1:login xmlns:n1="urn:partner.soap.sforce.com">"#,
            "<n1:username>{}</n1:username><n1:password>{}{}</n1:password>",
            "</n1:login></env:Body></env:Envelope>"
        ),
        xml::escape(&credentials.username),
        xml::escape(&credentials.password),
        xml::escape(&credentials.security_token),
    )
}

/// `https://na1.salesforce.com/services/Soap/u/38.0/00D..` to `https://na1.salesforce.com`
fn instance_from_server_url(server_url: &str) -> String {
    match server_url.find("/services/") {
        Some(idx) => server_url[..idx].to_string(),
        None => server_url.trim_end_matches('/').to_string(),
    }
}

#[async_trait]
impl BulkTransport for HttpBulkTransport {
    async fn login(&self) -> Result<Session, TransportError> {
        let url = format!(
            "{}/services/Soap/u/{}",
            self.credentials.login_url.trim_end_matches('/'),
            self.credentials.api_version
        );
        let body = self
            .send(
                "POST",
                url,
                vec![
                    ("Content-Type", "text/xml; charset=UTF-8".to_string()),
                    ("SOAPAction", "login".to_string()),
                ],
                Some(login_envelope(&self.credentials)),
            )
            .await?;

        let session_id = xml::tag_value(&body, "sessionId")
            .ok_or_else(|| TransportError::Protocol("login response without sessionId".to_string()))?;
        let server_url = xml::tag_value(&body, "serverUrl")
            .ok_or_else(|| TransportError::Protocol("login response without serverUrl".to_string()))?;

        Ok(Session {
            instance_url: instance_from_server_url(&server_url),
            session_id,
        })
    }

    async fn create_job(
        &self,
        session: &Session,
        operation: BulkOperation,
        object: &str,
    ) -> Result<JobInfo, TransportError> {
        let body = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><jobInfo xmlns="{}"><operation>{}</operation><object>{}</object><contentType>CSV</contentType></jobInfo>"#,
            JOB_NS,
            operation,
            xml::escape(object)
        );
        let response = self.post(session, "", CONTENT_XML, body).await?;
        parse_job(&response)
    }

    async fn add_batch(
        &self,
        session: &Session,
        job_id: &str,
        payload: &str,
    ) -> Result<BatchInfo, TransportError> {
        let response = self
            .post(session, &format!("/{}/batch", job_id), CONTENT_CSV, payload.to_string())
            .await?;
        parse_batch(&response)
    }

    async fn batch_info(
        &self,
        session: &Session,
        job_id: &str,
        batch_id: &str,
    ) -> Result<BatchInfo, TransportError> {
        let response = self
            .get(session, &format!("/{}/batch/{}", job_id, batch_id))
            .await?;
        parse_batch(&response)
    }

    async fn close_job(&self, session: &Session, job_id: &str) -> Result<JobInfo, TransportError> {
        let body = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><jobInfo xmlns="{}"><state>Closed</state></jobInfo>"#,
            JOB_NS
        );
        let response = self
            .post(session, &format!("/{}", job_id), CONTENT_XML, body)
            .await?;
        parse_job(&response)
    }

    async fn query_result_ids(
        &self,
        session: &Session,
        job_id: &str,
        batch_id: &str,
    ) -> Result<Vec<String>, TransportError> {
        let response = self
            .get(session, &format!("/{}/batch/{}/result", job_id, batch_id))
            .await?;
        Ok(xml::tag_values(&response, "result"))
    }

    async fn query_result_chunk(
        &self,
        session: &Session,
        job_id: &str,
        batch_id: &str,
        result_id: &str,
    ) -> Result<String, TransportError> {
        self.get(
            session,
            &format!("/{}/batch/{}/result/{}", job_id, batch_id, result_id),
        )
        .await
    }

    async fn batch_results(
        &self,
        session: &Session,
        job_id: &str,
        batch_id: &str,
    ) -> Result<String, TransportError> {
        self.get(session, &format!("/{}/batch/{}/result", job_id, batch_id))
            .await
    }
}
