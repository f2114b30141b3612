use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use jobstep_core::api::{self, Report};
use jobstep_core::JobStepDocument;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::Client;

use crate::error::TransportError;

/// Calls the agent makes to the coordinating server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one status, log or artifact report.
    async fn send(&self, report: &Report) -> Result<(), TransportError>;

    /// Post a heartbeat and return the server's view of the job step.
    async fn heartbeat(&self, jobstep_id: &str) -> Result<JobStepDocument, TransportError>;
}

/// Exponential backoff between attempts of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, given `attempt` already failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpTransport {
    pub fn new(base_url: &str, retry: RetryPolicy) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        }
    }

    /// `GET /jobsteps/{id}/`: the plan as the server knows it.
    pub async fn fetch_document(&self, jobstep_id: &str) -> Result<JobStepDocument, TransportError> {
        let path = api::jobstep_path(jobstep_id);
        self.with_retry("GET", &path, || self.get_document_once(&path))
            .await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn with_retry<T, F, Fut>(
        &self,
        method: &'static str,
        path: &str,
        mut op: F,
    ) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.retry.max_attempts && e.is_retryable() => {
                    let delay = self.retry.delay_after(attempt);
                    tracing::warn!(%method, %path, attempt, error = %e, ?delay, "request failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_document_once(&self, path: &str) -> Result<JobStepDocument, TransportError> {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|source| http_error("GET", path, source))?;
        decode_document(path, check_status("GET", path, resp)?).await
    }

    async fn post_once(&self, report: &Report, path: &str) -> Result<(), TransportError> {
        let req = self.client.post(self.url(path));
        let req = match report {
            Report::JobStepStatus { form, .. } => req.form(form),
            Report::CommandStatus { form, .. } => req.form(form),
            Report::LogAppend { form, .. } => req
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(form.to_urlencoded()),
            Report::Artifact { upload, .. } => {
                let file = Part::bytes(upload.bytes.clone()).file_name(upload.name.clone());
                req.multipart(
                    Form::new()
                        .text("name", upload.name.clone())
                        .part("file", file),
                )
            }
        };
        let resp = req
            .send()
            .await
            .map_err(|source| http_error("POST", path, source))?;
        check_status("POST", path, resp)?;
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, report: &Report) -> Result<(), TransportError> {
        let path = report.path();
        self.with_retry("POST", &path, || self.post_once(report, &path))
            .await
    }

    async fn heartbeat(&self, jobstep_id: &str) -> Result<JobStepDocument, TransportError> {
        let path = api::heartbeat_path(jobstep_id);
        // Heartbeats are periodic already; a failed one is simply skipped.
        let resp = self
            .client
            .post(self.url(&path))
            .send()
            .await
            .map_err(|source| http_error("POST", &path, source))?;
        decode_document(&path, check_status("POST", &path, resp)?).await
    }
}

fn http_error(method: &'static str, path: &str, source: reqwest::Error) -> TransportError {
    TransportError::Http {
        method,
        path: path.to_string(),
        source,
    }
}

fn check_status(
    method: &'static str,
    path: &str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, TransportError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(TransportError::Status {
            method,
            path: path.to_string(),
            status,
        });
    }
    Ok(resp)
}

async fn decode_document(
    path: &str,
    resp: reqwest::Response,
) -> Result<JobStepDocument, TransportError> {
    let bytes = resp
        .bytes()
        .await
        .map_err(|source| http_error("READ", path, source))?;
    serde_json::from_slice(&bytes).map_err(|source| TransportError::Decode {
        path: path.to_string(),
        source,
    })
}

/// In-memory transport for unit tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use jobstep_core::model::{IdRef, RemoteStatus};

    use super::*;

    #[derive(Default)]
    pub struct RecordingTransport {
        pub reports: Mutex<Vec<Report>>,
        pub heartbeats: Mutex<u32>,
        /// Heartbeat number (1-based) from which the server reports `finished`.
        pub finish_at_heartbeat: Option<u32>,
        pub fail_sends: bool,
    }

    impl RecordingTransport {
        pub fn reports(&self) -> Vec<Report> {
            self.reports.lock().unwrap().clone()
        }

        pub fn heartbeat_count(&self) -> u32 {
            *self.heartbeats.lock().unwrap()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, report: &Report) -> Result<(), TransportError> {
            if self.fail_sends {
                return Err(TransportError::Status {
                    method: "POST",
                    path: report.path(),
                    status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                });
            }
            self.reports.lock().unwrap().push(report.clone());
            Ok(())
        }

        async fn heartbeat(&self, jobstep_id: &str) -> Result<JobStepDocument, TransportError> {
            let n = {
                let mut count = self.heartbeats.lock().unwrap();
                *count += 1;
                *count
            };
            let finished = self.finish_at_heartbeat.is_some_and(|at| n >= at);
            Ok(JobStepDocument {
                id: jobstep_id.to_string(),
                commands: vec![],
                result: IdRef {
                    id: jobstep_core::JobStepResult::Unknown,
                },
                status: IdRef {
                    id: if finished {
                        RemoteStatus::Finished
                    } else {
                        RemoteStatus::InProgress
                    },
                },
                repository: Default::default(),
                source: Default::default(),
            })
        }
    }
}
