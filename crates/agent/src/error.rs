use std::path::PathBuf;

use jobstep_core::model::TransitionError;
use jobstep_core::PlanError;

/// A reporting call that failed after the transport's own retries.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{method} {path}: {source}")]
    Http {
        method: &'static str,
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{method} {path}: server returned {status}")]
    Status {
        method: &'static str,
        path: String,
        status: reqwest::StatusCode,
    },
    #[error("{path}: response is not a job-step document: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("report queue is closed")]
    QueueClosed,
}

impl TransportError {
    /// Connection problems, 5xx and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { .. } => true,
            Self::Status { status, .. } => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            Self::Decode { .. } | Self::QueueClosed => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("failed to start command: {source}")]
    Spawn {
        command_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}: {source}")]
    Process {
        command_id: String,
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("reading artifact {}: {source}", path.display())]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AgentError {
    /// Errors that fail the current command instead of the whole run.
    pub fn is_process_failure(&self) -> bool {
        matches!(self, Self::Spawn { .. } | Self::Process { .. })
    }
}
