use std::time::Duration;

use crate::transport::RetryPolicy;

/// Runtime settings for one agent run.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_url: String,

    pub heartbeat_interval: Duration,
    /// Buffered console output that triggers an early flush.
    pub log_flush_bytes: usize,
    pub log_flush_interval: Duration,
    /// SIGTERM to SIGKILL grace on cancellation.
    pub kill_grace: Duration,

    pub retry: RetryPolicy,
    /// Reported node name. Defaults to the host name.
    pub node: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000/api/0".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            log_flush_bytes: 4096,
            log_flush_interval: Duration::from_millis(500),
            kill_grace: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            node: None,
        }
    }
}

impl AgentConfig {
    pub fn node_name(&self) -> String {
        match &self.node {
            Some(node) => node.clone(),
            None => host_name(),
        }
    }
}

fn host_name() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "cannot resolve host name");
            "unknown".to_string()
        }
    }
}
