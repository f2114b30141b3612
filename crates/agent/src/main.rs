#![forbid(unsafe_code)]

//! Job-step agent: runs one build plan and reports it to the server.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use jobstep_agent::{AgentConfig, HttpTransport, RetryPolicy, Runner};
use jobstep_core::validation::parse_document;
use jobstep_core::BuildPlan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "jobstep-agent", version)]
struct Args {
    /// Server base URL, e.g. http://127.0.0.1:5000/api/0
    #[arg(long)]
    server: String,

    /// Job step to run.
    #[arg(long)]
    jobstep_id: String,

    /// Job-step JSON document. Fetched from the server when omitted.
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Workspace root for commands and artifacts.
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Node name reported to the server. Defaults to the host name.
    #[arg(long)]
    node: Option<String>,

    /// Heartbeat interval in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    heartbeat_ms: u64,

    /// Console flush interval in milliseconds.
    #[arg(long, default_value_t = 500)]
    log_flush_ms: u64,

    /// Buffered console bytes that force a flush.
    #[arg(long, default_value_t = 4096)]
    log_flush_bytes: usize,

    /// Grace period between SIGTERM and SIGKILL on cancellation.
    #[arg(long, default_value_t = 10_000)]
    kill_grace_ms: u64,

    /// Attempts per server call, including the first.
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,

    /// Log level (env-filter syntax).
    #[arg(long, default_value = "info")]
    log: String,
}

impl Args {
    fn config(&self) -> AgentConfig {
        AgentConfig {
            server_url: self.server.clone(),
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            log_flush_bytes: self.log_flush_bytes,
            log_flush_interval: Duration::from_millis(self.log_flush_ms),
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                ..RetryPolicy::default()
            },
            node: self.node.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!(error = ?e, "agent failed");
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<bool> {
    let config = args.config();
    let transport = Arc::new(HttpTransport::new(&config.server_url, config.retry));

    let doc = match &args.plan {
        Some(path) => {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading plan {}", path.display()))?;
            parse_document(&bytes).with_context(|| format!("parsing plan {}", path.display()))?
        }
        None => transport
            .fetch_document(&args.jobstep_id)
            .await
            .context("fetching job step")?,
    };
    if doc.id != args.jobstep_id {
        anyhow::bail!(
            "plan is for job step '{}', expected '{}'",
            doc.id,
            args.jobstep_id
        );
    }

    let plan = BuildPlan::from_document(doc, &args.workspace);
    let outcome = Runner::new(transport, config)
        .run(&plan)
        .await
        .context("invalid build plan")?;

    if let Some(e) = outcome.error {
        return Err(anyhow::Error::new(e).context("build plan aborted"));
    }
    Ok(outcome.result == jobstep_core::JobStepResult::Passed)
}
