//! Job-step documents, build plans and local run state.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Local lifecycle status of a job step or a command.
///
/// Transitions are strictly `Pending -> InProgress -> Finished`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Not started yet. Never sent on the wire.
    Pending,
    /// Running.
    InProgress,
    /// Done, successfully or not.
    Finished,
}

impl Status {
    /// Wire value used in form fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Finished => "finished",
        }
    }

    /// The only status this one may advance to.
    pub fn successor(self) -> Option<Status> {
        match self {
            Self::Pending => Some(Self::InProgress),
            Self::InProgress => Some(Self::Finished),
            Self::Finished => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a job step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStepResult {
    /// No verdict yet.
    Unknown,
    /// Every command exited 0.
    Passed,
    /// A command failed, was cancelled, or the run errored.
    Failed,
    /// Stopped by the server. Only ever received, never reported by the agent.
    Aborted,
    /// Any other value the server may use.
    #[serde(other)]
    Other,
}

impl JobStepResult {
    /// Wire value used in form fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for JobStepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job-step status as the server reports it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    /// Not reported yet.
    Unknown,
    /// Waiting for a worker.
    Queued,
    /// Claimed by a worker.
    InProgress,
    /// Finalized, here or elsewhere.
    Finished,
    /// Any other value the server may use.
    #[serde(other)]
    Other,
}

/// `{"id": ...}` wrapper the server uses for enum-like fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdRef<T> {
    /// Wrapped value.
    pub id: T,
}

/// Repository being built.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Repository {
    /// Clone URL.
    #[serde(default)]
    pub url: String,
    /// Source-control backend, e.g. `git`.
    #[serde(default = "unknown_backend")]
    pub backend: IdRef<String>,
}

fn unknown_backend() -> IdRef<String> {
    IdRef {
        id: "unknown".into(),
    }
}

impl Default for IdRef<String> {
    fn default() -> Self {
        unknown_backend()
    }
}

/// Revision to build.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Revision {
    /// Commit sha or ref.
    pub sha: String,
}

/// Source descriptor: a revision plus an optional patch on top of it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    /// Base revision.
    #[serde(default)]
    pub revision: Option<Revision>,
    /// Patch applied on top, by id.
    #[serde(default)]
    pub patch: Option<IdRef<String>>,
}

/// One shell step of a build plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    /// Server-side command id.
    pub id: String,
    /// Script text. May start with a shebang; `/bin/sh` is used otherwise.
    pub script: String,
    /// Variables layered over the agent's own environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory. Relative paths resolve under the workspace.
    #[serde(default)]
    pub cwd: String,
    /// Glob patterns collected when the command exits 0.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl CommandSpec {
    /// Directory the command runs in.
    pub fn resolve_cwd(&self, workspace: &Path) -> PathBuf {
        if self.cwd.trim().is_empty() {
            return workspace.to_path_buf();
        }
        let cwd = Path::new(&self.cwd);
        if cwd.is_absolute() {
            cwd.to_path_buf()
        } else {
            workspace.join(cwd)
        }
    }
}

/// Job step as served by `GET /jobsteps/{id}/` and the heartbeat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStepDocument {
    /// Job-step id.
    pub id: String,
    /// Commands, in execution order.
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
    /// Server-side result.
    #[serde(default = "unknown_result")]
    pub result: IdRef<JobStepResult>,
    /// Server-side status.
    #[serde(default = "unknown_status")]
    pub status: IdRef<RemoteStatus>,
    /// Repository being built.
    #[serde(default)]
    pub repository: Repository,
    /// Revision and patch being built.
    #[serde(default)]
    pub source: Source,
}

fn unknown_result() -> IdRef<JobStepResult> {
    IdRef {
        id: JobStepResult::Unknown,
    }
}

fn unknown_status() -> IdRef<RemoteStatus> {
    IdRef {
        id: RemoteStatus::Unknown,
    }
}

impl JobStepDocument {
    /// True when the server wants this worker to stop: the step was finalized
    /// elsewhere or explicitly aborted.
    pub fn requests_stop(&self) -> bool {
        self.status.id == RemoteStatus::Finished || self.result.id == JobStepResult::Aborted
    }
}

/// Immutable definition of one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildPlan {
    /// Job step every report refers to.
    pub jobstep_id: String,
    /// Root under which commands run and artifacts are resolved.
    pub workspace: PathBuf,
    /// Repository being built.
    #[serde(default)]
    pub repository: Repository,
    /// Revision and patch being built.
    #[serde(default)]
    pub source: Source,
    /// Commands, in execution order.
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
}

impl BuildPlan {
    /// Builds a plan from a server document and the local workspace root.
    pub fn from_document(doc: JobStepDocument, workspace: impl Into<PathBuf>) -> Self {
        Self {
            jobstep_id: doc.id,
            workspace: workspace.into(),
            repository: doc.repository,
            source: doc.source,
            commands: doc.commands,
        }
    }
}

/// Rejected status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal status transition {from} -> {to}")]
pub struct TransitionError {
    /// Current status.
    pub from: Status,
    /// Requested status.
    pub to: Status,
}

fn advance(current: &mut Status, to: Status) -> Result<(), TransitionError> {
    if current.successor() != Some(to) {
        return Err(TransitionError { from: *current, to });
    }
    *current = to;
    Ok(())
}

/// Execution state of a single command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRun {
    /// Command this state belongs to.
    pub command_id: String,
    status: Status,
    return_code: Option<i32>,
    cancelled: bool,
}

impl CommandRun {
    /// A pending command.
    pub fn new(command_id: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            status: Status::Pending,
            return_code: None,
            cancelled: false,
        }
    }

    /// Current status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Reported return code, once finished.
    pub fn return_code(&self) -> Option<i32> {
        self.return_code
    }

    /// Whether the command was stopped by cancellation.
    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    /// `Pending -> InProgress`.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        advance(&mut self.status, Status::InProgress)
    }

    /// `InProgress -> Finished`, recording how it ended.
    pub fn finish(&mut self, return_code: i32, cancelled: bool) -> Result<(), TransitionError> {
        advance(&mut self.status, Status::Finished)?;
        self.return_code = Some(return_code);
        self.cancelled = cancelled;
        Ok(())
    }
}

/// Overall state of the run on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStepRun {
    /// Job step this state belongs to.
    pub jobstep_id: String,
    /// Worker node name.
    pub node: String,
    status: Status,
    result: JobStepResult,
}

impl JobStepRun {
    /// A pending job step on `node`.
    pub fn new(jobstep_id: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            jobstep_id: jobstep_id.into(),
            node: node.into(),
            status: Status::Pending,
            result: JobStepResult::Unknown,
        }
    }

    /// Current status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Final result; `Unknown` until finished.
    pub fn result(&self) -> JobStepResult {
        self.result
    }

    /// `Pending -> InProgress`.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        advance(&mut self.status, Status::InProgress)
    }

    /// `InProgress -> Finished` with `result`.
    pub fn finish(&mut self, result: JobStepResult) -> Result<(), TransitionError> {
        advance(&mut self.status, Status::Finished)?;
        self.result = result;
        Ok(())
    }
}
