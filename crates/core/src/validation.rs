//! Parsing and checking of build plans.

use std::collections::HashSet;

use crate::model::{BuildPlan, JobStepDocument};

/// A build plan that cannot be executed. Fatal before any command runs.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// The document did not parse.
    #[error("job-step document is not valid JSON: {0}")]
    Document(#[from] serde_json::Error),
    /// The plan has no job-step id.
    #[error("job-step id must not be empty")]
    EmptyJobStepId,
    /// The plan has no workspace directory.
    #[error("workspace must not be empty")]
    EmptyWorkspace,
    /// A command has no id.
    #[error("cmd[{index}]: command id must not be empty")]
    EmptyCommandId {
        /// Position in the command list.
        index: usize,
    },
    /// An id is not a single plain path segment.
    #[error("id '{id}' cannot be used in a URL path")]
    UnsafeId {
        /// The offending id.
        id: String,
    },
    /// Two commands share an id.
    #[error("cmd[{index}]: duplicate command id '{id}'")]
    DuplicateCommandId {
        /// Position of the second occurrence.
        index: usize,
        /// The repeated id.
        id: String,
    },
}

/// Parses the server's job-step JSON.
pub fn parse_document(bytes: &[u8]) -> Result<JobStepDocument, PlanError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Checks a plan before execution.
///
/// Ids are interpolated into endpoint paths, so they must be single, plain
/// path segments. An empty command list and an empty script are valid.
pub fn validate_plan(plan: &BuildPlan) -> Result<(), PlanError> {
    if plan.jobstep_id.trim().is_empty() {
        return Err(PlanError::EmptyJobStepId);
    }
    check_path_segment(&plan.jobstep_id)?;

    if plan.workspace.as_os_str().is_empty() {
        return Err(PlanError::EmptyWorkspace);
    }

    let mut seen = HashSet::new();
    for (index, cmd) in plan.commands.iter().enumerate() {
        if cmd.id.trim().is_empty() {
            return Err(PlanError::EmptyCommandId { index });
        }
        check_path_segment(&cmd.id)?;
        if !seen.insert(cmd.id.as_str()) {
            return Err(PlanError::DuplicateCommandId {
                index,
                id: cmd.id.clone(),
            });
        }
    }

    Ok(())
}

fn check_path_segment(id: &str) -> Result<(), PlanError> {
    let unsafe_char = |c: char| matches!(c, '/' | '\\' | '?' | '#' | '%') || c.is_whitespace();
    if id == "." || id == ".." || id.chars().any(unsafe_char) {
        return Err(PlanError::UnsafeId { id: id.to_string() });
    }
    Ok(())
}
