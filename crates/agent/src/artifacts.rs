//! Resolves a command's artifact patterns under the workspace and uploads
//! the matching files.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use jobstep_core::api::{ArtifactUpload, Report};

use crate::error::AgentError;
use crate::logs::LogTransport;

/// Files matched by one command's patterns.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Collection {
    /// Pattern order, each pattern's matches sorted, no duplicates.
    pub files: Vec<PathBuf>,
    /// Patterns that failed to compile, with the parser's message.
    pub invalid: Vec<(String, String)>,
}

pub fn collect(patterns: &[String], root: &Path) -> Collection {
    let options = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };
    let escaped_root = glob::Pattern::escape(&root.to_string_lossy());

    let mut collection = Collection::default();
    let mut seen = HashSet::new();
    for pattern in patterns {
        // Every pattern is relative to the root, even one with a leading '/'.
        let full = format!(
            "{}/{}",
            escaped_root.trim_end_matches('/'),
            pattern.trim_start_matches('/')
        );
        let paths = match glob::glob_with(&full, options) {
            Ok(paths) => paths,
            Err(e) => {
                collection.invalid.push((pattern.clone(), e.msg.to_string()));
                continue;
            }
        };
        let mut matched: Vec<PathBuf> = paths
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    tracing::debug!(%pattern, error = %e, "skipping unreadable path");
                    None
                }
            })
            .filter(|path| path.is_file())
            .collect();
        matched.sort();
        for path in matched {
            if seen.insert(path.clone()) {
                collection.files.push(path);
            }
        }
    }
    collection
}

/// Read one file for upload under its base name.
pub async fn read_upload(path: &Path) -> Result<ArtifactUpload, AgentError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| AgentError::Artifact {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(ArtifactUpload { name, bytes })
}

/// Upload every collected file, one at a time, behind any queued output.
pub async fn upload(
    logs: &mut LogTransport,
    jobstep_id: &str,
    collection: &Collection,
) -> Result<(), AgentError> {
    for path in &collection.files {
        let upload = read_upload(path).await?;
        tracing::info!(job_step_id = %jobstep_id, artifact = %upload.name, bytes = upload.bytes.len(), "uploading artifact");
        logs.report(Report::Artifact {
            jobstep_id: jobstep_id.to_string(),
            upload,
        })
        .await?;
    }
    Ok(())
}
