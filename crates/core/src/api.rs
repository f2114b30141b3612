//! Typed request schemas, one per server endpoint.

use serde::{Deserialize, Serialize};

use crate::model::{JobStepResult, Status};

/// `POST /jobsteps/{id}/`
pub fn jobstep_path(jobstep_id: &str) -> String {
    format!("/jobsteps/{jobstep_id}/")
}

/// `POST /jobsteps/{id}/heartbeat/`
pub fn heartbeat_path(jobstep_id: &str) -> String {
    format!("/jobsteps/{jobstep_id}/heartbeat/")
}

/// `POST /jobsteps/{id}/logappend/`
pub fn logappend_path(jobstep_id: &str) -> String {
    format!("/jobsteps/{jobstep_id}/logappend/")
}

/// `POST /jobsteps/{id}/artifacts/`
pub fn artifacts_path(jobstep_id: &str) -> String {
    format!("/jobsteps/{jobstep_id}/artifacts/")
}

/// `POST /commands/{id}/`
pub fn command_path(command_id: &str) -> String {
    format!("/commands/{command_id}/")
}

/// Job-step status update form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStepStatusForm {
    /// `in_progress` or `finished`.
    pub status: Status,
    /// Only sent with `finished`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobStepResult>,
    /// Worker node name.
    pub node: String,
}

/// Command status update form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandStatusForm {
    /// `in_progress` or `finished`.
    pub status: Status,
    /// Only sent with `finished`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
}

/// Origin tag of a log chunk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    /// Combined command output and agent messages.
    Console,
}

impl LogSource {
    /// Wire value used in form fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Console => "console",
        }
    }
}

/// Log append form.
///
/// `text` is raw process output and need not be UTF-8, so the form is
/// encoded by hand instead of through serde.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogAppendForm {
    /// Output bytes, exactly as produced.
    pub text: Vec<u8>,
    /// Stream the bytes belong to.
    pub source: LogSource,
}

impl LogAppendForm {
    /// `application/x-www-form-urlencoded` body with every byte of `text`
    /// percent-encoded as is.
    pub fn to_urlencoded(&self) -> String {
        let mut body = String::from("text=");
        body.extend(url::form_urlencoded::byte_serialize(&self.text));
        body.push_str("&source=");
        body.push_str(self.source.as_str());
        body
    }
}

/// One file upload, sent as multipart: a `name` field plus a `file` part.
#[derive(Clone, PartialEq, Eq)]
pub struct ArtifactUpload {
    /// Base file name.
    pub name: String,
    /// File contents.
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for ArtifactUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactUpload")
            .field("name", &self.name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Every call the pipeline makes to the server, in one type so the calls can
/// share a single ordered queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    /// `POST /jobsteps/{id}/`
    JobStepStatus {
        /// Target job step.
        jobstep_id: String,
        /// Form body.
        form: JobStepStatusForm,
    },
    /// `POST /commands/{id}/`
    CommandStatus {
        /// Target command.
        command_id: String,
        /// Form body.
        form: CommandStatusForm,
    },
    /// `POST /jobsteps/{id}/logappend/`
    LogAppend {
        /// Target job step.
        jobstep_id: String,
        /// Form body.
        form: LogAppendForm,
    },
    /// `POST /jobsteps/{id}/artifacts/`
    Artifact {
        /// Target job step.
        jobstep_id: String,
        /// Multipart body.
        upload: ArtifactUpload,
    },
}

impl Report {
    /// Job step is running on `node`.
    pub fn jobstep_started(jobstep_id: &str, node: &str) -> Self {
        Self::JobStepStatus {
            jobstep_id: jobstep_id.to_string(),
            form: JobStepStatusForm {
                status: Status::InProgress,
                result: None,
                node: node.to_string(),
            },
        }
    }

    /// Job step is done with `result`.
    pub fn jobstep_finished(jobstep_id: &str, result: JobStepResult, node: &str) -> Self {
        Self::JobStepStatus {
            jobstep_id: jobstep_id.to_string(),
            form: JobStepStatusForm {
                status: Status::Finished,
                result: Some(result),
                node: node.to_string(),
            },
        }
    }

    /// Command is running.
    pub fn command_started(command_id: &str) -> Self {
        Self::CommandStatus {
            command_id: command_id.to_string(),
            form: CommandStatusForm {
                status: Status::InProgress,
                return_code: None,
            },
        }
    }

    /// Command is done with `return_code`.
    pub fn command_finished(command_id: &str, return_code: i32) -> Self {
        Self::CommandStatus {
            command_id: command_id.to_string(),
            form: CommandStatusForm {
                status: Status::Finished,
                return_code: Some(return_code),
            },
        }
    }

    /// Console output chunk.
    pub fn console(jobstep_id: &str, text: impl Into<Vec<u8>>) -> Self {
        Self::LogAppend {
            jobstep_id: jobstep_id.to_string(),
            form: LogAppendForm {
                text: text.into(),
                source: LogSource::Console,
            },
        }
    }

    /// Server path this report is posted to.
    pub fn path(&self) -> String {
        match self {
            Self::JobStepStatus { jobstep_id, .. } => jobstep_path(jobstep_id),
            Self::CommandStatus { command_id, .. } => command_path(command_id),
            Self::LogAppend { jobstep_id, .. } => logappend_path(jobstep_id),
            Self::Artifact { jobstep_id, .. } => artifacts_path(jobstep_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_parameterized() {
        assert_eq!(jobstep_path("job_1"), "/jobsteps/job_1/");
        assert_eq!(heartbeat_path("job_1"), "/jobsteps/job_1/heartbeat/");
        assert_eq!(command_path("cmd_1"), "/commands/cmd_1/");
        assert_eq!(
            Report::console("job_1", "x").path(),
            "/jobsteps/job_1/logappend/"
        );
    }

    #[test]
    fn finished_status_carries_result() {
        let Report::JobStepStatus { form, .. } =
            Report::jobstep_finished("job_1", JobStepResult::Failed, "host")
        else {
            panic!("expected a job-step status report");
        };
        assert_eq!(form.status, Status::Finished);
        assert_eq!(form.result, Some(JobStepResult::Failed));
        assert_eq!(form.node, "host");
    }

    #[test]
    fn log_form_keeps_every_byte() {
        let form = LogAppendForm {
            text: b"a\xffb c&d=\n".to_vec(),
            source: LogSource::Console,
        };
        assert_eq!(form.to_urlencoded(), "text=a%FFb+c%26d%3D%0A&source=console");
    }
}
