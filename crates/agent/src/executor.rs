use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use jobstep_core::CommandSpec;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tempfile::TempPath;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::cancel::CancelSignal;
use crate::error::{AgentError, TransportError};

/// Return code reported for any failed command that was not cancelled.
pub const FAILURE_RETURN_CODE: i32 = 255;
/// Return code reported for a command stopped by cancellation.
pub const CANCELLED_RETURN_CODE: i32 = -1;

// Redirect the shell's stderr into stdout, then replace the shell with the
// interpreter so signals reach it directly.
const MERGE_AND_EXEC: &str = "exec 2>&1\nexec \"$@\"";
const DEFAULT_INTERPRETER: &str = "/bin/sh";
const READ_BUF: usize = 8 * 1024;

/// Destination of a command's combined output.
#[async_trait]
pub trait OutputSink: Send {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Called every flush interval while the command runs.
    async fn idle(&mut self) -> Result<(), TransportError>;
}

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(i32),
    Cancelled,
}

impl ExitOutcome {
    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(signal)) => Self::Signaled(signal),
            (None, None) => Self::Exited(FAILURE_RETURN_CODE),
        }
    }

    pub fn success(self) -> bool {
        self == Self::Exited(0)
    }

    /// Value sent as `return_code`.
    pub fn reported_code(self) -> i32 {
        match self {
            Self::Exited(0) => 0,
            Self::Exited(_) | Self::Signaled(_) => FAILURE_RETURN_CODE,
            Self::Cancelled => CANCELLED_RETURN_CODE,
        }
    }

    /// Console line for a failed command.
    pub fn describe(self) -> String {
        match self {
            Self::Exited(code) => format!("exit status {code}\n"),
            Self::Signaled(signal) => format!("terminated by signal {signal}\n"),
            Self::Cancelled => "command cancelled\n".to_string(),
        }
    }
}

/// Runs one command as a subprocess.
#[derive(Debug, Clone)]
pub struct Executor {
    /// Time between SIGTERM and SIGKILL on cancellation.
    pub kill_grace: Duration,
    /// How often the sink gets an `idle` call.
    pub flush_interval: Duration,
}

impl Executor {
    pub async fn execute<S: OutputSink + ?Sized>(
        &self,
        spec: &CommandSpec,
        workspace: &Path,
        sink: &mut S,
        cancel: &mut CancelSignal,
    ) -> Result<ExitOutcome, AgentError> {
        let spawn_err = |source| AgentError::Spawn {
            command_id: spec.id.clone(),
            source,
        };
        let process_err = |context, source| AgentError::Process {
            command_id: spec.id.clone(),
            context,
            source,
        };

        // Removed when this guard drops, on every return path below.
        let script = write_script(&spec.script).map_err(spawn_err)?;
        let cwd = spec.resolve_cwd(workspace);

        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(MERGE_AND_EXEC)
            .arg("jobstep")
            .args(interpreter(&spec.script))
            .arg(&*script)
            .current_dir(&cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        tracing::debug!(command_id = %spec.id, cwd = %cwd.display(), pid = ?child.id(), "spawned command");

        let mut stdout = child.stdout.take().ok_or_else(|| {
            process_err(
                "capturing output",
                std::io::Error::other("stdout was not piped"),
            )
        })?;

        let mut buf = vec![0u8; READ_BUF];
        let mut ticker = interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut eof = false;
        let finished = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(command_id = %spec.id, "cancellation requested; terminating command");
                    self.terminate(&mut child, &spec.id).await;
                    return Ok(ExitOutcome::Cancelled);
                }
                read = stdout.read(&mut buf), if !eof => match read {
                    Ok(0) => eof = true,
                    Ok(n) => {
                        if let Err(e) = sink.write(&buf[..n]).await {
                            break Err(e.into());
                        }
                    }
                    Err(e) => break Err(process_err("reading output", e)),
                },
                status = child.wait(), if eof => {
                    break status.map_err(|e| process_err("waiting for exit", e));
                }
                _ = ticker.tick() => {
                    if let Err(e) = sink.idle().await {
                        break Err(e.into());
                    }
                }
            }
        };

        match finished {
            Ok(status) => Ok(ExitOutcome::from_status(status)),
            Err(e) => {
                tracing::warn!(command_id = %spec.id, error = %e, "command aborted; terminating");
                self.terminate(&mut child, &spec.id).await;
                Err(e)
            }
        }
    }

    /// SIGTERM the command's process group, SIGKILL it after the grace period.
    async fn terminate(&self, child: &mut Child, command_id: &str) {
        let Some(pid) = child.id() else {
            // Already reaped.
            return;
        };
        let group = Pid::from_raw(pid as i32);
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            tracing::warn!(%command_id, error = %e, "SIGTERM failed");
        }
        if timeout(self.kill_grace, child.wait()).await.is_err() {
            tracing::warn!(%command_id, grace = ?self.kill_grace, "command ignored SIGTERM; killing");
        }
        // Sweep anything left in the group, including the leader.
        let _ = killpg(group, Signal::SIGKILL);
        if let Err(e) = child.wait().await {
            tracing::warn!(%command_id, error = %e, "failed to reap command");
        }
    }
}

/// Interpreter and optional argument from the script's `#!` line.
///
/// The script file is passed to the interpreter rather than executed, so it
/// never needs the exec bit.
fn interpreter(script: &str) -> Vec<String> {
    let line = script
        .strip_prefix("#!")
        .and_then(|rest| rest.lines().next())
        .map(str::trim)
        .unwrap_or_default();
    if line.is_empty() {
        return vec![DEFAULT_INTERPRETER.to_string()];
    }
    match line.split_once(char::is_whitespace) {
        Some((path, arg)) => vec![path.to_string(), arg.trim().to_string()],
        None => vec![line.to_string()],
    }
}

fn write_script(script: &str) -> std::io::Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix("jobstep-")
        .suffix(".sh")
        .tempfile()?;
    file.write_all(script.as_bytes())?;
    file.flush()?;
    Ok(file.into_temp_path())
}
