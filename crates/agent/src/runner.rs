//! Runs a build plan end to end.
//!
//! The command pipeline is sequential. It shares only a one-way
//! cancellation signal with the heartbeat monitor, and sends every status,
//! log and artifact call through one ordered [`ReportQueue`].

use std::sync::Arc;

use jobstep_core::api::Report;
use jobstep_core::model::{CommandRun, JobStepRun};
use jobstep_core::{validate_plan, BuildPlan, CommandSpec, JobStepResult};

use crate::artifacts;
use crate::cancel::{cancel_pair, CancelSignal};
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::executor::{ExitOutcome, Executor, FAILURE_RETURN_CODE};
use crate::heartbeat::HeartbeatMonitor;
use crate::logs::LogTransport;
use crate::reporter::ReportQueue;
use crate::transport::Transport;

/// What happened during a run that got past plan validation.
#[derive(Debug)]
pub struct RunOutcome {
    /// Result reported with the final job-step status.
    pub result: JobStepResult,
    /// Commands that were started, in order.
    pub commands: Vec<CommandRun>,
    /// First unrecoverable error, if the run was aborted by one.
    pub error: Option<AgentError>,
}

impl RunOutcome {
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.result == JobStepResult::Passed
    }
}

pub struct Runner {
    transport: Arc<dyn Transport>,
    config: AgentConfig,
}

impl Runner {
    pub fn new(transport: Arc<dyn Transport>, config: AgentConfig) -> Self {
        Self { transport, config }
    }

    /// Run `plan` and report it. An invalid plan is returned as an error
    /// before anything is reported; every other failure ends up in
    /// [`RunOutcome::error`] after the final job-step report was attempted.
    pub async fn run(&self, plan: &BuildPlan) -> Result<RunOutcome, AgentError> {
        validate_plan(plan)?;

        let node = self.config.node_name();
        let mut job = JobStepRun::new(&plan.jobstep_id, &node);
        job.start()?;
        tracing::info!(job_step_id = %plan.jobstep_id, %node, commands = plan.commands.len(), "starting build plan");

        let queue = ReportQueue::spawn(Arc::clone(&self.transport));
        let mut logs = LogTransport::new(
            queue.reporter(),
            &plan.jobstep_id,
            self.config.log_flush_bytes,
        );

        let mut commands = Vec::new();
        let mut error = None;
        let mut result = JobStepResult::Failed;

        match logs
            .report(Report::jobstep_started(&plan.jobstep_id, &node))
            .await
        {
            Ok(()) => {
                let (trigger, cancel) = cancel_pair();
                let monitor = HeartbeatMonitor::new(
                    Arc::clone(&self.transport),
                    &plan.jobstep_id,
                    self.config.heartbeat_interval,
                )
                .spawn(trigger);

                match self.run_commands(plan, &mut logs, cancel, &mut commands).await {
                    Ok(r) => result = r,
                    Err(e) => error = Some(e),
                }

                let exit = monitor.stop().await;
                tracing::debug!(job_step_id = %plan.jobstep_id, ?exit, "heartbeat monitor stopped");
            }
            Err(e) => error = Some(e.into()),
        }

        job.finish(result)?;
        let finished = logs
            .report(Report::jobstep_finished(&plan.jobstep_id, result, &node))
            .await;
        drop(logs);
        queue.close().await;

        if let Err(e) = finished {
            match &error {
                None => error = Some(e.into()),
                Some(first) => {
                    tracing::warn!(job_step_id = %plan.jobstep_id, error = %e, first = %first, "final report failed")
                }
            }
        }

        match &error {
            None => tracing::info!(job_step_id = %plan.jobstep_id, %result, "build plan finished"),
            Some(e) => tracing::error!(job_step_id = %plan.jobstep_id, %result, error = %e, "build plan aborted"),
        }

        Ok(RunOutcome {
            result,
            commands,
            error,
        })
    }

    async fn run_commands(
        &self,
        plan: &BuildPlan,
        logs: &mut LogTransport,
        mut cancel: CancelSignal,
        runs: &mut Vec<CommandRun>,
    ) -> Result<JobStepResult, AgentError> {
        let executor = Executor {
            kill_grace: self.config.kill_grace,
            flush_interval: self.config.log_flush_interval,
        };

        for spec in &plan.commands {
            if cancel.is_cancelled() {
                tracing::info!(job_step_id = %plan.jobstep_id, command_id = %spec.id, "cancelled before command start");
                logs.line(&ExitOutcome::Cancelled.describe()).await?;
                return Ok(JobStepResult::Failed);
            }

            let mut run = CommandRun::new(&spec.id);
            run.start()?;
            logs.report(Report::command_started(&spec.id)).await?;
            tracing::info!(job_step_id = %plan.jobstep_id, command_id = %spec.id, "running command");
            logs.line(&format!(">> {}\n", spec.id)).await?;

            let outcome = executor
                .execute(spec, &plan.workspace, logs, &mut cancel)
                .await;

            let (code, failure) = match outcome {
                Ok(exit) if exit.success() => (0, None),
                Ok(exit) => (exit.reported_code(), Some((exit.describe(), exit == ExitOutcome::Cancelled))),
                Err(e) if e.is_process_failure() => (FAILURE_RETURN_CODE, Some((format!("{e}\n"), false))),
                Err(e) => {
                    runs.push(run);
                    return Err(e);
                }
            };

            let cancelled = failure.as_ref().is_some_and(|(_, cancelled)| *cancelled);
            run.finish(code, cancelled)?;
            runs.push(run);
            logs.report(Report::command_finished(&spec.id, code)).await?;

            if let Some((line, _)) = failure {
                tracing::warn!(
                    job_step_id = %plan.jobstep_id,
                    command_id = %spec.id,
                    return_code = code,
                    reason = line.trim_end(),
                    "command failed"
                );
                logs.append_str(&line);
                logs.append_str("skipping artifact collection\n");
                logs.flush().await?;
                return Ok(JobStepResult::Failed);
            }

            self.collect_artifacts(plan, spec, logs).await?;
        }

        Ok(JobStepResult::Passed)
    }

    async fn collect_artifacts(
        &self,
        plan: &BuildPlan,
        spec: &CommandSpec,
        logs: &mut LogTransport,
    ) -> Result<(), AgentError> {
        logs.append_str("collecting artifacts\n");
        let collection = artifacts::collect(&spec.artifacts, &plan.workspace);
        for (pattern, message) in &collection.invalid {
            tracing::warn!(command_id = %spec.id, %pattern, %message, "invalid artifact pattern");
            logs.append_str(&format!("invalid artifact pattern {pattern:?}: {message}\n"));
        }
        logs.append_str(&format!("found {} artifact(s)\n", collection.files.len()));
        logs.flush().await?;

        artifacts::upload(logs, &plan.jobstep_id, &collection).await
    }
}
