//! Single ordered channel for every status, log and artifact call.
//!
//! Reports are delivered by one dispatcher task in the order they were
//! submitted. Each submission gets its own reply, so the caller sees the
//! result of exactly the call it made.

use std::sync::Arc;

use jobstep_core::api::Report;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::transport::Transport;

const QUEUE_DEPTH: usize = 64;

struct Envelope {
    report: Report,
    reply: oneshot::Sender<Result<(), TransportError>>,
}

/// Owner of the dispatcher task.
pub struct ReportQueue {
    reporter: Reporter,
    task: JoinHandle<()>,
}

impl ReportQueue {
    pub fn spawn(transport: Arc<dyn Transport>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Envelope>(QUEUE_DEPTH);
        let task = tokio::spawn(async move {
            while let Some(Envelope { report, reply }) = rx.recv().await {
                let result = transport.send(&report).await;
                if let Err(e) = &result {
                    tracing::warn!(path = %report.path(), error = %e, "report failed");
                }
                // The submitter may have given up waiting; nothing to do then.
                let _ = reply.send(result);
            }
        });
        Self {
            reporter: Reporter { tx },
            task,
        }
    }

    pub fn reporter(&self) -> Reporter {
        self.reporter.clone()
    }

    /// Drain outstanding reports and stop the dispatcher. Outstanding
    /// `Reporter` clones must be dropped first or this waits for them.
    pub async fn close(self) {
        drop(self.reporter);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "report dispatcher panicked");
        }
    }
}

/// Submission handle.
#[derive(Clone)]
pub struct Reporter {
    tx: mpsc::Sender<Envelope>,
}

impl Reporter {
    /// Queue a report and wait for its delivery result.
    pub async fn send(&self, report: Report) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope { report, reply })
            .await
            .map_err(|_| TransportError::QueueClosed)?;
        rx.await.map_err(|_| TransportError::QueueClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;

    #[tokio::test]
    async fn delivers_in_submission_order() {
        let transport = Arc::new(RecordingTransport::default());
        let queue = ReportQueue::spawn(transport.clone());
        let reporter = queue.reporter();

        reporter.send(Report::jobstep_started("job_1", "n")).await.unwrap();
        reporter.send(Report::command_started("cmd_1")).await.unwrap();
        reporter.send(Report::console("job_1", "out")).await.unwrap();
        drop(reporter);
        queue.close().await;

        assert_eq!(
            transport.reports(),
            vec![
                Report::jobstep_started("job_1", "n"),
                Report::command_started("cmd_1"),
                Report::console("job_1", "out"),
            ]
        );
    }

    #[tokio::test]
    async fn failures_come_back_to_the_caller() {
        let transport = Arc::new(RecordingTransport {
            fail_sends: true,
            ..Default::default()
        });
        let queue = ReportQueue::spawn(transport);
        let err = queue
            .reporter()
            .send(Report::command_started("cmd_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Status { .. }));
        queue.close().await;
    }
}
