use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::cancel::CancelTrigger;
use crate::transport::Transport;

/// Why the monitor task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    Stopped,
    /// The server asked for the run to stop and the cancellation was raised.
    Cancelled,
}

/// Periodic heartbeat, independent of command progress.
pub struct HeartbeatMonitor {
    transport: Arc<dyn Transport>,
    jobstep_id: String,
    interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(transport: Arc<dyn Transport>, jobstep_id: &str, interval: Duration) -> Self {
        Self {
            transport,
            jobstep_id: jobstep_id.to_string(),
            interval,
        }
    }

    pub fn spawn(self, trigger: CancelTrigger) -> MonitorHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(trigger, stop_rx));
        MonitorHandle { stop_tx, task }
    }

    async fn run(self, trigger: CancelTrigger, mut stop_rx: watch::Receiver<bool>) -> MonitorExit {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => return MonitorExit::Stopped,
                _ = ticker.tick() => {}
            }

            let beat = tokio::select! {
                biased;
                _ = stop_rx.changed() => return MonitorExit::Stopped,
                beat = self.transport.heartbeat(&self.jobstep_id) => beat,
            };

            match beat {
                Ok(doc) if doc.requests_stop() => {
                    tracing::info!(
                        job_step_id = %self.jobstep_id,
                        status = ?doc.status.id,
                        result = %doc.result.id,
                        "server requested stop"
                    );
                    trigger.fire();
                    return MonitorExit::Cancelled;
                }
                Ok(_) => tracing::trace!(job_step_id = %self.jobstep_id, "heartbeat ok"),
                Err(e) => tracing::warn!(job_step_id = %self.jobstep_id, error = %e, "heartbeat failed"),
            }
        }
    }
}

pub struct MonitorHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<MonitorExit>,
}

impl MonitorHandle {
    /// Ask the monitor to stop and wait for it.
    pub async fn stop(self) -> MonitorExit {
        let _ = self.stop_tx.send(true);
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                tracing::warn!(error = %e, "heartbeat task panicked");
                MonitorExit::Stopped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::transport::testing::RecordingTransport;

    #[tokio::test]
    async fn finished_job_step_raises_cancellation_once() {
        let transport = Arc::new(RecordingTransport {
            finish_at_heartbeat: Some(3),
            ..Default::default()
        });
        let (trigger, mut signal) = cancel_pair();

        let handle = HeartbeatMonitor::new(transport.clone(), "job_1", Duration::from_millis(10))
            .spawn(trigger);
        signal.cancelled().await;

        assert_eq!(handle.stop().await, MonitorExit::Cancelled);
        assert!(signal.is_cancelled());
        assert_eq!(transport.heartbeat_count(), 3);
    }

    #[tokio::test]
    async fn stops_when_asked() {
        let transport = Arc::new(RecordingTransport::default());
        let (trigger, signal) = cancel_pair();

        let handle = HeartbeatMonitor::new(transport.clone(), "job_1", Duration::from_millis(10))
            .spawn(trigger);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(handle.stop().await, MonitorExit::Stopped);
        assert!(!signal.is_cancelled());
        assert!(transport.heartbeat_count() >= 1);
        assert!(transport.reports().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_errors_do_not_stop_the_monitor() {
        struct Flaky(std::sync::Mutex<u32>);

        #[async_trait::async_trait]
        impl Transport for Flaky {
            async fn send(&self, _: &jobstep_core::api::Report) -> Result<(), crate::TransportError> {
                Ok(())
            }

            async fn heartbeat(
                &self,
                jobstep_id: &str,
            ) -> Result<jobstep_core::JobStepDocument, crate::TransportError> {
                let mut n = self.0.lock().unwrap();
                *n += 1;
                if *n < 3 {
                    return Err(crate::TransportError::Status {
                        method: "POST",
                        path: jobstep_core::api::heartbeat_path(jobstep_id),
                        status: reqwest::StatusCode::BAD_GATEWAY,
                    });
                }
                let body = format!(r#"{{"id": "{jobstep_id}", "status": {{"id": "finished"}}}}"#);
                Ok(serde_json::from_str(&body).unwrap())
            }
        }

        let (trigger, mut signal) = cancel_pair();
        let handle = HeartbeatMonitor::new(
            Arc::new(Flaky(std::sync::Mutex::new(0))),
            "job_1",
            Duration::from_millis(5),
        )
        .spawn(trigger);
        signal.cancelled().await;

        assert_eq!(handle.stop().await, MonitorExit::Cancelled);
    }
}
