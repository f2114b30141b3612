use async_trait::async_trait;
use jobstep_core::api::Report;

use crate::error::TransportError;
use crate::executor::OutputSink;
use crate::reporter::Reporter;

/// Buffers console output and ships it as `logappend` calls, in order and
/// byte for byte.
pub struct LogTransport {
    reporter: Reporter,
    jobstep_id: String,
    /// Size threshold for an early flush, and the largest chunk per call.
    flush_bytes: usize,
    buffer: Vec<u8>,
}

impl LogTransport {
    pub fn new(reporter: Reporter, jobstep_id: &str, flush_bytes: usize) -> Self {
        Self {
            reporter,
            jobstep_id: jobstep_id.to_string(),
            flush_bytes: flush_bytes.max(1),
            buffer: Vec::new(),
        }
    }

    /// Queue raw process output.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Queue a message from the agent itself.
    pub fn append_str(&mut self, text: &str) {
        self.buffer.extend_from_slice(text.as_bytes());
    }

    /// Output queued but not yet sent.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Send everything queued, split into chunks of at most `flush_bytes`.
    pub async fn flush(&mut self) -> Result<(), TransportError> {
        while !self.buffer.is_empty() {
            let rest = self.buffer.split_off(self.buffer.len().min(self.flush_bytes));
            let chunk = std::mem::replace(&mut self.buffer, rest);
            self.reporter
                .send(Report::console(&self.jobstep_id, chunk))
                .await?;
        }
        Ok(())
    }

    /// Queue `text` and send it right away.
    pub async fn line(&mut self, text: &str) -> Result<(), TransportError> {
        self.append_str(text);
        self.flush().await
    }

    /// Send `report` after all output queued before it.
    pub async fn report(&mut self, report: Report) -> Result<(), TransportError> {
        self.flush().await?;
        self.reporter.send(report).await
    }
}

#[async_trait]
impl OutputSink for LogTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.append(bytes);
        if self.buffer.len() >= self.flush_bytes {
            self.flush().await?;
        }
        Ok(())
    }

    async fn idle(&mut self) -> Result<(), TransportError> {
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use jobstep_core::api::LogAppendForm;

    use super::*;
    use crate::reporter::ReportQueue;
    use crate::transport::testing::RecordingTransport;

    fn texts(reports: &[Report]) -> Vec<Vec<u8>> {
        reports
            .iter()
            .filter_map(|r| match r {
                Report::LogAppend {
                    form: LogAppendForm { text, .. },
                    ..
                } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn flush_preserves_order_and_bytes() {
        let transport = Arc::new(RecordingTransport::default());
        let queue = ReportQueue::spawn(transport.clone());
        let mut logs = LogTransport::new(queue.reporter(), "job_1", 1024);

        logs.append(b"hello ");
        logs.append(b"world\n");
        logs.append_str("exit status 1\n");
        logs.flush().await.unwrap();
        logs.flush().await.unwrap();
        drop(logs);
        queue.close().await;

        assert_eq!(texts(&transport.reports()), vec![b"hello world\nexit status 1\n".to_vec()]);
    }

    #[tokio::test]
    async fn invalid_utf8_is_forwarded_untouched() {
        let transport = Arc::new(RecordingTransport::default());
        let queue = ReportQueue::spawn(transport.clone());
        let mut logs = LogTransport::new(queue.reporter(), "job_1", 1024);

        let snowman = "☃".as_bytes();
        logs.append(&snowman[..1]);
        logs.append(b"a\xffb");
        logs.append(&snowman[1..]);
        assert_eq!(logs.pending(), b"\xe2a\xffb\x98\x83");
        logs.flush().await.unwrap();
        drop(logs);
        queue.close().await;

        assert_eq!(texts(&transport.reports()), vec![b"\xe2a\xffb\x98\x83".to_vec()]);
    }

    #[tokio::test]
    async fn large_output_is_chunked_by_size() {
        let transport = Arc::new(RecordingTransport::default());
        let queue = ReportQueue::spawn(transport.clone());
        let mut logs = LogTransport::new(queue.reporter(), "job_1", 4);

        logs.write("abcdé12".as_bytes()).await.unwrap();
        logs.flush().await.unwrap();
        drop(logs);
        queue.close().await;

        let chunks = texts(&transport.reports());
        assert_eq!(chunks.concat(), "abcdé12".as_bytes());
        assert!(chunks.iter().all(|c| c.len() <= 4));
    }

    #[tokio::test]
    async fn report_waits_for_queued_output() {
        let transport = Arc::new(RecordingTransport::default());
        let queue = ReportQueue::spawn(transport.clone());
        let mut logs = LogTransport::new(queue.reporter(), "job_1", 1024);

        logs.append(b"built\n");
        logs.report(Report::command_finished("cmd_1", 0)).await.unwrap();
        drop(logs);
        queue.close().await;

        assert_eq!(
            transport.reports(),
            vec![
                Report::console("job_1", "built\n"),
                Report::command_finished("cmd_1", 0),
            ]
        );
    }
}
