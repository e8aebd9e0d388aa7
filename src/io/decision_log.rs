//! Decision egress - writes resolved plate decisions to file
//!
//! Decisions are written in JSONL format (one JSON object per line) by a
//! dedicated task, so the supervisor never waits on disk I/O.

use crate::domain::decision::DecisionRecord;
use crate::infra::metrics::Metrics;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Non-blocking handle used by the supervisor
#[derive(Clone)]
pub struct DecisionSender {
    tx: mpsc::Sender<DecisionRecord>,
    metrics: Arc<Metrics>,
}

impl DecisionSender {
    /// Enqueue a record; a full queue drops it rather than stall the gate
    pub fn send(&self, record: DecisionRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                self.metrics.record_decision_dropped();
                warn!(id = %record.id, plate = %record.plate, "decision_egress_queue_full");
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                self.metrics.record_decision_dropped();
                warn!(id = %record.id, "decision_egress_closed");
            }
        }
    }
}

/// Egress writer for decisions
pub struct DecisionLog {
    file_path: PathBuf,
    rx: mpsc::Receiver<DecisionRecord>,
}

/// Create the egress channel and its writer
pub fn create_decision_log(
    file_path: impl Into<PathBuf>,
    buffer_size: usize,
    metrics: Arc<Metrics>,
) -> (DecisionSender, DecisionLog) {
    let (tx, rx) = mpsc::channel(buffer_size);
    let file_path = file_path.into();
    info!(file_path = %file_path.display(), "decision_egress_initialized");
    (DecisionSender { tx, metrics }, DecisionLog { file_path, rx })
}

impl DecisionLog {
    /// Write records until every sender is dropped
    pub async fn run(mut self) {
        while let Some(record) = self.rx.recv().await {
            let json = record.to_json();
            match append_line(&self.file_path, &json).await {
                Ok(()) => {
                    debug!(id = %record.id, outcome = %record.outcome, "decision_egressed");
                }
                Err(e) => {
                    error!(id = %record.id, error = %e, "decision_egress_failed");
                }
            }
        }
        info!("decision_egress_stopped");
    }
}

/// Append a line to the egress file, creating parent directories as needed
async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(format!("{line}\n").as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::AuthorizationOutcome;
    use std::fs;
    use tempfile::tempdir;

    fn record(outcome: AuthorizationOutcome) -> DecisionRecord {
        DecisionRecord::new("KL-13-AB-9999".parse().unwrap(), outcome, 42)
    }

    #[tokio::test]
    async fn test_writes_jsonl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("decisions.jsonl");
        let (sender, log) = create_decision_log(&path, 8, Arc::new(Metrics::new()));

        sender.send(record(AuthorizationOutcome::Authorized));
        sender.send(record(AuthorizationOutcome::MalformedResponse));
        drop(sender);
        log.run().await;

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["outcome"], "authorized");
        assert_eq!(first["opened"], true);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["outcome"], "malformed_response");
    }

    #[tokio::test]
    async fn test_append_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("decisions.jsonl");
        fs::write(&path, "{\"existing\":\"data\"}\n").unwrap();

        let (sender, log) = create_decision_log(&path, 8, Arc::new(Metrics::new()));
        sender.send(record(AuthorizationOutcome::Denied));
        drop(sender);
        log.run().await;

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("existing"));
        assert!(lines[1].contains("denied"));
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let dir = tempdir().unwrap();
        let metrics = Arc::new(Metrics::new());
        let (sender, _log) = create_decision_log(dir.path().join("d.jsonl"), 1, metrics.clone());

        sender.send(record(AuthorizationOutcome::Denied));
        sender.send(record(AuthorizationOutcome::Denied));
        assert_eq!(metrics.report().decisions_dropped, 1);
    }
}
