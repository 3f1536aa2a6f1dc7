use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use rfpflow_core::types::WorkflowEvent;

/// JSONL runtime logger.
///
/// Consumes workflow events and writes structured log entries as JSONL (one
/// JSON object per line). Append-only: if the process dies mid-run, every
/// previously written line is intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `log_dir` receives one `{timestamp}.jsonl` file per logger.
    /// `level` controls verbosity: 1=run summary, 2=per-stage, 3=per-stage with detail.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Run the logger as a background task until cancelled or the bus closes.
    ///
    /// Takes an already-subscribed receiver so no event published after the
    /// caller subscribed is missed. On cancellation, events already queued
    /// are still written.
    pub async fn run(self, mut rx: broadcast::Receiver<WorkflowEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = self.log_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), level = self.level, "RunLogger started");
        let mut writer = BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled, draining queued events");
                    loop {
                        match rx.try_recv() {
                            Ok(event) => {
                                if !self.write_event(&mut writer, &event).await {
                                    break;
                                }
                            }
                            Err(TryRecvError::Lagged(n)) => {
                                debug!(skipped = n, "RunLogger lagged, skipped events");
                            }
                            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                        }
                    }
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if !self.write_event(&mut writer, &event).await {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Returns false once the file can no longer be written.
    async fn write_event(
        &self,
        writer: &mut BufWriter<tokio::fs::File>,
        event: &WorkflowEvent,
    ) -> bool {
        let Some(entry) = self.event_to_entry(event) else {
            return true;
        };
        let Ok(json) = serde_json::to_string(&entry) else {
            return true;
        };
        let line = format!("{}\n", json);
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            error!(error = %e, "Failed to write log entry");
            return false;
        }
        // Flush after each entry for crash resilience
        if let Err(e) = writer.flush().await {
            error!(error = %e, "Failed to flush log");
        }
        true
    }

    /// Convert a WorkflowEvent to a log entry (None if filtered by level).
    fn event_to_entry(&self, event: &WorkflowEvent) -> Option<LogEntry> {
        let entry = |event_type, stage: Option<String>, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: event.run_id().to_string(),
            event_type,
            stage,
            detail,
        };

        match event {
            // L1: run summary
            WorkflowEvent::RunStarted { project_id, .. } => Some(entry(
                "run_started",
                None,
                Some(serde_json::json!({ "project_id": project_id })),
            )),
            WorkflowEvent::RunCompleted {
                error_count,
                elapsed_ms,
                ..
            } => Some(entry(
                "run_completed",
                None,
                Some(serde_json::json!({
                    "error_count": error_count,
                    "elapsed_ms": elapsed_ms,
                })),
            )),
            WorkflowEvent::RunFailed { error, .. } => Some(entry(
                "run_failed",
                None,
                Some(serde_json::json!({ "error": error })),
            )),
            WorkflowEvent::RunDeadlineExceeded { abandoned, .. } => Some(entry(
                "run_deadline_exceeded",
                None,
                Some(serde_json::json!({ "abandoned": abandoned })),
            )),
            WorkflowEvent::PersistenceFailed { error, .. } => Some(entry(
                "persistence_failed",
                None,
                Some(serde_json::json!({ "error": error })),
            )),

            // L2: per-stage results
            WorkflowEvent::StageFinished {
                stage,
                status,
                elapsed_ms,
                detail,
                ..
            } if self.level >= 2 => {
                let mut body = serde_json::json!({
                    "status": status,
                    "elapsed_ms": elapsed_ms,
                });
                if self.level >= 3 {
                    if let Some(detail) = detail {
                        body["detail"] = serde_json::json!(truncate_str(detail, 500));
                    }
                }
                Some(entry("stage_finished", Some(stage.to_string()), Some(body)))
            }

            // L3: dispatches
            WorkflowEvent::StageStarted { stage, .. } if self.level >= 3 => {
                Some(entry("stage_started", Some(stage.to_string()), None))
            }

            _ => None,
        }
    }
}

/// Truncate a string for logging, on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
