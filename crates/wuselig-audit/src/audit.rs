use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use wuselig_core::{Phase, WorkItemId, WuseligResult};

/// File name of the audit log inside its directory.
pub const AUDIT_FILE: &str = "audit.jsonl";

/// One `(event, action, resulting state)` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub delivery_id: String,
    pub work_item: WorkItemId,
    pub event_type: String,
    /// The dispatcher's decision, e.g. `start(planning)` or `no_op`.
    pub action: String,
    pub phase_before: Option<Phase>,
    pub phase_after: Option<Phase>,
    /// Version of the record after the event was handled.
    pub version: Option<u64>,
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// A transition was written.
    Applied,
    /// Replay, stale result, or an event that does not concern the workflow.
    NoOp,
    /// The dispatcher rejected the event.
    Rejected,
    /// Concurrent writers kept winning; the event must be redelivered.
    Conflict,
    /// Infrastructure failure while handling the event.
    Error,
}

enum Sink {
    File {
        tx: mpsc::UnboundedSender<AuditEntry>,
        writer: JoinHandle<()>,
    },
    Memory(Mutex<Vec<AuditEntry>>),
}

/// Append-only audit log that records every orchestrator decision.
pub struct AuditLog {
    sink: Sink,
}

impl AuditLog {
    /// Create a new AuditLog. Spawns a background task that appends entries to
    /// `{log_dir}/audit.jsonl`. Must be called within a tokio runtime.
    pub fn new(log_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEntry>();

        let writer = tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                warn!(error = %e, dir = %log_dir.display(), "cannot create audit directory");
            }
            let log_file = log_dir.join(AUDIT_FILE);
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .await
            {
                Ok(file) => file,
                Err(e) => {
                    warn!(error = %e, path = %log_file.display(), "cannot open audit log");
                    return;
                }
            };

            while let Some(entry) = rx.recv().await {
                let Ok(line) = serde_json::to_string(&entry) else {
                    continue;
                };
                let line = format!("{line}\n");
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!(error = %e, delivery_id = %entry.delivery_id, "audit write failed");
                }
            }
            let _ = file.flush().await;
        });

        Self {
            sink: Sink::File { tx, writer },
        }
    }

    /// Create an AuditLog that keeps entries in memory only.
    pub fn in_memory() -> Self {
        Self {
            sink: Sink::Memory(Mutex::new(Vec::new())),
        }
    }

    pub fn log(&self, entry: AuditEntry) {
        info!(
            delivery_id = %entry.delivery_id,
            work_item = %entry.work_item,
            action = %entry.action,
            outcome = ?entry.outcome,
            "audit"
        );
        match &self.sink {
            Sink::File { tx, .. } => {
                let _ = tx.send(entry);
            }
            Sink::Memory(entries) => entries.lock().push(entry),
        }
    }

    /// Entries recorded so far. Empty for file-backed logs; use [`read_entries`].
    pub fn entries(&self) -> Vec<AuditEntry> {
        match &self.sink {
            Sink::Memory(entries) => entries.lock().clone(),
            Sink::File { .. } => Vec::new(),
        }
    }

    /// Entries recorded for one delivery id.
    pub fn entries_for(&self, delivery_id: &str) -> Vec<AuditEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.delivery_id == delivery_id)
            .collect()
    }

    /// Stop accepting entries and wait until everything logged so far is on disk.
    pub async fn close(self) {
        if let Sink::File { tx, writer } = self.sink {
            drop(tx);
            let _ = writer.await;
        }
    }
}

/// Read an audit log written by [`AuditLog::new`]. Malformed lines are skipped.
pub async fn read_entries(path: &Path) -> WuseligResult<Vec<AuditEntry>> {
    let data = tokio::fs::read_to_string(path).await?;
    let mut entries = Vec::new();
    for (n, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(line = n + 1, error = %e, "skipping malformed audit line"),
        }
    }
    Ok(entries)
}
