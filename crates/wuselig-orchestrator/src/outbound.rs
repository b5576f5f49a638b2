use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use wuselig_core::{AgentTask, Effect, WuseligError, WuseligResult};

/// Delivers effects to the outside world (issue tracker, execution environment).
///
/// Effects are delivered at least once. Implementations must treat an effect
/// whose [`Effect::idempotency_key`] they already delivered as a no-op.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn deliver(&self, effect: &Effect) -> WuseligResult<()>;
}

/// Keeps delivered effects in memory. Used for replay and in tests.
#[derive(Default)]
pub struct RecordingOutbound {
    inner: Mutex<Recorded>,
}

#[derive(Default)]
struct Recorded {
    seen: HashSet<String>,
    effects: Vec<Effect>,
    attempts: usize,
}

impl RecordingOutbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Distinct effects, in delivery order.
    pub fn effects(&self) -> Vec<Effect> {
        self.inner.lock().effects.clone()
    }

    /// Number of `deliver` calls, duplicates included.
    pub fn attempts(&self) -> usize {
        self.inner.lock().attempts
    }

    pub fn dispatches(&self) -> Vec<AgentTask> {
        self.effects()
            .into_iter()
            .filter_map(|e| match e {
                Effect::Dispatch { task, .. } => Some(task),
                _ => None,
            })
            .collect()
    }

    pub fn comments(&self) -> Vec<String> {
        self.effects()
            .into_iter()
            .filter_map(|e| match e {
                Effect::Comment { body, .. } => Some(body),
                _ => None,
            })
            .collect()
    }

    pub fn labels(&self) -> Vec<String> {
        self.effects()
            .into_iter()
            .filter_map(|e| match e {
                Effect::AddLabel { label, .. } => Some(label),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Outbound for RecordingOutbound {
    async fn deliver(&self, effect: &Effect) -> WuseligResult<()> {
        let mut inner = self.inner.lock();
        inner.attempts += 1;
        if inner.seen.insert(effect.idempotency_key()) {
            inner.effects.push(effect.clone());
        }
        Ok(())
    }
}

/// One line of a [`JsonlOutbox`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub key: String,
    pub effect: Effect,
}

/// Appends effects to a JSON-lines file for an external relay to pick up.
///
/// Keys already present in the file are loaded on open, so effects delivered
/// before a restart are not written twice.
pub struct JsonlOutbox {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
    seen: Mutex<HashSet<String>>,
}

impl JsonlOutbox {
    pub async fn open(path: impl Into<PathBuf>) -> WuseligResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let seen: HashSet<String> = read_outbox(&path)
            .await?
            .into_iter()
            .map(|r| r.key)
            .collect();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        debug!(path = %path.display(), delivered = seen.len(), "outbox opened");
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
            seen: Mutex::new(seen),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Outbound for JsonlOutbox {
    async fn deliver(&self, effect: &Effect) -> WuseligResult<()> {
        let key = effect.idempotency_key();
        let mut file = self.file.lock().await;
        let delivered = self.seen.lock().contains(&key);
        if delivered {
            debug!(key = %key, "effect already delivered");
            return Ok(());
        }
        let record = OutboxRecord {
            key: key.clone(),
            effect: effect.clone(),
        };
        let line = format!("{}\n", serde_json::to_string(&record)?);
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| WuseligError::Outbound(format!("{}: {e}", self.path.display())))?;
        file.flush().await?;
        self.seen.lock().insert(key);
        Ok(())
    }
}

/// Read every record of an outbox file. A missing file has no records.
pub async fn read_outbox(path: &Path) -> WuseligResult<Vec<OutboxRecord>> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut records = Vec::new();
    for (n, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(line = n + 1, error = %e, "skipping malformed outbox line"),
        }
    }
    Ok(records)
}
