use crate::state::WorkflowState;
use crate::store::{check_write, WorkflowStore};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use wuselig_core::{WorkItemId, WuseligError, WuseligResult};

/// File-based store: one pretty-printed JSON document per work item.
///
/// Layout: `{dir}/{owner}__{name}/{number}.json`. Writes go to a temporary
/// file that is renamed over the document, so a crash never leaves a torn
/// record. Version checks are serialized within this process; multiple
/// processes sharing a directory need an external lock.
pub struct FileWorkflowStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileWorkflowStore {
    pub async fn new(dir: PathBuf) -> WuseligResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn repo_dir(&self, id: &WorkItemId) -> WuseligResult<PathBuf> {
        let (owner, name) = id
            .repo
            .split_once('/')
            .filter(|(o, n)| valid_segment(o) && valid_segment(n))
            .ok_or_else(|| WuseligError::Store(format!("invalid repository name: {}", id.repo)))?;
        Ok(self.dir.join(format!("{owner}__{name}")))
    }

    fn state_path(&self, id: &WorkItemId) -> WuseligResult<PathBuf> {
        Ok(self.repo_dir(id)?.join(format!("{}.json", id.number)))
    }

    async fn read(&self, path: &Path) -> WuseligResult<Option<WorkflowState>> {
        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = serde_json::from_str(&data).map_err(|e| {
            WuseligError::Store(format!("Failed to parse {}: {e}", path.display()))
        })?;
        Ok(Some(state))
    }
}

fn valid_segment(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && !s.contains("__")
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[async_trait]
impl WorkflowStore for FileWorkflowStore {
    async fn get(&self, id: &WorkItemId) -> WuseligResult<Option<WorkflowState>> {
        let path = self.state_path(id)?;
        self.read(&path).await
    }

    async fn compare_and_swap(
        &self,
        expected: Option<u64>,
        state: &WorkflowState,
    ) -> WuseligResult<()> {
        let path = self.state_path(&state.work_item_id)?;
        let _guard = self.write_lock.lock().await;

        let current = self.read(&path).await?;
        check_write(current.as_ref(), expected, state)?;

        tokio::fs::create_dir_all(self.repo_dir(&state.work_item_id)?).await?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(
            work_item = %state.work_item_id,
            version = state.version,
            path = %path.display(),
            "state written"
        );
        Ok(())
    }

    async fn list(&self) -> WuseligResult<Vec<WorkItemId>> {
        let mut ids = Vec::new();
        let mut repos = tokio::fs::read_dir(&self.dir).await?;
        while let Some(repo) = repos.next_entry().await? {
            if !repo.file_type().await?.is_dir() {
                continue;
            }
            let dir_name = repo.file_name();
            let Some((owner, name)) = dir_name.to_str().and_then(|d| d.split_once("__")) else {
                warn!(dir = ?dir_name, "skipping unrecognized directory in state store");
                continue;
            };
            let repo_name = format!("{owner}/{name}");

            let mut entries = tokio::fs::read_dir(repo.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                if let Some(file) = entry.file_name().to_str() {
                    if let Some(stem) = file.strip_suffix(".json") {
                        if let Ok(number) = stem.parse::<u64>() {
                            ids.push(WorkItemId::new(repo_name.clone(), number));
                        }
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
