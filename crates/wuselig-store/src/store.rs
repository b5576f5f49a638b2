use crate::state::WorkflowState;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;
use wuselig_core::{WorkItemId, WuseligError, WuseligResult};

/// Durable key-value persistence of [`WorkflowState`] keyed by work item.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Read the current record, `None` if the work item has no workflow yet.
    async fn get(&self, id: &WorkItemId) -> WuseligResult<Option<WorkflowState>>;

    /// Write `state` only if the stored version equals `expected`
    /// (`None`: no record may exist yet).
    ///
    /// Returns [`WuseligError::VersionConflict`] when another writer got there
    /// first; the caller must re-read and recompute its update.
    async fn compare_and_swap(
        &self,
        expected: Option<u64>,
        state: &WorkflowState,
    ) -> WuseligResult<()>;

    /// All work items with a stored record.
    async fn list(&self) -> WuseligResult<Vec<WorkItemId>>;
}

/// Validate a version-checked write against the currently stored record.
///
/// Shared by every store so the optimistic-concurrency rules are identical:
/// the stored version must match `expected`, the new version must be the
/// next one, and the new history must extend the stored history.
pub fn check_write(
    current: Option<&WorkflowState>,
    expected: Option<u64>,
    next: &WorkflowState,
) -> WuseligResult<()> {
    let found = current.map(|s| s.version);
    if found != expected {
        return Err(WuseligError::VersionConflict {
            work_item: next.work_item_id.clone(),
            expected,
            found,
        });
    }

    let want = expected.map_or(1, |v| v.saturating_add(1));
    if next.version != want {
        return Err(WuseligError::Store(format!(
            "{}: write must carry version {want}, got {}",
            next.work_item_id, next.version
        )));
    }

    if let Some(current) = current {
        let extends = current.history.len() <= next.history.len()
            && current
                .history
                .iter()
                .zip(&next.history)
                .all(|(old, new)| old.delivery_id == new.delivery_id);
        if !extends {
            return Err(WuseligError::Conflict(format!(
                "{}: history is append-only",
                next.work_item_id
            )));
        }
    }

    Ok(())
}

/// In-memory store. State is lost on restart; used in tests and for replay.
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    states: RwLock<HashMap<WorkItemId, WorkflowState>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn get(&self, id: &WorkItemId) -> WuseligResult<Option<WorkflowState>> {
        Ok(self.states.read().get(id).cloned())
    }

    async fn compare_and_swap(
        &self,
        expected: Option<u64>,
        state: &WorkflowState,
    ) -> WuseligResult<()> {
        let mut states = self.states.write();
        check_write(states.get(&state.work_item_id), expected, state)?;
        debug!(work_item = %state.work_item_id, version = state.version, "state written");
        states.insert(state.work_item_id.clone(), state.clone());
        Ok(())
    }

    async fn list(&self) -> WuseligResult<Vec<WorkItemId>> {
        let mut ids: Vec<WorkItemId> = self.states.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
