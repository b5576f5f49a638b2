use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wuselig_core::{AgentKind, AgentTask, Effect, Event, Phase, WorkItemId};

/// Why a workflow ended in [`Phase::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// Retry budget exhausted or a permanent agent failure; a human must re-trigger.
    Escalated { cause: String },
    /// Cancelled by label removal, command, or a closed pull request.
    Cancelled { by: String },
}

/// Persisted workflow record, one per work item.
///
/// Mutated only by the state machine engine and never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub work_item_id: WorkItemId,
    pub phase: Phase,
    pub active_agent: Option<AgentKind>,
    pub retry_count: u32,
    /// Incremented on every write; `0` means "never stored".
    pub version: u64,
    /// Append-only.
    pub history: Vec<Event>,
    pub last_updated: DateTime<Utc>,
    /// Task issued for the current phase attempt, if an agent owns the phase.
    #[serde(default)]
    pub current_task: Option<AgentTask>,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    /// Effects committed with the last transition but not yet delivered.
    #[serde(default)]
    pub outbox: Vec<Effect>,
}

impl WorkflowState {
    /// The virtual initial state of a work item that has no record yet.
    pub fn new(work_item_id: WorkItemId) -> Self {
        Self {
            work_item_id,
            phase: Phase::Created,
            active_agent: None,
            retry_count: 0,
            version: 0,
            history: Vec::new(),
            last_updated: Utc::now(),
            current_task: None,
            failure: None,
            outbox: Vec::new(),
        }
    }

    /// Whether an event with this delivery id has already been recorded.
    pub fn has_seen(&self, delivery_id: &str) -> bool {
        self.history.iter().any(|e| e.delivery_id == delivery_id)
    }

    /// Append an event to the history.
    pub fn record(&mut self, event: Event) {
        self.last_updated = Utc::now();
        self.history.push(event);
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Whether the workflow is blocked on a human approval.
    pub fn awaiting_approval(&self) -> bool {
        self.phase == Phase::AwaitingApproval
    }

    /// The version the next write of this record must carry.
    pub fn next_version(&self) -> u64 {
        self.version.saturating_add(1)
    }

    /// Version a writer must present to [`crate::WorkflowStore::compare_and_swap`]
    /// when replacing this record; `None` for a record that was never stored.
    pub fn expected_version(&self) -> Option<u64> {
        (self.version > 0).then_some(self.version)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wuselig_core::EventSource;

    #[test]
    fn test_new_state_is_virtual_created() {
        let state = WorkflowState::new(WorkItemId::new("acme/widgets", 42));
        assert_eq!(state.phase, Phase::Created);
        assert_eq!(state.version, 0);
        assert_eq!(state.expected_version(), None);
        assert_eq!(state.next_version(), 1);
        assert!(state.history.is_empty());
    }

    #[test]
    fn test_record_and_has_seen() {
        let item = WorkItemId::new("acme/widgets", 42);
        let mut state = WorkflowState::new(item.clone());
        state.record(Event::label_added(
            "d-1",
            item,
            "agent:planner",
            EventSource::human("octocat"),
        ));
        assert!(state.has_seen("d-1"));
        assert!(!state.has_seen("d-2"));
    }

    #[test]
    fn test_state_roundtrip_with_failure() {
        let mut state = WorkflowState::new(WorkItemId::new("acme/widgets", 7));
        state.phase = Phase::Failed;
        state.version = 5;
        state.failure = Some(FailureReason::Escalated {
            cause: "retry budget exhausted".into(),
        });
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"reason\":\"escalated\""));
        let parsed: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
        assert_eq!(parsed.expected_version(), Some(5));
    }
}
