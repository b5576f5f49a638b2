use crate::event::WorkItemId;
use crate::task::AgentTask;
use serde::{Deserialize, Serialize};

/// An externally visible side effect staged by a workflow transition.
///
/// Every effect carries an idempotency key; sinks must drop an effect whose
/// key they have already delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum Effect {
    /// Post a comment on the work item.
    Comment {
        work_item: WorkItemId,
        body: String,
        idempotency_key: String,
    },
    /// Add a label to the work item.
    AddLabel {
        work_item: WorkItemId,
        label: String,
        idempotency_key: String,
    },
    /// Send a dispatch instruction to the isolated execution environment.
    Dispatch {
        task: AgentTask,
        /// Do not start the invocation before this many milliseconds have passed.
        delay_ms: u64,
    },
}

impl Effect {
    pub fn comment(work_item: &WorkItemId, body: impl Into<String>, key: impl Into<String>) -> Self {
        Effect::Comment {
            work_item: work_item.clone(),
            body: body.into(),
            idempotency_key: key.into(),
        }
    }

    pub fn add_label(work_item: &WorkItemId, label: impl Into<String>, key: impl Into<String>) -> Self {
        Effect::AddLabel {
            work_item: work_item.clone(),
            label: label.into(),
            idempotency_key: key.into(),
        }
    }

    pub fn work_item(&self) -> &WorkItemId {
        match self {
            Effect::Comment { work_item, .. } | Effect::AddLabel { work_item, .. } => work_item,
            Effect::Dispatch { task, .. } => &task.work_item_id,
        }
    }

    /// Key used to suppress duplicate delivery.
    pub fn idempotency_key(&self) -> String {
        match self {
            Effect::Comment {
                idempotency_key, ..
            } => format!("comment:{idempotency_key}"),
            Effect::AddLabel {
                idempotency_key, ..
            } => format!("label:{idempotency_key}"),
            Effect::Dispatch { task, .. } => format!("dispatch:{}", task.dispatch_id()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Effect::Comment { .. } => "comment",
            Effect::AddLabel { .. } => "add_label",
            Effect::Dispatch { .. } => "dispatch",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::phase::AgentKind;

    #[test]
    fn test_keys_are_namespaced_by_effect() {
        let item = WorkItemId::new("acme/widgets", 1);
        let comment = Effect::comment(&item, "hi", "k");
        let label = Effect::add_label(&item, "wuselig:needs-human", "k");
        assert_ne!(comment.idempotency_key(), label.idempotency_key());
        assert_eq!(comment.work_item(), &item);
    }

    #[test]
    fn test_dispatch_serialization() {
        let task = AgentTask::new(AgentKind::Planner, WorkItemId::new("acme/widgets", 1), 0, "d");
        let effect = Effect::Dispatch { task, delay_ms: 250 };
        let json = serde_json::to_value(&effect).unwrap();
        assert_eq!(json["effect"], "dispatch");
        assert_eq!(json["task"]["agent_type"], "planner");
        let parsed: Effect = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, effect);
    }
}
