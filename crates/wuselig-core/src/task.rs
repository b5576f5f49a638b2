use crate::event::{Event, EventKind, EventSource, WorkItemId};
use crate::phase::{AgentKind, Phase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Error taxonomy shared by agent results and orchestrator decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts and network failures; retried with backoff.
    Transient,
    /// Concurrent mutation or illegal transition; retried against fresh state.
    Conflict,
    /// Will not succeed on retry; surfaced to a human immediately.
    Permanent,
    /// Retry budget exhausted.
    HumanEscalation,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Conflict)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::Permanent => write!(f, "permanent"),
            ErrorKind::HumanEscalation => write!(f, "human_escalation"),
        }
    }
}

/// Derive the idempotency key for side effects of one phase attempt.
///
/// The same `(work_item, phase, retry_count)` always yields the same key, so an
/// agent re-invoked after crash recovery produces artifacts the tracker already
/// knows about.
pub fn idempotency_key(work_item: &WorkItemId, phase: Phase, retry_count: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{work_item}:{phase}:{retry_count}").as_bytes());
    hex::encode(hasher.finalize())
}

/// Kind of externally visible side effect produced by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Comment,
    Label,
    PullRequest,
    Commit,
}

/// Descriptor of a side effect an agent performed on the work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub content: String,
    pub idempotency_key: String,
}

impl Artifact {
    pub fn new(kind: ArtifactKind, content: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            idempotency_key: key.into(),
        }
    }

    pub fn comment(content: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ArtifactKind::Comment, content, key)
    }
}

/// One agent invocation, issued when a workflow enters an agent-owned phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub agent_type: AgentKind,
    pub work_item_id: WorkItemId,
    /// Context handed to the agent (trigger, command arguments, previous phase).
    #[serde(default)]
    pub input_context: serde_json::Value,
    pub issued_at: DateTime<Utc>,
    /// Phase that issued this task; results from other phases are stale.
    pub phase: Phase,
    /// Attempt that issued this task; results from other attempts are stale.
    pub retry_count: u32,
    /// Delivery id of the event that caused this task.
    pub trigger_delivery_id: String,
    /// Key every side effect of this attempt must carry.
    pub idempotency_key: String,
}

impl AgentTask {
    pub fn new(
        agent_type: AgentKind,
        work_item_id: WorkItemId,
        retry_count: u32,
        trigger_delivery_id: impl Into<String>,
    ) -> Self {
        let phase = agent_type.phase_owned();
        let idempotency_key = idempotency_key(&work_item_id, phase, retry_count);
        Self {
            agent_type,
            work_item_id,
            input_context: serde_json::Value::Null,
            issued_at: Utc::now(),
            phase,
            retry_count,
            trigger_delivery_id: trigger_delivery_id.into(),
            idempotency_key,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.input_context = context;
        self
    }

    /// Identifies this dispatch: the attempt plus the event that caused it.
    ///
    /// A workflow re-opened after cancellation issues a task with the same
    /// idempotency key as before, but under a different trigger.
    pub fn dispatch_id(&self) -> String {
        format!("{}/{}", self.idempotency_key, self.trigger_delivery_id)
    }

    /// Delivery id for the event reporting this task's result.
    ///
    /// Derived from the dispatch id so that a result reported twice (for
    /// example after the executor restarted) is suppressed as a replay.
    pub fn result_delivery_id(&self) -> String {
        format!("result-{}", self.dispatch_id())
    }
}

/// Outcome of one agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub error: Option<ErrorKind>,
    #[serde(default)]
    pub message: Option<String>,
}

impl AgentResult {
    pub fn success(artifacts: Vec<Artifact>) -> Self {
        Self {
            success: true,
            artifacts,
            error: None,
            message: None,
        }
    }

    pub fn failure(error: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            artifacts: Vec::new(),
            error: Some(error),
            message: Some(message.into()),
        }
    }

    /// Convert this result into the internal event that feeds it back to the dispatcher.
    pub fn into_event(self, task: &AgentTask) -> Event {
        let kind = if self.success {
            EventKind::AgentCompleted {
                agent: task.agent_type,
                phase: task.phase,
                retry_count: task.retry_count,
                artifacts: self.artifacts,
            }
        } else {
            EventKind::AgentFailed {
                agent: task.agent_type,
                phase: task.phase,
                retry_count: task.retry_count,
                // A failure without a classification is treated as retryable.
                error: self.error.unwrap_or(ErrorKind::Transient),
                message: self.message,
            }
        };
        Event::new(
            task.result_delivery_id(),
            task.work_item_id.clone(),
            kind,
            EventSource::Agent {
                agent: task.agent_type,
            },
        )
    }
}
