use crate::phase::{AgentKind, Phase};
use crate::task::{Artifact, ErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of an externally hosted work item (issue or pull request).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkItemId {
    /// Repository in `owner/name` form.
    pub repo: String,
    /// Issue or pull request number.
    pub number: u64,
}

impl WorkItemId {
    pub fn new(repo: impl Into<String>, number: u64) -> Self {
        Self {
            repo: repo.into(),
            number,
        }
    }
}

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

/// Who caused an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventSource {
    /// A person acting on the work item.
    Human { login: String },
    /// An agent acting on the work item (labels or comments it posted, or its result).
    Agent { agent: AgentKind },
    /// The orchestrator or hosting platform itself.
    System,
}

impl EventSource {
    pub fn human(login: impl Into<String>) -> Self {
        EventSource::Human {
            login: login.into(),
        }
    }

    pub fn is_agent(&self) -> bool {
        matches!(self, EventSource::Agent { .. })
    }

    pub fn is_human(&self) -> bool {
        matches!(self, EventSource::Human { .. })
    }
}

/// Pull request state changes the orchestrator reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullRequestAction {
    Opened,
    Closed,
    Merged,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    LabelAdded {
        label: String,
    },
    LabelRemoved {
        label: String,
    },
    CommentCreated {
        body: String,
    },
    PullRequest {
        action: PullRequestAction,
    },
    /// Internal: an agent invocation finished successfully.
    AgentCompleted {
        agent: AgentKind,
        phase: Phase,
        retry_count: u32,
        #[serde(default)]
        artifacts: Vec<Artifact>,
    },
    /// Internal: an agent invocation failed or timed out.
    AgentFailed {
        agent: AgentKind,
        phase: Phase,
        retry_count: u32,
        error: ErrorKind,
        #[serde(default)]
        message: Option<String>,
    },
}

impl EventKind {
    /// Short, stable name used in logs and audit records.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::LabelAdded { .. } => "label_added",
            EventKind::LabelRemoved { .. } => "label_removed",
            EventKind::CommentCreated { .. } => "comment_created",
            EventKind::PullRequest { .. } => "pull_request",
            EventKind::AgentCompleted { .. } => "agent_completed",
            EventKind::AgentFailed { .. } => "agent_failed",
        }
    }

    /// Tie-break rank for events arriving at the same instant: labels sort
    /// before comment commands, external events before internal results.
    pub fn precedence(&self) -> u8 {
        match self {
            EventKind::LabelAdded { .. } | EventKind::LabelRemoved { .. } => 0,
            EventKind::CommentCreated { .. } => 1,
            EventKind::PullRequest { .. } => 2,
            EventKind::AgentCompleted { .. } | EventKind::AgentFailed { .. } => 3,
        }
    }
}

/// A normalized inbound notification. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique transport-level delivery identifier.
    pub delivery_id: String,
    pub work_item: WorkItemId,
    #[serde(flatten)]
    pub kind: EventKind,
    pub source: EventSource,
    /// Raw normalized payload, kept for debugging only.
    #[serde(default)]
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl Event {
    pub fn new(
        delivery_id: impl Into<String>,
        work_item: WorkItemId,
        kind: EventKind,
        source: EventSource,
    ) -> Self {
        Self {
            delivery_id: delivery_id.into(),
            work_item,
            kind,
            source,
            payload: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }

    pub fn label_added(
        delivery_id: impl Into<String>,
        work_item: WorkItemId,
        label: impl Into<String>,
        source: EventSource,
    ) -> Self {
        Self::new(
            delivery_id,
            work_item,
            EventKind::LabelAdded {
                label: label.into(),
            },
            source,
        )
    }

    pub fn comment(
        delivery_id: impl Into<String>,
        work_item: WorkItemId,
        body: impl Into<String>,
        source: EventSource,
    ) -> Self {
        Self::new(
            delivery_id,
            work_item,
            EventKind::CommentCreated { body: body.into() },
            source,
        )
    }

    pub fn with_received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}
