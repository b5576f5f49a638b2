//! Core types and error definitions for the Wuselig orchestrator.
//!
//! This crate provides the foundational types shared across all Wuselig crates:
//! normalized inbound events, workflow phases and agent kinds, agent tasks and
//! results, outbound side effects, and the unified error type.
//!
//! # Main types
//!
//! - [`WuseligError`]: Unified error enum for all Wuselig subsystems.
//! - [`WuseligResult`]: Convenience alias for `Result<T, WuseligError>`.
//! - [`Event`]: A normalized, immutable inbound notification.
//! - [`Phase`]: A step of the canonical workflow sequence.
//! - [`AgentKind`]: The closed set of agent types the orchestrator can invoke.
//! - [`AgentTask`] / [`AgentResult`]: One agent invocation and its outcome.
//! - [`Effect`]: An externally visible side effect, tagged with an idempotency key.
//! - [`Message`]: Inter-agent message carried as a work-item comment.

/// Outbound side effects.
pub mod effect;
/// Inbound events and work-item identity.
pub mod event;
/// Inter-agent messages.
pub mod message;
/// Workflow phases and agent kinds.
pub mod phase;
/// Agent tasks, results, artifacts and idempotency keys.
pub mod task;

pub use effect::Effect;
pub use event::{Event, EventKind, EventSource, PullRequestAction, WorkItemId};
pub use message::{Message, MessageKind};
pub use phase::{AgentKind, Phase};
pub use task::{idempotency_key, AgentResult, AgentTask, Artifact, ArtifactKind, ErrorKind};

// --- Error types ---

/// Top-level error type for the Wuselig orchestrator.
///
/// The first three variants mirror the error taxonomy every failure is
/// classified into; the rest come from the surrounding infrastructure.
#[derive(Debug, thiserror::Error)]
pub enum WuseligError {
    /// Concurrent state mutation or an illegal phase transition attempt.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A version-checked write lost against a concurrent writer.
    #[error("Version conflict on {work_item}: expected {expected:?}, found {found:?}")]
    VersionConflict {
        /// Work item whose record was written concurrently.
        work_item: WorkItemId,
        /// Version the writer read before computing its update.
        expected: Option<u64>,
        /// Version currently stored.
        found: Option<u64>,
    },

    /// A timeout or network failure that is worth retrying.
    #[error("Transient error: {0}")]
    Transient(String),

    /// A failure that will not succeed on retry (malformed command, unknown agent).
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// An error from the workflow state store.
    #[error("Store error: {0}")]
    Store(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error raised while delivering an outbound effect.
    #[error("Outbound error: {0}")]
    Outbound(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WuseligError {
    /// Whether this error stems from a lost compare-and-swap race or an
    /// illegal transition computed against stale state.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            WuseligError::Conflict(_) | WuseligError::VersionConflict { .. }
        )
    }

    /// Classify this error into the orchestrator's error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WuseligError::Conflict(_) | WuseligError::VersionConflict { .. } => {
                ErrorKind::Conflict
            }
            WuseligError::Permanent(_) | WuseligError::Config(_) | WuseligError::Json(_) => {
                ErrorKind::Permanent
            }
            WuseligError::Transient(_)
            | WuseligError::Store(_)
            | WuseligError::Outbound(_)
            | WuseligError::Io(_) => ErrorKind::Transient,
        }
    }
}

/// A convenience `Result` alias using [`WuseligError`].
pub type WuseligResult<T> = Result<T, WuseligError>;
