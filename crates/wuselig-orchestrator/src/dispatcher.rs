use crate::retry::{RetryController, RetryDecision};
use crate::trigger::{Signal, TriggerParser};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;
use wuselig_core::{AgentKind, Event, Phase};
use wuselig_store::WorkflowState;

/// Why an event was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Rejection {
    /// The event conflicts with the workflow's current phase.
    Conflict(String),
    /// The event can never succeed (malformed command, unknown agent).
    Permanent(String),
    /// Automatic handling is exhausted; a human must take over.
    HumanEscalation(String),
}

/// The dispatcher's decision for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "value", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Create (or re-open) the workflow in an agent-owned phase.
    Start(Phase),
    /// Move to the next phase of the canonical sequence.
    Advance(Phase),
    /// Re-run the current phase.
    Retry,
    Reject(Rejection),
    /// Stop the workflow; in-flight results become stale.
    Cancel { by: String },
    NoOp,
}

impl std::fmt::Display for WorkflowAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowAction::Start(p) => write!(f, "start({p})"),
            WorkflowAction::Advance(p) => write!(f, "advance({p})"),
            WorkflowAction::Retry => write!(f, "retry"),
            WorkflowAction::Reject(Rejection::Conflict(_)) => write!(f, "reject(conflict)"),
            WorkflowAction::Reject(Rejection::Permanent(_)) => write!(f, "reject(permanent)"),
            WorkflowAction::Reject(Rejection::HumanEscalation(_)) => {
                write!(f, "reject(human_escalation)")
            }
            WorkflowAction::Cancel { .. } => write!(f, "cancel"),
            WorkflowAction::NoOp => write!(f, "no_op"),
        }
    }
}

/// Pure decision function mapping `(Event, current WorkflowState)` to a [`WorkflowAction`].
#[derive(Debug, Clone)]
pub struct Dispatcher {
    parser: TriggerParser,
    retry: RetryController,
    enabled: BTreeSet<AgentKind>,
}

impl Dispatcher {
    pub fn new(
        parser: TriggerParser,
        retry: RetryController,
        enabled: impl IntoIterator<Item = AgentKind>,
    ) -> Self {
        Self {
            parser,
            retry,
            enabled: enabled.into_iter().collect(),
        }
    }

    pub fn is_enabled(&self, agent: AgentKind) -> bool {
        self.enabled.contains(&agent)
    }

    /// Decide what `event` means for the workflow in `state` (`None`: no workflow yet).
    pub fn dispatch(&self, event: &Event, state: Option<&WorkflowState>) -> WorkflowAction {
        // A record still in the virtual initial phase behaves like no record.
        let state = state.filter(|s| s.phase != Phase::Created);

        if state.is_some_and(|s| s.has_seen(&event.delivery_id)) {
            debug!(delivery_id = %event.delivery_id, "replayed delivery suppressed");
            return WorkflowAction::NoOp;
        }

        let signal = self
            .parser
            .interpret(event, state.and_then(|s| s.active_agent));
        if signal == Signal::Ignore {
            return WorkflowAction::NoOp;
        }

        if let Some(s) = state.filter(|s| s.awaiting_approval()) {
            if event.source.is_agent() {
                return WorkflowAction::Reject(Rejection::Conflict(format!(
                    "{} is awaiting human approval; agent-origin {} rejected",
                    s.work_item_id,
                    event.type_name()
                )));
            }
        }

        match signal {
            Signal::Ignore => WorkflowAction::NoOp,
            Signal::Invalid { reason } => WorkflowAction::Reject(Rejection::Permanent(reason)),
            Signal::Trigger { agent, .. } => self.trigger(agent, state),
            Signal::Approve => match state {
                Some(s) if s.awaiting_approval() && event.source.is_human() => {
                    WorkflowAction::Advance(Phase::Coding)
                }
                _ => WorkflowAction::NoOp,
            },
            Signal::Cancel { by } => match state {
                Some(s) if !s.is_terminal() => WorkflowAction::Cancel { by },
                _ => WorkflowAction::NoOp,
            },
            Signal::Completed {
                agent,
                phase,
                retry_count,
            } => match state {
                Some(s) if is_current_attempt(s, agent, phase, retry_count) => s
                    .phase
                    .next()
                    .map_or(WorkflowAction::NoOp, WorkflowAction::Advance),
                _ => stale(event),
            },
            Signal::Failed {
                agent,
                phase,
                retry_count,
                error,
                message,
            } => match state {
                Some(s) if is_current_attempt(s, agent, phase, retry_count) => {
                    match self.retry.decide(s.retry_count, error, message.as_deref()) {
                        RetryDecision::Retry { .. } => WorkflowAction::Retry,
                        RetryDecision::Escalate { cause } => {
                            WorkflowAction::Reject(Rejection::HumanEscalation(cause))
                        }
                    }
                }
                _ => stale(event),
            },
        }
    }

    fn trigger(&self, agent: AgentKind, state: Option<&WorkflowState>) -> WorkflowAction {
        if !self.is_enabled(agent) {
            return WorkflowAction::Reject(Rejection::Permanent(format!(
                "agent type `{agent}` is not enabled"
            )));
        }
        match state {
            None => WorkflowAction::Start(agent.phase_owned()),
            Some(s) if s.is_terminal() => WorkflowAction::Start(agent.phase_owned()),
            Some(s) if s.active_agent == Some(agent) => WorkflowAction::NoOp,
            Some(s) => WorkflowAction::Reject(Rejection::Conflict(format!(
                "cannot start {agent}: {} is in phase {}",
                s.work_item_id, s.phase
            ))),
        }
    }
}

fn is_current_attempt(
    state: &WorkflowState,
    agent: AgentKind,
    phase: Phase,
    retry_count: u32,
) -> bool {
    !state.is_terminal()
        && state.active_agent == Some(agent)
        && state.phase == phase
        && state.retry_count == retry_count
}

fn stale(event: &Event) -> WorkflowAction {
    debug!(delivery_id = %event.delivery_id, "stale agent result discarded");
    WorkflowAction::NoOp
}
