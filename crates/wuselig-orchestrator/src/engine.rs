use crate::dispatcher::{Rejection, WorkflowAction};
use crate::retry::RetryController;
use crate::trigger::source_name;
use chrono::Utc;
use tracing::info;
use wuselig_core::{
    idempotency_key, AgentKind, AgentTask, ArtifactKind, Effect, Event, EventKind, Message, Phase,
    WuseligError, WuseligResult,
};
use wuselig_store::{FailureReason, WorkflowState};

/// Result of applying an action to a workflow.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Nothing changes.
    Unchanged,
    /// Nothing is persisted; these effects are delivered directly.
    ///
    /// Only used for rejections of events on work items without a workflow.
    Emit(Vec<Effect>),
    /// Write `state` if the stored version still equals `expected`.
    /// New effects are staged in `state.outbox`.
    Write {
        expected: Option<u64>,
        state: WorkflowState,
    },
}

/// Applies [`WorkflowAction`]s to [`WorkflowState`]s, validating transitions.
///
/// Pure: performs no I/O. Persisting and delivering the outcome is the
/// orchestrator's job.
#[derive(Debug, Clone)]
pub struct StateMachine {
    retry: RetryController,
    escalation_label: String,
}

impl StateMachine {
    pub fn new(retry: RetryController, escalation_label: impl Into<String>) -> Self {
        Self {
            retry,
            escalation_label: escalation_label.into(),
        }
    }

    /// Compute the transition `action` causes for `current` (`None`: no workflow yet).
    ///
    /// Returns [`WuseligError::Conflict`] for an action that is illegal in the
    /// current phase.
    pub fn apply(
        &self,
        current: Option<&WorkflowState>,
        event: &Event,
        action: &WorkflowAction,
    ) -> WuseligResult<Transition> {
        let current = current.filter(|s| s.phase != Phase::Created);

        let base = match (action, current) {
            (WorkflowAction::NoOp, _) => return Ok(Transition::Unchanged),
            (WorkflowAction::Reject(r @ (Rejection::Conflict(_) | Rejection::Permanent(_))), None) => {
                return Ok(Transition::Emit(vec![rejection_comment(event, r)]));
            }
            (_, Some(state)) => state.clone(),
            (_, None) => WorkflowState::new(event.work_item.clone()),
        };

        let mut next = base.clone();
        next.version = base.next_version();
        next.record(event.clone());

        match action {
            WorkflowAction::NoOp => return Ok(Transition::Unchanged),
            WorkflowAction::Start(phase) => {
                if current.is_some_and(|s| !s.is_terminal()) {
                    return Err(illegal(&base, action));
                }
                let agent = phase.owner().ok_or_else(|| illegal(&base, action))?;
                next.phase = *phase;
                next.retry_count = 0;
                next.failure = None;
                self.enter_agent_phase(&mut next, &base, agent, event, 0);
            }
            WorkflowAction::Advance(to) => {
                if current.is_none() || base.phase.next() != Some(*to) {
                    return Err(illegal(&base, action));
                }
                next.phase = *to;
                next.retry_count = 0;
                match to.owner() {
                    Some(agent) => self.enter_agent_phase(&mut next, &base, agent, event, 0),
                    None => {
                        next.active_agent = None;
                        next.current_task = None;
                    }
                }
                if *to == Phase::Completed {
                    next.outbox.push(Effect::comment(
                        &next.work_item_id,
                        format!(
                            "Workflow completed after {} recorded events.",
                            next.history.len()
                        ),
                        format!("completed/{}", attempt_key(&base, event)),
                    ));
                }
            }
            WorkflowAction::Retry => {
                let agent = base
                    .active_agent
                    .filter(|a| current.is_some() && a.phase_owned() == base.phase)
                    .ok_or_else(|| illegal(&base, action))?;
                if base.is_terminal() || base.retry_count >= self.retry.max_retries() {
                    return Err(illegal(&base, action));
                }
                next.retry_count = base.retry_count.saturating_add(1);
                let task = self.issue(&base, agent, event, next.retry_count);
                let delay = self.retry.delay(base.retry_count);
                info!(
                    work_item = %next.work_item_id,
                    phase = %next.phase,
                    retry_count = next.retry_count,
                    delay_ms = millis(delay),
                    "scheduling retry"
                );
                next.current_task = Some(task.clone());
                next.outbox.push(Effect::Dispatch {
                    task,
                    delay_ms: millis(delay),
                });
            }
            WorkflowAction::Reject(r @ (Rejection::Conflict(_) | Rejection::Permanent(_))) => {
                next.outbox.push(rejection_comment(event, r));
            }
            WorkflowAction::Reject(Rejection::HumanEscalation(cause)) => {
                if current.is_none() || base.is_terminal() {
                    return Err(illegal(&base, action));
                }
                let key = format!("escalated/{}", attempt_key(&base, event));
                self.fail(&mut next, FailureReason::Escalated {
                    cause: cause.clone(),
                });
                next.outbox.push(Effect::add_label(
                    &next.work_item_id,
                    self.escalation_label.clone(),
                    key.clone(),
                ));
                next.outbox.push(Effect::comment(
                    &next.work_item_id,
                    format!(
                        "Automatic handling stopped in phase `{}` after {} retries: {cause}\n\n\
                         A human needs to take over. Re-apply an agent label to restart.",
                        base.phase, base.retry_count
                    ),
                    key,
                ));
            }
            WorkflowAction::Cancel { by } => {
                if current.is_none() || base.is_terminal() {
                    return Err(illegal(&base, action));
                }
                self.fail(&mut next, FailureReason::Cancelled { by: by.clone() });
                next.outbox.push(Effect::comment(
                    &next.work_item_id,
                    format!("Workflow cancelled by {by} in phase `{}`.", base.phase),
                    format!("cancel-{}", event.delivery_id),
                ));
            }
        }

        Ok(Transition::Write {
            expected: base.expected_version(),
            state: next,
        })
    }

    fn enter_agent_phase(
        &self,
        next: &mut WorkflowState,
        base: &WorkflowState,
        agent: AgentKind,
        event: &Event,
        retry_count: u32,
    ) {
        let task = self.issue(base, agent, event, retry_count);
        next.active_agent = Some(agent);
        next.current_task = Some(task.clone());
        next.outbox.push(Effect::Dispatch { task, delay_ms: 0 });
    }

    fn issue(
        &self,
        base: &WorkflowState,
        agent: AgentKind,
        event: &Event,
        retry_count: u32,
    ) -> AgentTask {
        let mut context = serde_json::json!({
            "trigger_type": event.type_name(),
            "triggered_by": source_name(&event.source),
            "previous_phase": base.phase,
        });
        if let EventKind::CommentCreated { body } = &event.kind {
            context["command"] = serde_json::Value::String(body.clone());
        }
        let inbox: Vec<Message> = Message::thread(comment_artifacts(base, event))
            .into_iter()
            .filter(|m| m.is_for(agent))
            .collect();
        if !inbox.is_empty() {
            if let Ok(messages) = serde_json::to_value(&inbox) {
                context["messages"] = messages;
            }
        }
        AgentTask::new(agent, base.work_item_id.clone(), retry_count, &event.delivery_id)
            .with_context(context)
    }

    fn fail(&self, next: &mut WorkflowState, reason: FailureReason) {
        next.phase = Phase::Failed;
        next.active_agent = None;
        next.current_task = None;
        next.failure = Some(reason);
        next.last_updated = Utc::now();
    }
}

/// Bodies of comments agents reported posting, oldest first.
fn comment_artifacts<'a>(base: &'a WorkflowState, event: &'a Event) -> Vec<&'a str> {
    base.history
        .iter()
        .chain(std::iter::once(event))
        .filter_map(|e| match &e.kind {
            EventKind::AgentCompleted { artifacts, .. } => Some(artifacts),
            _ => None,
        })
        .flatten()
        .filter(|a| a.kind == ArtifactKind::Comment)
        .map(|a| a.content.as_str())
        .collect()
}

/// Identifies the attempt `event` concludes, including the trigger that
/// started it: attempts of a re-opened workflow repeat phase and retry count.
fn attempt_key(base: &WorkflowState, event: &Event) -> String {
    match &base.current_task {
        Some(task) => task.dispatch_id(),
        None => format!(
            "{}/{}",
            idempotency_key(&base.work_item_id, base.phase, base.retry_count),
            event.delivery_id
        ),
    }
}

fn millis(delay: std::time::Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

fn rejection_comment(event: &Event, rejection: &Rejection) -> Effect {
    let text = match rejection {
        Rejection::Conflict(msg) => format!("Ignored `{}`: {msg}", event.type_name()),
        Rejection::Permanent(msg) | Rejection::HumanEscalation(msg) => {
            format!("Cannot act on `{}`: {msg}", event.type_name())
        }
    };
    Effect::comment(&event.work_item, text, format!("reject-{}", event.delivery_id))
}

fn illegal(state: &WorkflowState, action: &WorkflowAction) -> WuseligError {
    WuseligError::Conflict(format!(
        "illegal transition for {}: {action} in phase {}",
        state.work_item_id, state.phase
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use wuselig_core::{EventSource, WorkItemId};

    fn engine() -> StateMachine {
        StateMachine::new(
            RetryController::new(RetryPolicy {
                max_retries: 3,
                base_delay_ms: 1_000,
                max_delay_ms: 60_000,
                jitter_ms: 0,
            }),
            "wuselig:needs-human",
        )
    }

    fn item() -> WorkItemId {
        WorkItemId::new("acme/widgets", 42)
    }

    fn event(id: &str) -> Event {
        Event::label_added(id, item(), "agent:planner", EventSource::human("octocat"))
    }

    fn written(t: Transition) -> (Option<u64>, WorkflowState) {
        match t {
            Transition::Write { expected, state } => (expected, state),
            other => panic!("expected a write, got {other:?}"),
        }
    }

    fn planning() -> WorkflowState {
        let (_, s) = written(
            engine()
                .apply(None, &event("d-1"), &WorkflowAction::Start(Phase::Planning))
                .unwrap(),
        );
        s
    }

    #[test]
    fn test_start_creates_state_and_dispatches() {
        let s = planning();
        assert_eq!(s.phase, Phase::Planning);
        assert_eq!(s.active_agent, Some(AgentKind::Planner));
        assert_eq!(s.version, 1);
        assert_eq!(s.retry_count, 0);
        assert_eq!(s.history.len(), 1);
        assert_eq!(s.outbox.len(), 1);
        match &s.outbox[0] {
            Effect::Dispatch { task, delay_ms } => {
                assert_eq!(*delay_ms, 0);
                assert_eq!(task.phase, Phase::Planning);
                assert_eq!(task.trigger_delivery_id, "d-1");
                assert_eq!(task.input_context["previous_phase"], "created");
            }
            other => panic!("unexpected effect {other:?}"),
        }
        assert_eq!(s.current_task.as_ref().map(|t| t.retry_count), Some(0));
    }

    #[test]
    fn test_start_on_live_workflow_is_illegal() {
        let s = planning();
        let err = engine()
            .apply(Some(&s), &event("d-2"), &WorkflowAction::Start(Phase::Coding))
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_advance_must_follow_sequence() {
        let s = planning();
        let err = engine()
            .apply(Some(&s), &event("d-2"), &WorkflowAction::Advance(Phase::Coding))
            .unwrap_err();
        assert!(err.is_conflict());

        let (expected, next) = written(
            engine()
                .apply(
                    Some(&s),
                    &event("d-3"),
                    &WorkflowAction::Advance(Phase::AwaitingApproval),
                )
                .unwrap(),
        );
        assert_eq!(expected, Some(1));
        assert_eq!(next.phase, Phase::AwaitingApproval);
        assert_eq!(next.active_agent, None);
        assert!(next.current_task.is_none());
        assert_eq!(next.version, 2);
    }

    #[test]
    fn test_retry_increments_and_backs_off() {
        let mut s = planning();
        s.outbox.clear();
        s.retry_count = 1;
        let (_, next) = written(
            engine()
                .apply(Some(&s), &event("d-2"), &WorkflowAction::Retry)
                .unwrap(),
        );
        assert_eq!(next.phase, Phase::Planning);
        assert_eq!(next.retry_count, 2);
        match next.outbox.as_slice() {
            [Effect::Dispatch { task, delay_ms }] => {
                assert_eq!(task.retry_count, 2);
                assert_eq!(*delay_ms, 2_000);
            }
            other => panic!("unexpected outbox {other:?}"),
        }
    }

    #[test]
    fn test_retry_beyond_budget_is_illegal() {
        let mut s = planning();
        s.retry_count = 3;
        assert!(engine()
            .apply(Some(&s), &event("d-2"), &WorkflowAction::Retry)
            .is_err());
    }

    #[test]
    fn test_escalation_fails_with_label_and_comment() {
        let mut s = planning();
        s.outbox.clear();
        s.retry_count = 3;
        let (_, next) = written(
            engine()
                .apply(
                    Some(&s),
                    &event("d-2"),
                    &WorkflowAction::Reject(Rejection::HumanEscalation("budget".into())),
                )
                .unwrap(),
        );
        assert_eq!(next.phase, Phase::Failed);
        assert_eq!(next.retry_count, 3);
        assert!(matches!(next.failure, Some(FailureReason::Escalated { .. })));
        assert_eq!(next.outbox.len(), 2);
        assert!(matches!(&next.outbox[0], Effect::AddLabel { label, .. } if label == "wuselig:needs-human"));
        assert!(matches!(&next.outbox[1], Effect::Comment { .. }));
    }

    #[test]
    fn test_escalation_after_reopen_uses_fresh_keys() {
        let escalate = WorkflowAction::Reject(Rejection::HumanEscalation("budget".into()));
        let keys = |s: &WorkflowState| -> Vec<String> {
            s.outbox.iter().map(Effect::idempotency_key).collect()
        };

        let mut s = planning();
        s.outbox.clear();
        let (_, failed) = written(engine().apply(Some(&s), &event("d-2"), &escalate).unwrap());
        let first = keys(&failed);

        let (_, mut reopened) = written(
            engine()
                .apply(Some(&failed), &event("d-3"), &WorkflowAction::Start(Phase::Planning))
                .unwrap(),
        );
        assert_eq!(reopened.retry_count, 0);
        reopened.outbox.clear();
        let (_, failed_again) =
            written(engine().apply(Some(&reopened), &event("d-4"), &escalate).unwrap());
        let second = keys(&failed_again);

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert!(first.iter().all(|k| !second.contains(k)), "{first:?} {second:?}");
    }

    #[test]
    fn test_conflict_rejection_keeps_phase() {
        let s = planning();
        let (_, next) = written(
            engine()
                .apply(
                    Some(&s),
                    &event("d-2"),
                    &WorkflowAction::Reject(Rejection::Conflict("busy".into())),
                )
                .unwrap(),
        );
        assert_eq!(next.phase, Phase::Planning);
        assert_eq!(next.history.len(), 2);
        // Undelivered effects of the previous transition are kept.
        assert_eq!(next.outbox.len(), 2);
    }

    #[test]
    fn test_rejection_without_workflow_emits_only() {
        let t = engine()
            .apply(
                None,
                &event("d-1"),
                &WorkflowAction::Reject(Rejection::Permanent("unknown agent".into())),
            )
            .unwrap();
        match t {
            Transition::Emit(effects) => {
                assert_eq!(effects.len(), 1);
                assert_eq!(effects[0].idempotency_key(), "comment:reject-d-1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cancel_and_reopen() {
        let s = planning();
        let (_, cancelled) = written(
            engine()
                .apply(
                    Some(&s),
                    &event("d-2"),
                    &WorkflowAction::Cancel {
                        by: "octocat".into(),
                    },
                )
                .unwrap(),
        );
        assert_eq!(cancelled.phase, Phase::Failed);
        assert!(cancelled.current_task.is_none());

        let (_, reopened) = written(
            engine()
                .apply(
                    Some(&cancelled),
                    &event("d-3"),
                    &WorkflowAction::Start(Phase::Coding),
                )
                .unwrap(),
        );
        assert_eq!(reopened.phase, Phase::Coding);
        assert_eq!(reopened.failure, None);
        assert_eq!(reopened.history.len(), 3);
    }

    #[test]
    fn test_completion_posts_summary() {
        let mut s = planning();
        s.outbox.clear();
        s.phase = Phase::Documenting;
        s.active_agent = Some(AgentKind::Documenter);
        let (_, done) = written(
            engine()
                .apply(Some(&s), &event("d-2"), &WorkflowAction::Advance(Phase::Completed))
                .unwrap(),
        );
        assert_eq!(done.phase, Phase::Completed);
        assert!(done.active_agent.is_none());
        assert!(matches!(done.outbox.as_slice(), [Effect::Comment { .. }]));
    }

    #[test]
    fn test_handoff_messages_reach_next_agent() {
        let mut s = planning();
        s.outbox.clear();
        let handoff = Message::new(
            wuselig_core::MessageKind::Handoff,
            AgentKind::Planner,
            Some(AgentKind::Coder),
            serde_json::json!({"plan": "split the parser"}),
        );
        let note_for_tester = Message::new(
            wuselig_core::MessageKind::Question,
            AgentKind::Planner,
            Some(AgentKind::Tester),
            serde_json::json!({"q": "fixtures?"}),
        );
        s.record(Event::new(
            "result-1",
            item(),
            EventKind::AgentCompleted {
                agent: AgentKind::Planner,
                phase: Phase::Planning,
                retry_count: 0,
                artifacts: vec![handoff.into_artifact("k1"), note_for_tester.into_artifact("k2")],
            },
            EventSource::Agent {
                agent: AgentKind::Planner,
            },
        ));
        s.phase = Phase::AwaitingApproval;
        s.active_agent = None;

        let (_, next) = written(
            engine()
                .apply(Some(&s), &event("d-approve"), &WorkflowAction::Advance(Phase::Coding))
                .unwrap(),
        );
        let task = next.current_task.unwrap();
        assert_eq!(task.agent_type, AgentKind::Coder);
        let messages = task.input_context["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["payload"]["plan"], "split the parser");
    }

    #[test]
    fn test_noop_is_unchanged() {
        assert_eq!(
            engine()
                .apply(None, &event("d-1"), &WorkflowAction::NoOp)
                .unwrap(),
            Transition::Unchanged
        );
    }
}
