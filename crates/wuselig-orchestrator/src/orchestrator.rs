use crate::config::OrchestratorConfig;
use crate::dispatcher::{Dispatcher, Rejection, WorkflowAction};
use crate::engine::{StateMachine, Transition};
use crate::outbound::{Outbound, RecordingOutbound};
use crate::retry::RetryController;
use crate::trigger::TriggerParser;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wuselig_audit::{AuditEntry, AuditLog, AuditOutcome};
use wuselig_core::{Effect, Event, WorkItemId, WuseligResult};
use wuselig_store::{InMemoryWorkflowStore, WorkflowState, WorkflowStore};

/// What handling one event did.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub action: WorkflowAction,
    /// The stored state after handling, `None` if the work item has no workflow.
    pub state: Option<WorkflowState>,
    /// Effects handed to the outbound sink while handling this event.
    pub delivered: usize,
    /// Compare-and-swap attempts lost to concurrent writers.
    pub cas_retries: u32,
}

/// Drives events through dispatcher, state machine and store.
///
/// Holds no per-work-item state of its own: every decision is made against
/// state freshly read from the store, and every write is version-checked.
pub struct Orchestrator {
    store: Arc<dyn WorkflowStore>,
    dispatcher: Dispatcher,
    engine: StateMachine,
    outbound: Arc<dyn Outbound>,
    audit: Arc<AuditLog>,
    max_cas_attempts: u32,
}

impl Orchestrator {
    pub fn new(
        config: &OrchestratorConfig,
        store: Arc<dyn WorkflowStore>,
        outbound: Arc<dyn Outbound>,
        audit: Arc<AuditLog>,
    ) -> WuseligResult<Self> {
        config.validate()?;
        let parser = TriggerParser::new(config.triggers.clone())?;
        let retry = RetryController::new(config.retry.clone());
        Ok(Self {
            store,
            dispatcher: Dispatcher::new(parser, retry.clone(), config.agents.iter().copied()),
            engine: StateMachine::new(retry, config.triggers.escalation_label.clone()),
            outbound,
            audit,
            max_cas_attempts: config.max_cas_attempts,
        })
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Handle one inbound event.
    ///
    /// Safe to call any number of times with the same event and from
    /// concurrent tasks. An `Err` means the event was not applied; it has
    /// already been audited. Redeliver it if the error is transient.
    pub async fn handle(&self, event: &Event) -> WuseligResult<Outcome> {
        match self.try_handle(event).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let outcome = if e.is_conflict() {
                    AuditOutcome::Conflict
                } else {
                    AuditOutcome::Error
                };
                warn!(
                    delivery_id = %event.delivery_id,
                    work_item = %event.work_item,
                    error = %e,
                    "event not applied"
                );
                self.audit.log(audit_entry(
                    event,
                    "none".to_string(),
                    None,
                    None,
                    outcome,
                    Some(e.to_string()),
                ));
                Err(e)
            }
        }
    }

    async fn try_handle(&self, event: &Event) -> WuseligResult<Outcome> {
        // Undelivered effects stay in the outbox and are carried by the next write.
        if let Err(e) = self.flush_outbox(&event.work_item).await {
            warn!(work_item = %event.work_item, error = %e, "pending effects not delivered");
        }

        let mut cas_retries = 0;
        loop {
            let current = self.store.get(&event.work_item).await?;
            let action = self.dispatcher.dispatch(event, current.as_ref());
            let transition = self.engine.apply(current.as_ref(), event, &action)?;

            match transition {
                Transition::Unchanged => {
                    self.audit.log(audit_entry(
                        event,
                        action.to_string(),
                        current.as_ref(),
                        current.as_ref(),
                        AuditOutcome::NoOp,
                        None,
                    ));
                    return Ok(Outcome {
                        action,
                        state: current,
                        delivered: 0,
                        cas_retries,
                    });
                }
                Transition::Emit(effects) => {
                    let delivered = self.deliver_all(&effects).await?;
                    self.audit.log(audit_entry(
                        event,
                        action.to_string(),
                        None,
                        None,
                        AuditOutcome::Rejected,
                        rejection_detail(&action),
                    ));
                    return Ok(Outcome {
                        action,
                        state: None,
                        delivered,
                        cas_retries,
                    });
                }
                Transition::Write { expected, state } => {
                    match self.store.compare_and_swap(expected, &state).await {
                        Ok(()) => {}
                        Err(e) if e.is_conflict() && cas_retries + 1 < self.max_cas_attempts => {
                            cas_retries += 1;
                            debug!(
                                delivery_id = %event.delivery_id,
                                work_item = %event.work_item,
                                attempt = cas_retries,
                                "lost compare-and-swap, re-reading state"
                            );
                            continue;
                        }
                        Err(e) => return Err(e),
                    }

                    let outcome = if matches!(action, WorkflowAction::Reject(_)) {
                        AuditOutcome::Rejected
                    } else {
                        AuditOutcome::Applied
                    };
                    info!(
                        delivery_id = %event.delivery_id,
                        work_item = %event.work_item,
                        action = %action,
                        phase = %state.phase,
                        version = state.version,
                        "transition written"
                    );
                    self.audit.log(audit_entry(
                        event,
                        action.to_string(),
                        current.as_ref(),
                        Some(&state),
                        outcome,
                        rejection_detail(&action),
                    ));

                    // Effects are committed with the state; a failed delivery
                    // is picked up by the next event or by `recover`.
                    let (state, delivered) = match self.flush(state.clone()).await {
                        Ok(flushed) => flushed,
                        Err(e) => {
                            warn!(work_item = %event.work_item, error = %e, "outbox delivery deferred");
                            (state, 0)
                        }
                    };
                    return Ok(Outcome {
                        action,
                        state: Some(state),
                        delivered,
                        cas_retries,
                    });
                }
            }
        }
    }

    /// Deliver and clear the pending outbox of one work item.
    pub async fn flush_outbox(&self, work_item: &WorkItemId) -> WuseligResult<usize> {
        match self.store.get(work_item).await? {
            Some(state) if !state.outbox.is_empty() => {
                self.flush(state).await.map(|(_, delivered)| delivered)
            }
            _ => Ok(0),
        }
    }

    /// Deliver what can be delivered and keep the rest pending.
    ///
    /// Fails only if not a single effect went out.
    async fn flush(&self, state: WorkflowState) -> WuseligResult<(WorkflowState, usize)> {
        if state.outbox.is_empty() {
            return Ok((state, 0));
        }
        let mut pending = Vec::new();
        let mut last_error = None;
        for effect in &state.outbox {
            if let Err(e) = self.deliver(effect).await {
                pending.push(effect.clone());
                last_error = Some(e);
            }
        }
        let delivered = state.outbox.len() - pending.len();
        if let Some(e) = last_error {
            if delivered == 0 {
                return Err(e);
            }
            warn!(
                work_item = %state.work_item_id,
                pending = pending.len(),
                error = %e,
                "some effects deferred"
            );
        }

        let mut cleared = state.clone();
        cleared.outbox = pending;
        cleared.version = state.next_version();
        cleared.last_updated = Utc::now();
        match self
            .store
            .compare_and_swap(state.expected_version(), &cleared)
            .await
        {
            Ok(()) => Ok((cleared, delivered)),
            Err(e) if e.is_conflict() => {
                // The newer record still carries these effects; its writer flushes them.
                debug!(work_item = %state.work_item_id, "outbox taken over by a newer write");
                Ok((state, delivered))
            }
            Err(e) => Err(e),
        }
    }

    async fn deliver_all(&self, effects: &[Effect]) -> WuseligResult<usize> {
        for effect in effects {
            self.deliver(effect).await?;
        }
        Ok(effects.len())
    }

    async fn deliver(&self, effect: &Effect) -> WuseligResult<()> {
        debug!(
            effect = effect.name(),
            work_item = %effect.work_item(),
            key = %effect.idempotency_key(),
            "delivering effect"
        );
        self.outbound.deliver(effect).await
    }

    /// Deliver every pending outbox in the store. Run after a restart.
    pub async fn recover(&self) -> WuseligResult<usize> {
        let mut total = 0;
        for id in self.store.list().await? {
            match self.flush_outbox(&id).await {
                Ok(n) => total += n,
                Err(e) => warn!(work_item = %id, error = %e, "recovery flush failed"),
            }
        }
        if total > 0 {
            info!(delivered = total, "recovered pending effects");
        }
        Ok(total)
    }

    /// Rebuild a workflow from a recorded history against an empty in-memory store.
    ///
    /// Effects produced along the way are captured, not delivered.
    pub async fn replay(&self, history: &[Event]) -> WuseligResult<Option<WorkflowState>> {
        let Some(first) = history.first() else {
            return Ok(None);
        };
        let store = Arc::new(InMemoryWorkflowStore::new());
        let sandbox = Orchestrator {
            store: store.clone(),
            dispatcher: self.dispatcher.clone(),
            engine: self.engine.clone(),
            outbound: Arc::new(RecordingOutbound::new()),
            audit: Arc::new(AuditLog::in_memory()),
            max_cas_attempts: self.max_cas_attempts,
        };
        for event in history {
            sandbox.handle(event).await?;
        }
        store.get(&first.work_item).await
    }
}

fn rejection_detail(action: &WorkflowAction) -> Option<String> {
    match action {
        WorkflowAction::Reject(
            Rejection::Conflict(msg) | Rejection::Permanent(msg) | Rejection::HumanEscalation(msg),
        ) => Some(msg.clone()),
        _ => None,
    }
}

fn audit_entry(
    event: &Event,
    action: String,
    before: Option<&WorkflowState>,
    after: Option<&WorkflowState>,
    outcome: AuditOutcome,
    detail: Option<String>,
) -> AuditEntry {
    AuditEntry {
        timestamp: Utc::now(),
        delivery_id: event.delivery_id.clone(),
        work_item: event.work_item.clone(),
        event_type: event.type_name().to_string(),
        action,
        phase_before: before.map(|s| s.phase),
        phase_after: after.map(|s| s.phase),
        version: after.map(|s| s.version),
        outcome,
        detail,
    }
}
