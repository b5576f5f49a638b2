//! Event-driven workflow orchestration for agent-assisted work items.
//!
//! Inbound events (labels, comments, pull request changes, agent results) are
//! classified by the [`Dispatcher`], applied by the [`StateMachine`], and
//! persisted with compare-and-swap by the [`Orchestrator`]. Nothing is held in
//! memory between events, so any number of orchestrator instances may handle
//! events for the same work item concurrently.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Read, decide, apply, write loop with outbox delivery and audit.
//! - [`Dispatcher`]: Pure mapping from `(event, state)` to a [`WorkflowAction`].
//! - [`StateMachine`]: Validates transitions and stages their effects.
//! - [`RetryController`]: Retry budget and exponential backoff with jitter.
//! - [`AgentInvoker`]: Runs an [`AgentExecutor`] under a hard time limit.
//! - [`Runtime`]: In-process event loop with local agent execution.

/// Orchestrator configuration.
pub mod config;
/// Event classification.
pub mod dispatcher;
/// Workflow state machine.
pub mod engine;
/// Time-bounded agent invocation.
pub mod invoker;
/// The per-event orchestration loop.
pub mod orchestrator;
/// Effect delivery sinks.
pub mod outbound;
/// Agent executor registry.
pub mod registry;
/// Retry budget and backoff.
pub mod retry;
/// In-process event loop.
pub mod runtime;
/// Label and comment trigger parsing.
pub mod trigger;

pub use config::{InvokerConfig, OrchestratorConfig};
pub use dispatcher::{Dispatcher, Rejection, WorkflowAction};
pub use engine::{StateMachine, Transition};
pub use invoker::AgentInvoker;
pub use orchestrator::{Orchestrator, Outcome};
pub use outbound::{read_outbox, JsonlOutbox, Outbound, OutboxRecord, RecordingOutbound};
pub use registry::{AgentExecutor, AgentRegistry};
pub use retry::{RetryController, RetryDecision, RetryPolicy};
pub use runtime::{order_window, EventQueue, LocalExecution, RunReport, Runtime};
pub use trigger::{Signal, TriggerConfig, TriggerParser};
