//! Durable workflow state for the Wuselig orchestrator.
//!
//! One [`WorkflowState`] document per work item is the only state needed to
//! resume after a crash. Writes go through [`WorkflowStore::compare_and_swap`],
//! which succeeds only when the stored version equals the version the writer read.

pub mod file;
pub mod state;
pub mod store;

pub use file::FileWorkflowStore;
pub use state::{FailureReason, WorkflowState};
pub use store::{check_write, InMemoryWorkflowStore, WorkflowStore};
