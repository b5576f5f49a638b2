//! Audit trail for the Wuselig orchestrator.
//!
//! Every handled event is recorded together with the action the dispatcher
//! chose and the state that resulted, keyed by the event's delivery id. The
//! log is append-only JSON lines and can be read back for debugging and replay.
//!
//! # Main types
//!
//! - [`AuditLog`]: Append-only audit trail persisted to disk (or kept in memory).
//! - [`AuditEntry`]: One `(event, action, resulting state)` record.
//! - [`AuditOutcome`]: How the event was resolved.

/// Audit logging module.
pub mod audit;

pub use audit::{read_entries, AuditEntry, AuditLog, AuditOutcome, AUDIT_FILE};
