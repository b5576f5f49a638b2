use serde::{Deserialize, Serialize};

/// A step of the per-work-item workflow.
///
/// The canonical sequence is
/// `Created → Planning → AwaitingApproval → Coding → Reviewing → Testing → Documenting → Completed`.
/// `Failed` is reachable from every non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Virtual initial phase; never persisted as the phase of a live workflow.
    Created,
    /// The planner drafts an implementation plan.
    Planning,
    /// Blocked until a human approves the plan.
    AwaitingApproval,
    /// The coder implements the plan.
    Coding,
    /// The reviewer inspects the change.
    Reviewing,
    /// The tester exercises the change.
    Testing,
    /// The documenter updates documentation.
    Documenting,
    /// Terminal: the workflow finished.
    Completed,
    /// Terminal: cancelled or escalated to a human.
    Failed,
}

impl Phase {
    /// The canonical sequence, in order.
    pub const SEQUENCE: [Phase; 8] = [
        Phase::Created,
        Phase::Planning,
        Phase::AwaitingApproval,
        Phase::Coding,
        Phase::Reviewing,
        Phase::Testing,
        Phase::Documenting,
        Phase::Completed,
    ];

    /// The phase that follows this one in the canonical sequence.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Created => Some(Phase::Planning),
            Phase::Planning => Some(Phase::AwaitingApproval),
            Phase::AwaitingApproval => Some(Phase::Coding),
            Phase::Coding => Some(Phase::Reviewing),
            Phase::Reviewing => Some(Phase::Testing),
            Phase::Testing => Some(Phase::Documenting),
            Phase::Documenting => Some(Phase::Completed),
            Phase::Completed | Phase::Failed => None,
        }
    }

    /// Position in the canonical sequence. `Failed` has no position.
    pub fn rank(self) -> Option<usize> {
        Self::SEQUENCE.iter().position(|p| *p == self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    /// The agent that owns this phase, if any.
    pub fn owner(self) -> Option<AgentKind> {
        AgentKind::ALL.iter().copied().find(|a| a.phase_owned() == self)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Created => "created",
            Phase::Planning => "planning",
            Phase::AwaitingApproval => "awaiting_approval",
            Phase::Coding => "coding",
            Phase::Reviewing => "reviewing",
            Phase::Testing => "testing",
            Phase::Documenting => "documenting",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The closed set of agent types.
///
/// Each kind owns exactly one phase. Executors are attached to kinds at runtime
/// through a registry, so adding an executor never touches dispatch logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Drafts the plan.
    Planner,
    /// Writes the code.
    Coder,
    /// Reviews the change.
    Reviewer,
    /// Writes and runs tests.
    Tester,
    /// Writes documentation.
    Documenter,
}

impl AgentKind {
    /// Every agent kind, in canonical phase order.
    pub const ALL: [AgentKind; 5] = [
        AgentKind::Planner,
        AgentKind::Coder,
        AgentKind::Reviewer,
        AgentKind::Tester,
        AgentKind::Documenter,
    ];

    /// Name used in labels (`agent:<name>`) and commands (`/wuselig <name>`).
    pub fn name(self) -> &'static str {
        match self {
            AgentKind::Planner => "planner",
            AgentKind::Coder => "coder",
            AgentKind::Reviewer => "reviewer",
            AgentKind::Tester => "tester",
            AgentKind::Documenter => "documenter",
        }
    }

    /// Parse an agent name, case-insensitively.
    pub fn from_name(name: &str) -> Option<AgentKind> {
        let lower = name.trim().to_lowercase();
        Self::ALL.iter().copied().find(|a| a.name() == lower)
    }

    pub fn phase_owned(self) -> Phase {
        match self {
            AgentKind::Planner => Phase::Planning,
            AgentKind::Coder => Phase::Coding,
            AgentKind::Reviewer => Phase::Reviewing,
            AgentKind::Tester => Phase::Testing,
            AgentKind::Documenter => Phase::Documenting,
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_sequence_is_linear() {
        for pair in Phase::SEQUENCE.windows(2) {
            assert_eq!(pair[0].next(), Some(pair[1]));
        }
        assert_eq!(Phase::Completed.next(), None);
        assert_eq!(Phase::Failed.next(), None);
    }

    #[test]
    fn test_phase_owner_roundtrip() {
        for agent in AgentKind::ALL {
            assert_eq!(agent.phase_owned().owner(), Some(agent));
        }
        assert_eq!(Phase::AwaitingApproval.owner(), None);
        assert_eq!(Phase::Completed.owner(), None);
    }

    #[test]
    fn test_agent_from_name() {
        assert_eq!(AgentKind::from_name("Planner"), Some(AgentKind::Planner));
        assert_eq!(AgentKind::from_name(" coder "), Some(AgentKind::Coder));
        assert_eq!(AgentKind::from_name("deployer"), None);
    }

    #[test]
    fn test_terminal_phases() {
        assert!(Phase::Completed.is_terminal());
        assert!(Phase::Failed.is_terminal());
        assert!(!Phase::AwaitingApproval.is_terminal());
        assert_eq!(Phase::Failed.rank(), None);
        assert!(Phase::Coding.rank() > Phase::Planning.rank());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::AwaitingApproval.to_string(), "awaiting_approval");
        assert_eq!(AgentKind::Documenter.to_string(), "documenter");
    }
}
