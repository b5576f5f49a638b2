use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use wuselig_core::{AgentKind, AgentResult, AgentTask, WuseligResult};

/// Something that can run an agent task in the isolated execution environment.
///
/// Implementations must derive every side effect's idempotency key from
/// [`AgentTask::idempotency_key`], since a task may be executed more than once.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run the agent. An `Err` is classified with [`wuselig_core::WuseligError::kind`].
    async fn execute(&self, task: &AgentTask) -> WuseligResult<AgentResult>;
}

/// Maps each agent kind to its executor.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    executors: HashMap<AgentKind, Arc<dyn AgentExecutor>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: AgentKind, executor: Arc<dyn AgentExecutor>) {
        info!(agent = %agent, "Registered agent executor");
        self.executors.insert(agent, executor);
    }

    pub fn get(&self, agent: AgentKind) -> Option<&Arc<dyn AgentExecutor>> {
        self.executors.get(&agent)
    }

    pub fn is_registered(&self, agent: AgentKind) -> bool {
        self.executors.contains_key(&agent)
    }

    /// Registered kinds, in workflow order.
    pub fn kinds(&self) -> Vec<AgentKind> {
        AgentKind::ALL
            .iter()
            .copied()
            .filter(|k| self.executors.contains_key(k))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct Nop;

    #[async_trait]
    impl AgentExecutor for Nop {
        async fn execute(&self, _task: &AgentTask) -> WuseligResult<AgentResult> {
            Ok(AgentResult::success(Vec::new()))
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = AgentRegistry::new();
        registry.register(AgentKind::Tester, Arc::new(Nop));
        registry.register(AgentKind::Planner, Arc::new(Nop));
        assert!(registry.is_registered(AgentKind::Planner));
        assert!(registry.get(AgentKind::Coder).is_none());
        assert_eq!(registry.kinds(), vec![AgentKind::Planner, AgentKind::Tester]);
    }
}
