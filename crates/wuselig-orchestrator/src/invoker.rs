use crate::registry::AgentRegistry;
use std::time::Duration;
use tracing::{info, warn};
use wuselig_core::{AgentResult, AgentTask, ErrorKind};

/// Runs agent tasks with a hard time limit.
///
/// Never fails: every outcome, including a timeout or a missing executor, is
/// expressed as an [`AgentResult`] that flows back into the dispatcher.
#[derive(Clone)]
pub struct AgentInvoker {
    registry: AgentRegistry,
    max_duration: Duration,
}

impl AgentInvoker {
    pub fn new(registry: AgentRegistry, max_duration: Duration) -> Self {
        Self {
            registry,
            max_duration,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    pub async fn invoke(&self, task: &AgentTask) -> AgentResult {
        let Some(executor) = self.registry.get(task.agent_type) else {
            warn!(agent = %task.agent_type, work_item = %task.work_item_id, "no executor registered");
            return AgentResult::failure(
                ErrorKind::Permanent,
                format!("no executor registered for agent `{}`", task.agent_type),
            );
        };

        info!(
            agent = %task.agent_type,
            work_item = %task.work_item_id,
            phase = %task.phase,
            retry_count = task.retry_count,
            "invoking agent"
        );

        match tokio::time::timeout(self.max_duration, executor.execute(task)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(agent = %task.agent_type, work_item = %task.work_item_id, error = %e, "agent failed");
                AgentResult::failure(e.kind(), e.to_string())
            }
            Err(_) => {
                warn!(
                    agent = %task.agent_type,
                    work_item = %task.work_item_id,
                    limit_secs = self.max_duration.as_secs(),
                    "agent timed out"
                );
                AgentResult::failure(
                    ErrorKind::Transient,
                    format!("timed out after {}s", self.max_duration.as_secs_f64()),
                )
            }
        }
    }
}
