use crate::retry::RetryPolicy;
use crate::trigger::TriggerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use wuselig_core::{AgentKind, WuseligError, WuseligResult};

/// Limits for agent invocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokerConfig {
    /// Hard limit for one invocation; longer runs become transient failures.
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
}

fn default_max_duration_secs() -> u64 {
    6 * 60 * 60
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: default_max_duration_secs(),
        }
    }
}

impl InvokerConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }
}

/// Everything the orchestrator needs besides its store, sinks and executors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub invoker: InvokerConfig,
    #[serde(default)]
    pub triggers: TriggerConfig,
    /// Agent kinds that may be triggered. Triggers for other kinds are rejected.
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentKind>,
    /// How often one event re-reads state after losing a compare-and-swap.
    #[serde(default = "default_max_cas_attempts")]
    pub max_cas_attempts: u32,
}

fn default_agents() -> Vec<AgentKind> {
    AgentKind::ALL.to_vec()
}

fn default_max_cas_attempts() -> u32 {
    8
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            invoker: InvokerConfig::default(),
            triggers: TriggerConfig::default(),
            agents: default_agents(),
            max_cas_attempts: default_max_cas_attempts(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(s: &str) -> WuseligResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| WuseligError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> WuseligResult<()> {
        if self.max_cas_attempts == 0 {
            return Err(WuseligError::Config(
                "max_cas_attempts must be at least 1".into(),
            ));
        }
        if self.invoker.max_duration_secs == 0 {
            return Err(WuseligError::Config(
                "invoker.max_duration_secs must be at least 1".into(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(WuseligError::Config(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }
        if self.agents.is_empty() {
            return Err(WuseligError::Config("no agents enabled".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.agents.len(), 5);
        assert_eq!(config.invoker.max_duration(), Duration::from_secs(21_600));
    }

    #[test]
    fn test_partial_sections() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
agents = ["planner", "coder"]
max_cas_attempts = 3

[retry]
max_retries = 5

[triggers]
command = "/bot"
"#,
        )
        .unwrap();
        assert_eq!(config.agents, vec![AgentKind::Planner, AgentKind::Coder]);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 30_000);
        assert_eq!(config.triggers.command, "/bot");
        assert_eq!(config.triggers.label_prefix, "agent:");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(OrchestratorConfig::from_toml_str("max_cas_attempts = 0").is_err());
        assert!(OrchestratorConfig::from_toml_str("agents = []").is_err());
        assert!(OrchestratorConfig::from_toml_str("agents = [\"deployer\"]").is_err());
        assert!(OrchestratorConfig::from_toml_str(
            "[retry]\nbase_delay_ms = 10\nmax_delay_ms = 5"
        )
        .is_err());
    }
}
