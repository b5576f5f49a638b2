//! Recognition of label- and comment-based triggers.
//!
//! Labels (`agent:<name>`) and comment commands (`/wuselig <name> [args]`) are
//! interpreted identically: both produce a [`Signal`], and the dispatcher only
//! ever sees signals.

use regex::Regex;
use serde::{Deserialize, Serialize};
use wuselig_core::{
    AgentKind, ErrorKind, Event, EventKind, EventSource, Phase, PullRequestAction, WuseligError,
    WuseligResult,
};

/// Label and command syntax.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Prefix of agent labels.
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,
    /// Command word that starts a comment command.
    #[serde(default = "default_command")]
    pub command: String,
    /// Label a human adds to approve a plan.
    #[serde(default = "default_approval_label")]
    pub approval_label: String,
    /// Label added to a work item whose workflow was escalated to a human.
    #[serde(default = "default_escalation_label")]
    pub escalation_label: String,
}

fn default_label_prefix() -> String {
    "agent:".to_string()
}

fn default_command() -> String {
    "/wuselig".to_string()
}

fn default_approval_label() -> String {
    "approved".to_string()
}

fn default_escalation_label() -> String {
    "wuselig:needs-human".to_string()
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            label_prefix: default_label_prefix(),
            command: default_command(),
            approval_label: default_approval_label(),
            escalation_label: default_escalation_label(),
        }
    }
}

/// What an event means for the workflow, independent of how it arrived.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// Start the phase owned by `agent`.
    Trigger {
        agent: AgentKind,
        args: Option<String>,
    },
    /// A trigger that can never succeed: malformed command or unknown agent.
    Invalid { reason: String },
    /// A human approves the plan.
    Approve,
    /// Stop the workflow.
    Cancel { by: String },
    /// The agent running `phase` attempt `retry_count` finished.
    Completed {
        agent: AgentKind,
        phase: Phase,
        retry_count: u32,
    },
    /// The agent running `phase` attempt `retry_count` failed.
    Failed {
        agent: AgentKind,
        phase: Phase,
        retry_count: u32,
        error: ErrorKind,
        message: Option<String>,
    },
    /// Irrelevant to the workflow.
    Ignore,
}

/// Turns events into signals.
#[derive(Debug, Clone)]
pub struct TriggerParser {
    config: TriggerConfig,
    command: Regex,
}

impl TriggerParser {
    pub fn new(config: TriggerConfig) -> WuseligResult<Self> {
        if config.label_prefix.is_empty() {
            return Err(WuseligError::Config("label_prefix must not be empty".into()));
        }
        if config.command.is_empty() || config.command.chars().any(char::is_whitespace) {
            return Err(WuseligError::Config(format!(
                "command must be a single word, got {:?}",
                config.command
            )));
        }
        let pattern = format!(
            r"^{}(?:\s+(?P<word>\S+)(?:\s+(?P<args>.*\S))?)?\s*$",
            regex::escape(&config.command)
        );
        let command = Regex::new(&pattern)
            .map_err(|e| WuseligError::Config(format!("invalid command pattern: {e}")))?;
        Ok(Self { config, command })
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    /// Interpret `event` given the agent currently active on the work item.
    pub fn interpret(&self, event: &Event, active_agent: Option<AgentKind>) -> Signal {
        match &event.kind {
            EventKind::LabelAdded { label } => self.label_added(label),
            EventKind::LabelRemoved { label } => {
                let removes_active = self
                    .agent_label(label)
                    .and_then(AgentKind::from_name)
                    .is_some_and(|agent| Some(agent) == active_agent);
                if removes_active {
                    Signal::Cancel {
                        by: source_name(&event.source),
                    }
                } else {
                    Signal::Ignore
                }
            }
            EventKind::CommentCreated { body } => self.comment(body, &event.source),
            EventKind::PullRequest { action } => match action {
                PullRequestAction::Closed => Signal::Cancel {
                    by: source_name(&event.source),
                },
                PullRequestAction::Opened | PullRequestAction::Merged => Signal::Ignore,
            },
            EventKind::AgentCompleted {
                agent,
                phase,
                retry_count,
                ..
            } => Signal::Completed {
                agent: *agent,
                phase: *phase,
                retry_count: *retry_count,
            },
            EventKind::AgentFailed {
                agent,
                phase,
                retry_count,
                error,
                message,
            } => Signal::Failed {
                agent: *agent,
                phase: *phase,
                retry_count: *retry_count,
                error: *error,
                message: message.clone(),
            },
        }
    }

    fn agent_label<'a>(&self, label: &'a str) -> Option<&'a str> {
        label.trim().strip_prefix(self.config.label_prefix.as_str())
    }

    fn label_added(&self, label: &str) -> Signal {
        if label.trim() == self.config.approval_label {
            return Signal::Approve;
        }
        match self.agent_label(label) {
            Some(name) => agent_signal(name, None),
            None => Signal::Ignore,
        }
    }

    fn comment(&self, body: &str, source: &EventSource) -> Signal {
        let Some(line) = body.lines().map(str::trim).find(|l| !l.is_empty()) else {
            return Signal::Ignore;
        };
        let Some(caps) = self.command.captures(line) else {
            return Signal::Ignore;
        };
        let args = caps.name("args").map(|m| m.as_str().to_string());
        match caps.name("word").map(|m| m.as_str().to_lowercase()) {
            None => Signal::Invalid {
                reason: format!("malformed command: `{}` needs an agent type", self.config.command),
            },
            Some(word) if word == "approve" => Signal::Approve,
            Some(word) if word == "cancel" => Signal::Cancel {
                by: source_name(source),
            },
            Some(word) => agent_signal(&word, args),
        }
    }
}

fn agent_signal(name: &str, args: Option<String>) -> Signal {
    if name.trim().is_empty() {
        return Signal::Invalid {
            reason: "malformed trigger: missing agent type".to_string(),
        };
    }
    match AgentKind::from_name(name) {
        Some(agent) => Signal::Trigger { agent, args },
        None => Signal::Invalid {
            reason: format!("unrecognized agent type `{}`", name.trim()),
        },
    }
}

/// Human-readable name of whoever caused an event.
pub fn source_name(source: &EventSource) -> String {
    match source {
        EventSource::Human { login } => login.clone(),
        EventSource::Agent { agent } => agent.to_string(),
        EventSource::System => "system".to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wuselig_core::WorkItemId;

    fn parser() -> TriggerParser {
        TriggerParser::new(TriggerConfig::default()).unwrap()
    }

    fn item() -> WorkItemId {
        WorkItemId::new("acme/widgets", 42)
    }

    fn comment(body: &str) -> Event {
        Event::comment("d", item(), body, EventSource::human("octocat"))
    }

    fn label(label: &str) -> Event {
        Event::label_added("d", item(), label, EventSource::human("octocat"))
    }

    #[test]
    fn test_label_and_command_are_equivalent() {
        let p = parser();
        let from_label = p.interpret(&label("agent:planner"), None);
        let from_command = p.interpret(&comment("/wuselig planner"), None);
        assert_eq!(
            from_label,
            Signal::Trigger {
                agent: AgentKind::Planner,
                args: None
            }
        );
        assert_eq!(from_label, from_command);
    }

    #[test]
    fn test_command_with_args() {
        let p = parser();
        assert_eq!(
            p.interpret(&comment("  /wuselig Coder  focus on the parser  \nthanks!"), None),
            Signal::Trigger {
                agent: AgentKind::Coder,
                args: Some("focus on the parser".to_string())
            }
        );
    }

    #[test]
    fn test_malformed_and_unknown_commands() {
        let p = parser();
        assert!(matches!(
            p.interpret(&comment("/wuselig"), None),
            Signal::Invalid { .. }
        ));
        match p.interpret(&comment("/wuselig deployer now"), None) {
            Signal::Invalid { reason } => assert!(reason.contains("deployer")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            p.interpret(&label("agent:"), None),
            Signal::Invalid { .. }
        ));
    }

    #[test]
    fn test_non_commands_are_ignored() {
        let p = parser();
        assert_eq!(p.interpret(&comment("LGTM"), None), Signal::Ignore);
        assert_eq!(p.interpret(&comment("/wuseligx planner"), None), Signal::Ignore);
        assert_eq!(p.interpret(&comment("please /wuselig planner"), None), Signal::Ignore);
        assert_eq!(p.interpret(&comment(""), None), Signal::Ignore);
        assert_eq!(p.interpret(&label("bug"), None), Signal::Ignore);
    }

    #[test]
    fn test_approval_and_cancel() {
        let p = parser();
        assert_eq!(p.interpret(&label("approved"), None), Signal::Approve);
        assert_eq!(p.interpret(&comment("/wuselig approve"), None), Signal::Approve);
        assert_eq!(
            p.interpret(&comment("/wuselig cancel"), None),
            Signal::Cancel {
                by: "octocat".to_string()
            }
        );
    }

    #[test]
    fn test_label_removal_cancels_only_active_agent() {
        let p = parser();
        let removed = Event::new(
            "d",
            item(),
            EventKind::LabelRemoved {
                label: "agent:coder".into(),
            },
            EventSource::human("octocat"),
        );
        assert!(matches!(
            p.interpret(&removed, Some(AgentKind::Coder)),
            Signal::Cancel { .. }
        ));
        assert_eq!(p.interpret(&removed, Some(AgentKind::Planner)), Signal::Ignore);
        assert_eq!(p.interpret(&removed, None), Signal::Ignore);
    }

    #[test]
    fn test_closed_pull_request_cancels() {
        let p = parser();
        let closed = Event::new(
            "d",
            item(),
            EventKind::PullRequest {
                action: PullRequestAction::Closed,
            },
            EventSource::System,
        );
        assert_eq!(
            p.interpret(&closed, None),
            Signal::Cancel {
                by: "system".to_string()
            }
        );
    }

    #[test]
    fn test_custom_command_word() {
        let p = TriggerParser::new(TriggerConfig {
            command: "!bot".into(),
            ..TriggerConfig::default()
        })
        .unwrap();
        assert!(matches!(
            p.interpret(&comment("!bot tester"), None),
            Signal::Trigger {
                agent: AgentKind::Tester,
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_config() {
        assert!(TriggerParser::new(TriggerConfig {
            command: "/two words".into(),
            ..TriggerConfig::default()
        })
        .is_err());
        assert!(TriggerParser::new(TriggerConfig {
            label_prefix: String::new(),
            ..TriggerConfig::default()
        })
        .is_err());
    }
}
