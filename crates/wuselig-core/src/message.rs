use crate::phase::AgentKind;
use crate::task::Artifact;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MARKER_OPEN: &str = "<!-- wuselig:message ";
const MARKER_CLOSE: &str = " -->";

/// Purpose of an inter-agent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Work handed over to the next agent.
    Handoff,
    /// A question for another agent or a human.
    Question,
    /// Progress or outcome report.
    Report,
}

/// A message between agents.
///
/// There is no private channel: a message is a comment on the work item with
/// a machine-readable marker, so any agent sees every earlier message by
/// reading the work item's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub kind: MessageKind,
    pub sender_agent: AgentKind,
    /// `None` addresses everyone following the work item.
    #[serde(default)]
    pub recipient_agent: Option<AgentKind>,
    pub payload: serde_json::Value,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        sender_agent: AgentKind,
        recipient_agent: Option<AgentKind>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            sender_agent,
            recipient_agent,
            payload,
        }
    }

    /// Render as a comment body: a human-readable line followed by the marker.
    pub fn to_comment(&self) -> String {
        let recipient = self
            .recipient_agent
            .map(|a| a.to_string())
            .unwrap_or_else(|| "everyone".to_string());
        // Serializing a struct of plain fields cannot fail.
        let json = serde_json::to_string(self).unwrap_or_default();
        format!(
            "**{}** → **{}** ({:?})\n\n{MARKER_OPEN}{json}{MARKER_CLOSE}",
            self.sender_agent, recipient, self.kind
        )
    }

    /// Wrap as a comment artifact carrying the given idempotency key.
    pub fn into_artifact(self, idempotency_key: impl Into<String>) -> Artifact {
        Artifact::comment(self.to_comment(), idempotency_key)
    }

    /// Extract a message from a comment body, if it carries one.
    pub fn parse(body: &str) -> Option<Message> {
        let start = body.find(MARKER_OPEN)? + MARKER_OPEN.len();
        let rest = body.get(start..)?;
        let end = rest.rfind(MARKER_CLOSE)?;
        serde_json::from_str(rest.get(..end)?).ok()
    }

    /// Messages visible in a sequence of comment bodies, oldest first.
    pub fn thread<'a>(bodies: impl IntoIterator<Item = &'a str>) -> Vec<Message> {
        bodies.into_iter().filter_map(Message::parse).collect()
    }

    /// Whether `agent` should read this message.
    pub fn is_for(&self, agent: AgentKind) -> bool {
        self.recipient_agent.map_or(true, |r| r == agent)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_message_comment_roundtrip() {
        let msg = Message::new(
            MessageKind::Handoff,
            AgentKind::Planner,
            Some(AgentKind::Coder),
            serde_json::json!({"plan": "add --verbose flag"}),
        );
        let body = msg.to_comment();
        assert!(body.starts_with("**planner** → **coder**"));
        assert_eq!(Message::parse(&body), Some(msg));
    }

    #[test]
    fn test_plain_comment_has_no_message() {
        assert_eq!(Message::parse("LGTM"), None);
        assert_eq!(Message::parse("<!-- wuselig:message not json -->"), None);
    }

    #[test]
    fn test_thread_filters_by_recipient() {
        let to_coder = Message::new(
            MessageKind::Handoff,
            AgentKind::Planner,
            Some(AgentKind::Coder),
            serde_json::Value::Null,
        );
        let broadcast = Message::new(
            MessageKind::Report,
            AgentKind::Coder,
            None,
            serde_json::json!("tests added"),
        );
        let bodies = [to_coder.to_comment(), "human chatter".to_string(), broadcast.to_comment()];
        let thread = Message::thread(bodies.iter().map(String::as_str));
        assert_eq!(thread.len(), 2);
        assert!(thread[0].is_for(AgentKind::Coder));
        assert!(!thread[0].is_for(AgentKind::Reviewer));
        assert!(thread[1].is_for(AgentKind::Reviewer));
    }

    #[test]
    fn test_into_artifact_keeps_key() {
        let msg = Message::new(
            MessageKind::Question,
            AgentKind::Reviewer,
            Some(AgentKind::Coder),
            serde_json::json!("why unsafe?"),
        );
        let artifact = msg.into_artifact("k-1");
        assert_eq!(artifact.idempotency_key, "k-1");
        assert!(Message::parse(&artifact.content).is_some());
    }
}
