//! Durable conversation records: sessions, messages and parts

use rho_ai::{FinishReason, Usage};
use serde::{Deserialize, Serialize};

use crate::id::{self, prefix};

pub const DEFAULT_TITLE: &str = "New Session";

/// Diff totals recorded on a session by compaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub additions: u32,
    pub deletions: u32,
    pub files: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTime {
    pub created: i64,
    pub updated: i64,
}

/// A conversation between a user and one or more agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub project_id: String,
    pub directory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SessionSummary>,
    pub time: SessionTime,
}

/// Input for creating a session
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub project_id: String,
    pub directory: String,
    pub title: Option<String>,
    pub agent: Option<String>,
}

impl NewSession {
    pub fn new(project_id: impl Into<String>, directory: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            directory: directory.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTime {
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub id: String,
    pub session_id: String,
    pub content: String,
    pub time: MessageTime,
}

/// One model turn. Created empty, filled in by the stream processor and
/// sealed by setting `time.completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set on compaction summaries
    #[serde(default)]
    pub summary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// `provider/model` that produced the turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<Usage>,
    pub time: MessageTime,
}

impl AssistantMessage {
    pub fn is_sealed(&self) -> bool {
        self.time.completed.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
}

impl Message {
    /// A fresh user message
    pub fn user(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message::User(UserMessage {
            id: id::ascending(prefix::MESSAGE),
            session_id: session_id.into(),
            content: content.into(),
            time: MessageTime {
                created: id::now(),
                completed: None,
            },
        })
    }

    /// A fresh, empty assistant message
    pub fn assistant(session_id: impl Into<String>) -> Self {
        Message::Assistant(AssistantMessage {
            id: id::ascending(prefix::MESSAGE),
            session_id: session_id.into(),
            finish: None,
            error: None,
            summary: false,
            agent: None,
            model: None,
            tokens: None,
            time: MessageTime {
                created: id::now(),
                completed: None,
            },
        })
    }

    pub fn id(&self) -> &str {
        match self {
            Message::User(m) => &m.id,
            Message::Assistant(m) => &m.id,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Message::User(m) => &m.session_id,
            Message::Assistant(m) => &m.session_id,
        }
    }

    pub fn created(&self) -> i64 {
        match self {
            Message::User(m) => m.time.created,
            Message::Assistant(m) => m.time.created,
        }
    }

    pub fn as_user(&self) -> Option<&UserMessage> {
        match self {
            Message::User(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Message::Assistant(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_assistant_mut(&mut self) -> Option<&mut AssistantMessage> {
        match self {
            Message::Assistant(m) => Some(m),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPart {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    /// When pruning replaced the output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted: Option<i64>,
}

/// Lifecycle of one tool call: `pending -> running -> completed | failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    pub status: ToolStatus,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub time: ToolTime,
}

impl ToolState {
    pub fn pending() -> Self {
        Self {
            status: ToolStatus::Pending,
            input: serde_json::Value::Null,
            output: None,
            error: None,
            title: None,
            metadata: None,
            time: ToolTime::default(),
        }
    }

    pub fn running(input: serde_json::Value, start: i64) -> Self {
        Self {
            status: ToolStatus::Running,
            input,
            time: ToolTime {
                start: Some(start),
                ..Default::default()
            },
            ..Self::pending()
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ToolStatus::Completed | ToolStatus::Failed)
    }

    /// Move to `completed`. Terminal states are never re-opened; returns
    /// whether the transition happened.
    pub fn complete(
        &mut self,
        output: String,
        title: Option<String>,
        metadata: Option<serde_json::Value>,
        end: i64,
    ) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = ToolStatus::Completed;
        self.output = Some(output);
        self.error = None;
        if title.is_some() {
            self.title = title;
        }
        if metadata.is_some() {
            self.metadata = metadata;
        }
        self.time.end = Some(end);
        true
    }

    /// Move to `failed`. Terminal states are never re-opened; returns whether
    /// the transition happened.
    pub fn fail(&mut self, error: String, end: i64) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = ToolStatus::Failed;
        self.error = Some(error);
        self.time.end = Some(end);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPart {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub state: ToolState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStartPart {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFinishPart {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    pub reason: FinishReason,
    #[serde(default)]
    pub tokens: Usage,
}

/// A piece of a message, in creation order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text(TextPart),
    Tool(ToolPart),
    StepStart(StepStartPart),
    StepFinish(StepFinishPart),
}

impl Part {
    pub fn text(
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Part::Text(TextPart {
            id: id::ascending(prefix::PART),
            session_id: session_id.into(),
            message_id: message_id.into(),
            text: text.into(),
        })
    }

    pub fn tool(
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        tool: impl Into<String>,
        call_id: Option<String>,
        state: ToolState,
    ) -> Self {
        Part::Tool(ToolPart {
            id: id::ascending(prefix::PART),
            session_id: session_id.into(),
            message_id: message_id.into(),
            tool: tool.into(),
            call_id,
            state,
        })
    }

    pub fn step_start(
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        snapshot: Option<String>,
    ) -> Self {
        Part::StepStart(StepStartPart {
            id: id::ascending(prefix::PART),
            session_id: session_id.into(),
            message_id: message_id.into(),
            snapshot,
        })
    }

    pub fn step_finish(
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        snapshot: Option<String>,
        reason: FinishReason,
        tokens: Usage,
    ) -> Self {
        Part::StepFinish(StepFinishPart {
            id: id::ascending(prefix::PART),
            session_id: session_id.into(),
            message_id: message_id.into(),
            snapshot,
            reason,
            tokens,
        })
    }

    pub fn id(&self) -> &str {
        match self {
            Part::Text(p) => &p.id,
            Part::Tool(p) => &p.id,
            Part::StepStart(p) => &p.id,
            Part::StepFinish(p) => &p.id,
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            Part::Text(p) => &p.message_id,
            Part::Tool(p) => &p.message_id,
            Part::StepStart(p) => &p.message_id,
            Part::StepFinish(p) => &p.message_id,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Part::Text(p) => &p.session_id,
            Part::Tool(p) => &p.session_id,
            Part::StepStart(p) => &p.session_id,
            Part::StepFinish(p) => &p.session_id,
        }
    }

    pub fn as_text(&self) -> Option<&TextPart> {
        match self {
            Part::Text(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_tool(&self) -> Option<&ToolPart> {
        match self {
            Part::Tool(p) => Some(p),
            _ => None,
        }
    }

    /// Whether this is a tool call that has not settled yet
    pub fn is_unsettled_tool(&self) -> bool {
        matches!(
            self,
            Part::Tool(ToolPart { state, .. })
                if matches!(state.status, ToolStatus::Pending | ToolStatus::Running)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_state_lifecycle() {
        let mut state = ToolState::running(serde_json::json!({"path": "a.rs"}), 10);
        assert_eq!(state.status, ToolStatus::Running);
        assert!(state.complete("ok".into(), Some("Read a.rs".into()), None, 20));
        assert_eq!(state.status, ToolStatus::Completed);
        assert_eq!(state.time.end, Some(20));
        assert_eq!(state.title.as_deref(), Some("Read a.rs"));
    }

    #[test]
    fn test_terminal_tool_state_is_never_reopened() {
        let mut state = ToolState::running(serde_json::Value::Null, 1);
        assert!(state.fail("boom".into(), 2));
        assert!(!state.complete("late".into(), None, None, 3));
        assert_eq!(state.status, ToolStatus::Failed);
        assert!(state.output.is_none());
        assert_eq!(state.time.end, Some(2));
    }

    #[test]
    fn test_part_serializes_with_type_tag() {
        let part = Part::step_start("ses_1", "msg_1", Some("snap".into()));
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "step-start");
        assert_eq!(json["snapshot"], "snap");
        let back: Part = serde_json::from_value(json).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn test_message_accessors() {
        let user = Message::user("ses_1", "hi");
        assert!(user.as_user().is_some());
        assert_eq!(user.session_id(), "ses_1");
        let mut assistant = Message::assistant("ses_1");
        assistant.as_assistant_mut().unwrap().time.completed = Some(5);
        assert!(assistant.as_assistant().unwrap().is_sealed());
    }

    #[test]
    fn test_unsettled_tool() {
        let running = Part::tool(
            "s",
            "m",
            "bash",
            Some("c1".into()),
            ToolState::running(serde_json::Value::Null, 1),
        );
        assert!(running.is_unsettled_tool());
        assert!(!Part::text("s", "m", "hello").is_unsettled_tool());
    }
}
