use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single turn in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// A single planned unit of work, optionally naming a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_id: usize,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_tool: Option<String>,
}

/// Outcome of one executed plan step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// The step completed as planned.
    Ok,
    /// The named tool failed; free-form reasoning substituted.
    Fallback,
    /// Neither the tool nor the reasoning fallback produced output.
    Failed,
}

/// Record of one consumed plan step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedStep {
    pub step_id: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_used: Option<String>,
    pub raw_output: String,
    pub status: StepStatus,
}

/// Which workflow stage an error was recorded in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStage {
    Plan,
    Execute,
    Synthesize,
}

impl std::fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Plan => "plan",
            Self::Execute => "execute",
            Self::Synthesize => "synthesize",
        };
        write!(f, "{}", s)
    }
}

/// One entry in a turn's error log. Append-only; never cleared mid-turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub stage: ErrorStage,
    pub message: String,
}

/// A manual passage returned by the retrieval index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub content: String,
    pub source: String,
    pub score: f64,
}

/// Workflow stages. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Planning,
    Executing,
    Synthesizing,
    Done,
    Failed,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Synthesizing => "synthesizing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of progress event emitted during a turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Started,
    Token,
    ToolCall,
    Completed,
    Error,
}

/// An incremental progress event streamed to the caller.
///
/// A `completed` or `error` event for a terminal stage is end-of-stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub kind: ProgressKind,
    pub payload: serde_json::Value,
}

impl ProgressEvent {
    pub fn new(stage: Stage, kind: ProgressKind, payload: serde_json::Value) -> Self {
        Self {
            stage,
            kind,
            payload,
        }
    }
}

/// Result of a tool execution.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Tool definition surfaced to the planner prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_display() {
        let sid = SessionId::from_str("abc-123");
        assert_eq!(sid.to_string(), "abc-123");
    }

    #[test]
    fn test_chat_message_constructors() {
        let msg = ChatMessage::user("hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "hello");
        assert!(msg.timestamp.is_some());
    }

    #[test]
    fn test_stage_terminal() {
        assert!(Stage::Done.is_terminal());
        assert!(Stage::Failed.is_terminal());
        assert!(!Stage::Planning.is_terminal());
        assert!(!Stage::Executing.is_terminal());
        assert!(!Stage::Synthesizing.is_terminal());
    }

    #[test]
    fn test_error_stage_display() {
        assert_eq!(ErrorStage::Execute.to_string(), "execute");
    }

    #[test]
    fn test_progress_event_serialization() {
        let ev = ProgressEvent::new(
            Stage::Executing,
            ProgressKind::ToolCall,
            serde_json::json!({"tool": "manual_lookup"}),
        );
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"executing\""));
        assert!(json.contains("tool_call"));
    }

    #[test]
    fn test_plan_step_roundtrip() {
        let step = PlanStep {
            step_id: 0,
            description: "Look up the reset procedure".into(),
            suggested_tool: Some("manual_lookup".into()),
        };
        let json = serde_json::to_string(&step).unwrap();
        let parsed: PlanStep = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.suggested_tool.as_deref(), Some("manual_lookup"));
    }
}
