//! Core types for model interactions

use serde::{Deserialize, Serialize};

/// Token limits of a model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimit {
    /// Context window size in tokens (0 = unknown)
    #[serde(default)]
    pub context: u32,
    /// Maximum output tokens (0 = unknown)
    #[serde(default)]
    pub output: u32,
}

/// What a model supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub reasoning: bool,
    #[serde(default = "default_true")]
    pub toolcall: bool,
    #[serde(default)]
    pub temperature: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            reasoning: false,
            toolcall: true,
            temperature: false,
        }
    }
}

/// Cost information for a model (per million tokens)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostInfo {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
}

/// Model definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Model identifier (e.g., "claude-sonnet-4-5")
    pub id: String,
    /// Provider the model is served by
    pub provider_id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub limit: ModelLimit,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub cost: CostInfo,
}

impl Model {
    /// Create a model descriptor with unknown limits
    pub fn new(provider_id: impl Into<String>, id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            provider_id: provider_id.into(),
            limit: ModelLimit::default(),
            capabilities: Capabilities::default(),
            cost: CostInfo::default(),
        }
    }

    /// Set the context and output limits
    pub fn with_limit(mut self, context: u32, output: u32) -> Self {
        self.limit = ModelLimit { context, output };
        self
    }

    /// `provider/model` form used in configuration
    pub fn qualified_id(&self) -> String {
        format!("{}/{}", self.provider_id, self.id)
    }
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input: u32,
    #[serde(default)]
    pub output: u32,
    #[serde(default)]
    pub cache_read: u32,
    #[serde(default)]
    pub cache_write: u32,
    /// Thinking/reasoning tokens
    #[serde(default)]
    pub reasoning: u32,
}

impl Usage {
    pub fn new(input: u32, output: u32) -> Self {
        Self {
            input,
            output,
            ..Default::default()
        }
    }

    /// Input plus output tokens
    pub fn total(&self) -> u32 {
        self.input.saturating_add(self.output)
    }
}

/// Reason why a generation step stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    /// Natural end of response
    Stop,
    /// Maximum tokens reached
    Length,
    /// The model wants its tool calls executed and another step
    ToolCalls,
    ContentFilter,
    Error,
    Other,
    Unknown,
}

impl FinishReason {
    /// Whether the model asked for another step
    pub fn wants_more(&self) -> bool {
        matches!(self, FinishReason::ToolCalls)
    }
}

/// Content blocks in model messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    /// Text content
    Text { text: String },
    /// Tool call request
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
}

impl Content {
    /// Create text content
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create a tool call
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Get text if this is text content
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Provider-neutral conversation message sent to a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User { content: Vec<Content> },
    Assistant { content: Vec<Content> },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl Message {
    /// Create a user message with text content
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: vec![Content::text(text)],
        }
    }

    /// Create a tool result message
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            output: output.into(),
            is_error,
        }
    }

    /// Get the role as a string
    pub fn role(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::ToolResult { .. } => "tool_result",
        }
    }

    /// Get combined text content
    pub fn text(&self) -> String {
        match self {
            Self::User { content } | Self::Assistant { content } => content
                .iter()
                .filter_map(|c| c.as_text())
                .collect::<Vec<_>>()
                .join(""),
            Self::ToolResult { output, .. } => output.clone(),
        }
    }
}

/// Tool definition advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name (used in API calls)
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema for parameters
    pub parameters: serde_json::Value,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}
