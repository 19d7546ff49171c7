//! Streaming event types and utilities

use crate::error::{Error, Result};
use crate::types::{FinishReason, Message, Model, ToolSpec, Usage};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// Events emitted while a model response streams in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// A generation step began
    StartStep,
    /// Text content started
    TextStart { id: String },
    /// Text content delta
    TextDelta { id: String, text: String },
    /// Text content completed
    TextEnd { id: String },
    /// The model requested a tool call
    ToolCall {
        call_id: String,
        tool: String,
        input: serde_json::Value,
    },
    /// A tool call finished successfully
    ToolResult {
        call_id: String,
        title: String,
        output: String,
        #[serde(default)]
        metadata: serde_json::Value,
    },
    /// A tool call failed
    ToolError { call_id: String, error: String },
    /// A generation step finished
    FinishStep {
        finish_reason: FinishReason,
        usage: Usage,
    },
    /// The whole response finished
    Finish {
        finish_reason: FinishReason,
        usage: Usage,
    },
    /// The stream faulted
    Error { message: String },
}

impl StreamEvent {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::StartStep => "start-step",
            StreamEvent::TextStart { .. } => "text-start",
            StreamEvent::TextDelta { .. } => "text-delta",
            StreamEvent::TextEnd { .. } => "text-end",
            StreamEvent::ToolCall { .. } => "tool-call",
            StreamEvent::ToolResult { .. } => "tool-result",
            StreamEvent::ToolError { .. } => "tool-error",
            StreamEvent::FinishStep { .. } => "finish-step",
            StreamEvent::Finish { .. } => "finish",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// Check if this is a terminal event (Finish or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Finish { .. } | StreamEvent::Error { .. })
    }
}

/// A stream of model events
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Everything a model needs to produce one response
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub model: Model,
    /// System prompt segments, in order
    pub system: Vec<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl StreamRequest {
    /// A request without tools or sampling overrides
    pub fn new(model: Model, system: Vec<String>, messages: Vec<Message>) -> Self {
        Self {
            model,
            system,
            messages,
            tools: vec![],
            temperature: None,
            top_p: None,
            max_tokens: None,
        }
    }
}

/// Drain a stream, concatenating its text deltas.
///
/// Fails on the first `Error` event. Tool events are ignored.
pub async fn collect_text(mut stream: EventStream) -> Result<String> {
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::TextDelta { text: delta, .. } => text.push_str(&delta),
            StreamEvent::Error { message } => return Err(Error::Stream(message)),
            _ => {}
        }
    }
    Ok(text)
}
