//! Shared fixtures: a scripted model, a few tools and a runtime factory
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rho_agent::config::Config;
use rho_agent::{
    BoxedTool, Event, EventKind, Providers, RetryConfig, Runtime, Subscription, Tool, ToolContext,
    ToolError, ToolOutput,
};
use rho_ai::{EventStream, FinishReason, LanguageModel, Model, StreamEvent, StreamRequest, Usage};
use serde_json::json;
use tokio_util::sync::CancellationToken;

pub const PROVIDER: &str = "test";
pub const MODEL: &str = "scripted";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One scripted model response
pub enum Reply {
    /// Play the events, then end the stream
    Events(Vec<StreamEvent>),
    /// Play the events, then hang until cancelled
    Stall(Vec<StreamEvent>),
    /// Refuse to open the stream
    Fail(rho_ai::Error),
}

/// A model that answers each request with the next scripted reply. Once
/// the script runs out every stream is empty.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(vec![]),
        })
    }

    pub fn push(&self, reply: Reply) {
        self.replies.lock().push_back(reply);
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn stream(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> rho_ai::Result<EventStream> {
        self.requests.lock().push(request);
        let reply = self.replies.lock().pop_front();
        match reply {
            None => Ok(Box::pin(futures::stream::empty::<StreamEvent>())),
            Some(Reply::Events(events)) => Ok(Box::pin(futures::stream::iter(events))),
            Some(Reply::Stall(events)) => Ok(Box::pin(async_stream::stream! {
                for event in events {
                    yield event;
                }
                cancel.cancelled().await;
            })),
            Some(Reply::Fail(error)) => Err(error),
        }
    }
}

pub fn text(body: &str) -> Vec<StreamEvent> {
    text_with_usage(body, Usage::new(100, 20))
}

pub fn text_with_usage(body: &str, usage: Usage) -> Vec<StreamEvent> {
    vec![
        StreamEvent::StartStep,
        StreamEvent::TextStart { id: "t".into() },
        StreamEvent::TextDelta {
            id: "t".into(),
            text: body.to_string(),
        },
        StreamEvent::TextEnd { id: "t".into() },
        StreamEvent::FinishStep {
            finish_reason: FinishReason::Stop,
            usage,
        },
        StreamEvent::Finish {
            finish_reason: FinishReason::Stop,
            usage,
        },
    ]
}

/// A step that calls each `(call_id, tool, input)`
pub fn tool_calls(calls: &[(&str, &str, serde_json::Value)]) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::StartStep];
    for (call_id, tool, input) in calls {
        events.push(StreamEvent::ToolCall {
            call_id: call_id.to_string(),
            tool: tool.to_string(),
            input: input.clone(),
        });
    }
    let usage = Usage::new(100, 20);
    events.push(StreamEvent::FinishStep {
        finish_reason: FinishReason::ToolCalls,
        usage,
    });
    events.push(StreamEvent::Finish {
        finish_reason: FinishReason::ToolCalls,
        usage,
    });
    events
}

pub fn model() -> Model {
    Model::new(PROVIDER, MODEL).with_limit(100_000, 8_000)
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        ..Default::default()
    }
}

pub fn runtime(backend: Arc<ScriptedModel>, config: Config, tools: Vec<BoxedTool>) -> Runtime {
    let mut providers = Providers::new();
    providers.add_model(model());
    providers.set_default_model(format!("{PROVIDER}/{MODEL}"));

    let mut builder = Runtime::builder()
        .directory(std::env::temp_dir())
        .tool_output_dir(std::env::temp_dir().join("rho-tool-output"))
        .config(config)
        .providers(providers)
        .backend(PROVIDER, backend)
        .retry_config(fast_retry());
    for tool in tools {
        builder = builder.tool(tool);
    }
    builder.build().expect("runtime")
}

/// Wait for the next event of `kind`, failing the test after five seconds
pub async fn next(subscription: &mut Subscription) -> Event {
    tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("timed out waiting for event")
        .expect("bus closed")
}

pub fn kinds(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(Event::kind).collect()
}

/// Echoes `text` back after a short real-time pause
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn id(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the input text"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: serde_json::Value, _ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let text = args["text"].as_str().unwrap_or_default();
        Ok(ToolOutput::new("echo", text))
    }
}

/// Asks for `bash` permission on the command before "running" it
pub struct BashTool;

#[async_trait]
impl Tool for BashTool {
    fn id(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Run a shell command"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": { "command": { "type": "string" } },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: serde_json::Value, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        let command = args["command"].as_str().unwrap_or_default().to_string();
        ctx.ask(
            "bash",
            vec![command.clone()],
            json!({ "command": command }),
            vec![command.clone()],
        )
        .await?;
        Ok(ToolOutput::new(command, "ran"))
    }
}

/// Never finishes on its own; reports progress, then waits for the abort
/// signal
pub struct BlockingTool;

#[async_trait]
impl Tool for BlockingTool {
    fn id(&self) -> &str {
        "block"
    }

    fn description(&self) -> &str {
        "Wait until aborted"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({ "type": "object" })
    }

    async fn execute(&self, _args: serde_json::Value, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        ctx.metadata(Some("waiting".into()), json!({ "output": "partial" }));
        ctx.abort().cancelled().await;
        Err(ToolError::new("aborted by signal"))
    }
}

/// Returns its input straight away, without yielding
pub struct InstantTool;

#[async_trait]
impl Tool for InstantTool {
    fn id(&self) -> &str {
        "instant"
    }

    fn description(&self) -> &str {
        "Return immediately"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({ "type": "object" })
    }

    async fn execute(&self, args: serde_json::Value, _ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::new("instant", args.to_string()))
    }
}
