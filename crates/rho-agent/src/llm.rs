//! Model calls with tool execution spliced into the stream
//!
//! A provider stream only ever asks for tool calls. [`LlmCall::stream`] runs
//! each requested tool as soon as its `tool-call` event has been handed on,
//! and reports the outcome as a `tool-result` or `tool-error` event in the
//! same stream. The `finish-step` that closes a step is held back until every
//! tool call of that step has settled, so consumers see a step's results
//! before its end.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_stream::stream;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use regex::Regex;
use rho_ai::{EventStream, LanguageModel, StreamEvent, StreamRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::permission::{PermissionEngine, Ruleset};
use crate::store::ConversationStore;
use crate::tool::{RegisteredTool, ToolContext};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay_secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Compiled regex patterns for detecting context overflow errors across providers.
static OVERFLOW_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Generic / multi-provider patterns
        r"(?i)context.?length.?exceed",
        r"(?i)maximum.?context.?length",
        r"(?i)context.?window.?(exceed|full|limit)",
        r"(?i)too.?many.?tokens",
        r"(?i)prompt.?is.?too.?long",
        r"(?i)input.?too.?long",
        r"(?i)token.?limit.?(exceed|reach)",
        // Anthropic / Bedrock
        r"(?i)prompt.?too.?long",
        r"(?i)request.?too.?large",
        // OpenAI
        r"(?i)maximum.?number.?of.?tokens",
        r"(?i)reduce.?the.?length",
        r"(?i)context_length_exceeded",
        r"(?i)max_tokens.*(exceed|limit|too|overflow)",
        // Google
        r"(?i)exceeds?.+token.?limit",
        r"(?i)input.?token.?limit",
        // Local servers
        r"(?i)context.?overflow",
        r"(?i)context.?size.?exceed",
        r"(?i)n_ctx",
        r"\b413\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// HTTP 400 in an error string ("400 Bad Request", "status: 400"), not port
/// numbers or ids that happen to contain 400.
static HTTP_400_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:status|http|error)[:\s]*400\b|\b400\s+bad\s+request").ok()
});

/// Check if error text indicates a context overflow
pub fn is_context_overflow(error: &str) -> bool {
    if HTTP_400_PATTERN
        .as_ref()
        .is_some_and(|re| re.is_match(error))
    {
        let lower = error.to_lowercase();
        if lower.contains("token") || lower.contains("context") || lower.contains("length") {
            return true;
        }
    }
    OVERFLOW_PATTERNS.iter().any(|re| re.is_match(error))
}

/// Whether a provider error means the prompt no longer fits the model
pub fn is_overflow_error(error: &rho_ai::Error) -> bool {
    error.is_context_overflow() || is_context_overflow(&error.to_string())
}

/// Runs the tools a model asks for during one assistant turn
#[derive(Clone)]
pub struct ToolExecutor {
    tools: Vec<RegisteredTool>,
    session_id: String,
    message_id: String,
    agent: String,
    ruleset: Ruleset,
    permissions: PermissionEngine,
    store: ConversationStore,
    cancel: CancellationToken,
}

impl ToolExecutor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        tools: Vec<RegisteredTool>,
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        agent: impl Into<String>,
        ruleset: Ruleset,
        permissions: PermissionEngine,
        store: ConversationStore,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tools,
            session_id: session_id.into(),
            message_id: message_id.into(),
            agent: agent.into(),
            ruleset,
            permissions,
            store,
            cancel,
        }
    }

    pub fn tool_ids(&self) -> Vec<&str> {
        self.tools.iter().map(RegisteredTool::id).collect()
    }

    fn context(&self, call_id: &str) -> ToolContext {
        ToolContext::new(
            &self.session_id,
            &self.message_id,
            call_id,
            &self.agent,
            self.cancel.clone(),
            self.ruleset.clone(),
            self.permissions.clone(),
            self.store.clone(),
        )
    }

    /// Run one call to completion, as the stream event reporting its outcome
    pub async fn execute(&self, call_id: String, name: String, input: serde_json::Value) -> StreamEvent {
        let Some(tool) = self.tools.iter().find(|t| t.id() == name) else {
            warn!(tool = %name, "model called an unavailable tool");
            return StreamEvent::ToolError {
                call_id,
                error: format!(
                    "Model tried to call unavailable tool '{}'. Available tools: {}.",
                    name,
                    self.tool_ids().join(", ")
                ),
            };
        };
        let ctx = self.context(&call_id);
        debug!(tool = %name, call_id = %call_id, "executing tool");
        match tool.run(input, ctx).await {
            Ok(result) => StreamEvent::ToolResult {
                call_id,
                title: result.title,
                output: result.output,
                metadata: result.metadata,
            },
            Err(e) => StreamEvent::ToolError {
                call_id,
                error: e.to_string(),
            },
        }
    }
}

/// Everything needed to (re)open the model stream for one turn
#[derive(Clone)]
pub struct LlmCall {
    backend: Arc<dyn LanguageModel>,
    request: StreamRequest,
    executor: Option<ToolExecutor>,
}

impl LlmCall {
    pub fn new(backend: Arc<dyn LanguageModel>, request: StreamRequest) -> Self {
        Self {
            backend,
            request,
            executor: None,
        }
    }

    /// Execute requested tools with `executor`
    pub fn with_tools(mut self, executor: ToolExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn request(&self) -> &StreamRequest {
        &self.request
    }

    /// Open a fresh stream. Each call starts the response from scratch.
    pub async fn stream(&self, cancel: &CancellationToken) -> rho_ai::Result<EventStream> {
        let inner = self
            .backend
            .stream(self.request.clone(), cancel.clone())
            .await?;
        Ok(match &self.executor {
            Some(executor) => with_tool_execution(inner, executor.clone()),
            None => inner,
        })
    }

    /// Run the call to completion and return its text
    pub async fn text(&self, cancel: &CancellationToken) -> crate::error::Result<String> {
        tokio::select! {
            _ = cancel.cancelled() => Err(crate::error::Error::Cancelled),
            text = async { rho_ai::stream::collect_text(self.stream(cancel).await?).await } => Ok(text?),
        }
    }
}

enum Next {
    Settled(StreamEvent),
    Upstream(Option<StreamEvent>),
}

fn with_tool_execution(mut inner: EventStream, executor: ToolExecutor) -> EventStream {
    Box::pin(stream! {
        let mut running: FuturesUnordered<BoxFuture<'static, StreamEvent>> = FuturesUnordered::new();
        let mut held: Option<StreamEvent> = None;
        let mut ended = false;

        loop {
            let next = tokio::select! {
                biased;
                Some(event) = running.next(), if !running.is_empty() => Next::Settled(event),
                event = inner.next(), if held.is_none() && !ended => Next::Upstream(event),
                else => break,
            };

            match next {
                Next::Settled(event) => yield event,
                Next::Upstream(None) => ended = true,
                Next::Upstream(Some(StreamEvent::ToolCall { call_id, tool, input })) => {
                    yield StreamEvent::ToolCall {
                        call_id: call_id.clone(),
                        tool: tool.clone(),
                        input: input.clone(),
                    };
                    let executor = executor.clone();
                    running.push(Box::pin(async move { executor.execute(call_id, tool, input).await }));
                }
                Next::Upstream(Some(event @ StreamEvent::FinishStep { .. })) if !running.is_empty() => {
                    held = Some(event);
                }
                Next::Upstream(Some(event)) => yield event,
            }

            if running.is_empty() {
                if let Some(event) = held.take() {
                    yield event;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::tool::{Tool, ToolError, ToolOutput, ToolRegistry};
    use crate::types::{Message, NewSession};
    use async_trait::async_trait;
    use rho_ai::{FinishReason, Model, Usage};
    use serde_json::json;

    #[test]
    fn test_delay_for_attempt() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(retry.delay_for_attempt(5), Duration::from_secs(16));
        assert_eq!(retry.delay_for_attempt(6), Duration::from_secs(30));
    }

    #[test]
    fn test_overflow_patterns() {
        assert!(is_context_overflow("prompt is too long"));
        assert!(is_context_overflow(
            "This model's maximum context length is 128000 tokens. context_length_exceeded"
        ));
        assert!(is_context_overflow("Request exceeds the token limit for this model"));
        assert!(is_context_overflow("HTTP 413 Payload Too Large"));
        assert!(is_context_overflow("400 Bad Request: context too large"));
        assert!(!is_context_overflow("max_tokens parameter must be positive"));
        assert!(!is_context_overflow("400 Bad Request: invalid field"));
        assert!(!is_context_overflow("rate limit exceeded"));
        assert!(!is_context_overflow("connected to port 14001 with token auth"));
    }

    #[test]
    fn test_overflow_error_typed_and_text() {
        assert!(is_overflow_error(&rho_ai::Error::ContextOverflow("x".into())));
        assert!(is_overflow_error(&rho_ai::Error::Stream("n_ctx exceeded".into())));
        assert!(!is_overflow_error(&rho_ai::Error::Stream("reset".into())));
    }

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn id(&self) -> &str {
            "upper"
        }
        fn description(&self) -> &str {
            "Uppercases text"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(
            &self,
            args: serde_json::Value,
            _ctx: ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            tokio::task::yield_now().await;
            Ok(ToolOutput::new("upper", args["text"].as_str().unwrap_or_default().to_uppercase()))
        }
    }

    fn executor() -> ToolExecutor {
        let bus = Bus::default();
        let store = ConversationStore::new(bus.clone());
        let session = store.create_session(NewSession::new("p", "/")).unwrap();
        let message = store.create_message(Message::assistant(&session.id)).unwrap();
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Upper));
        ToolExecutor::new(
            registry.tools_for(&Model::new("p", "m")),
            &session.id,
            message.id(),
            "build",
            Ruleset::new(),
            PermissionEngine::new(bus),
            store,
            CancellationToken::new(),
        )
    }

    fn scripted(events: Vec<StreamEvent>) -> EventStream {
        Box::pin(futures::stream::iter(events))
    }

    fn call(id: &str, tool: &str) -> StreamEvent {
        StreamEvent::ToolCall {
            call_id: id.into(),
            tool: tool.into(),
            input: json!({"text": "hi"}),
        }
    }

    fn finish_step() -> StreamEvent {
        StreamEvent::FinishStep {
            finish_reason: FinishReason::ToolCalls,
            usage: Usage::default(),
        }
    }

    #[tokio::test]
    async fn test_results_arrive_before_finish_step() {
        let stream = with_tool_execution(
            scripted(vec![StreamEvent::StartStep, call("c1", "upper"), call("c2", "upper"), finish_step()]),
            executor(),
        );
        let names: Vec<_> = stream.map(|e| e.name()).collect().await;
        assert_eq!(names[0], "start-step");
        assert_eq!(names.last(), Some(&"finish-step"));
        assert_eq!(names.iter().filter(|n| **n == "tool-result").count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_a_tool_error() {
        let events: Vec<_> = with_tool_execution(scripted(vec![call("c1", "nope")]), executor())
            .collect()
            .await;
        match &events[1] {
            StreamEvent::ToolError { call_id, error } => {
                assert_eq!(call_id, "c1");
                assert!(error.contains("unavailable tool 'nope'"));
                assert!(error.contains("upper"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_result_carries_output() {
        let events: Vec<_> = with_tool_execution(scripted(vec![call("c1", "upper")]), executor())
            .collect()
            .await;
        assert_eq!(
            events[1],
            StreamEvent::ToolResult {
                call_id: "c1".into(),
                title: "upper".into(),
                output: "HI".into(),
                metadata: serde_json::Value::Null,
            }
        );
    }
}
