//! Stream processor
//!
//! Turns one model response into durable records. Every stream event maps
//! to a store mutation on the destination assistant message:
//!
//! | event | effect |
//! |---|---|
//! | `start-step` | `step-start` part with a snapshot handle |
//! | `text-start` | empty text part |
//! | `text-delta` | `part.delta` on the bus, accumulated in memory |
//! | `text-end` | text part sealed with the trimmed accumulator |
//! | `tool-call` | tool part in `running` |
//! | `tool-result` | tool part `completed` |
//! | `tool-error` | tool part `failed` |
//! | `finish-step` | finish reason and tokens on the message, `step-finish` part |
//! | `error` | failure handling |
//!
//! Transient provider failures restart the stream after a cancellable
//! backoff. Anything else seals the message with the error and publishes
//! `session.error`. Cancellation seals the message without an error.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use futures::StreamExt;
use rho_ai::{FinishReason, Model, StreamEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::compaction;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::id;
use crate::llm::{self, LlmCall, RetryConfig};
use crate::snapshot::{NoSnapshot, Snapshot};
use crate::status::{SessionStatus, StatusTracker};
use crate::store::ConversationStore;
use crate::types::{Part, ToolState};

/// Error recorded on tool calls that never got a result
pub const TOOL_ABORTED: &str = "Tool execution aborted";

/// What the prompt loop should do after a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Run the loop check again
    Continue,
    /// End the loop
    Stop,
    /// Summarize the conversation, then continue
    Compact,
}

struct PendingCall {
    part_id: String,
    start: i64,
}

/// Per-turn bookkeeping. Survives stream restarts.
struct Turn<'a> {
    session_id: String,
    message_id: String,
    model: &'a Model,
    toolcalls: HashMap<String, PendingCall>,
    texts: HashMap<String, (Part, String)>,
    overflow: bool,
}

/// End time for a tool call, strictly after its start even when both fall
/// in the same millisecond
fn settled_at(start: i64) -> i64 {
    id::now().max(start + 1)
}

enum Drained {
    Finished,
    Cancelled,
}

#[derive(Clone)]
pub struct Processor {
    store: ConversationStore,
    status: StatusTracker,
    snapshot: Arc<dyn Snapshot>,
    retry: RetryConfig,
    auto_compact: bool,
}

impl Processor {
    pub fn new(store: ConversationStore, status: StatusTracker) -> Self {
        Self {
            store,
            status,
            snapshot: Arc::new(NoSnapshot),
            retry: RetryConfig::default(),
            auto_compact: true,
        }
    }

    pub fn with_snapshot(mut self, snapshot: Arc<dyn Snapshot>) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Whether context overflow asks for compaction instead of failing
    pub fn with_auto_compact(mut self, auto: bool) -> Self {
        self.auto_compact = auto;
        self
    }

    /// Stream `call` into the assistant message `message_id`
    pub async fn process(
        &self,
        message_id: &str,
        call: &LlmCall,
        model: &Model,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let message = self.store.get_message(message_id)?;
        let mut turn = Turn {
            session_id: message.session_id().to_string(),
            message_id: message_id.to_string(),
            model,
            toolcalls: HashMap::new(),
            texts: HashMap::new(),
            overflow: false,
        };
        let mut attempt = 0u32;

        loop {
            let failure = match self.consume(&mut turn, call, cancel).await {
                Ok(Drained::Finished) => return self.finish(&mut turn),
                Ok(Drained::Cancelled) => return self.cancelled(&mut turn),
                Err(Error::Ai(e)) => e,
                Err(e) => return Err(e),
            };

            if llm::is_overflow_error(&failure) && self.auto_compact {
                warn!(session = %turn.session_id, error = %failure, "context overflow, compacting");
                self.seal(&mut turn, Some(failure.to_string()))?;
                return Ok(Outcome::Compact);
            }

            let reason = failure
                .retry_reason()
                .or_else(|| rho_ai::retry_reason(&failure.to_string()));
            match reason {
                Some(reason) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    self.discard_attempt(&mut turn)?;
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        "Request failed (attempt {}/{}): {}. Retrying in {:?}...",
                        attempt,
                        self.retry.max_retries,
                        failure,
                        delay
                    );
                    self.status.set(
                        &turn.session_id,
                        SessionStatus::Retry {
                            attempt,
                            message: reason.to_string(),
                            next: id::now() + delay.as_millis() as i64,
                        },
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return self.cancelled(&mut turn),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.status.set(&turn.session_id, SessionStatus::Busy);
                }
                _ => return self.fail(&mut turn, failure.to_string()),
            }
        }
    }

    async fn consume(
        &self,
        turn: &mut Turn<'_>,
        call: &LlmCall,
        cancel: &CancellationToken,
    ) -> Result<Drained> {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Drained::Cancelled),
            opened = call.stream(cancel) => opened?,
        };
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Drained::Cancelled),
                event = stream.next() => event,
            };
            let Some(event) = event else {
                return Ok(Drained::Finished);
            };
            debug!(event = event.name(), message = %turn.message_id, "stream event");
            self.apply(turn, event).await?;
        }
    }

    async fn apply(&self, turn: &mut Turn<'_>, event: StreamEvent) -> Result<()> {
        match event {
            StreamEvent::StartStep => {
                let snapshot = self.snapshot.track().await;
                self.store.create_part(Part::step_start(
                    &turn.session_id,
                    &turn.message_id,
                    snapshot,
                ))?;
            }
            StreamEvent::TextStart { id } => {
                let part = self
                    .store
                    .create_part(Part::text(&turn.session_id, &turn.message_id, ""))?;
                turn.texts.insert(id, (part, String::new()));
            }
            StreamEvent::TextDelta { id, text } => {
                let (part, accumulated) = match turn.texts.entry(id) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        let part = self.store.create_part(Part::text(
                            &turn.session_id,
                            &turn.message_id,
                            "",
                        ))?;
                        entry.insert((part, String::new()))
                    }
                };
                accumulated.push_str(&text);
                self.store.publish_delta(part, text);
            }
            StreamEvent::TextEnd { id } => {
                if let Some((part, text)) = turn.texts.remove(&id) {
                    self.seal_text(&part, &text)?;
                }
            }
            StreamEvent::ToolCall {
                call_id,
                tool,
                input,
            } => {
                let start = id::now();
                let part = self.store.create_part(Part::tool(
                    &turn.session_id,
                    &turn.message_id,
                    tool,
                    Some(call_id.clone()),
                    ToolState::running(input, start),
                ))?;
                turn.toolcalls.insert(
                    call_id,
                    PendingCall {
                        part_id: part.id().to_string(),
                        start,
                    },
                );
            }
            StreamEvent::ToolResult {
                call_id,
                title,
                output,
                metadata,
            } => {
                let Some(pending) = turn.toolcalls.remove(&call_id) else {
                    warn!(call_id = %call_id, "result for unknown tool call");
                    return Ok(());
                };
                let end = settled_at(pending.start);
                let metadata = (!metadata.is_null()).then_some(metadata);
                self.store.update_part(&pending.part_id, |p| {
                    if let Part::Tool(tool) = p {
                        tool.state.complete(output, Some(title), metadata, end);
                    }
                })?;
            }
            StreamEvent::ToolError { call_id, error } => {
                let Some(pending) = turn.toolcalls.remove(&call_id) else {
                    warn!(call_id = %call_id, "error for unknown tool call");
                    return Ok(());
                };
                let end = settled_at(pending.start);
                self.store.update_part(&pending.part_id, |p| {
                    if let Part::Tool(tool) = p {
                        tool.state.fail(error, end);
                    }
                })?;
            }
            StreamEvent::FinishStep {
                finish_reason,
                usage,
            } => {
                self.store.update_message(&turn.message_id, |m| {
                    if let Some(assistant) = m.as_assistant_mut() {
                        assistant.finish = Some(finish_reason);
                        assistant.tokens = Some(usage);
                    }
                })?;
                let snapshot = self.snapshot.track().await;
                self.store.create_part(Part::step_finish(
                    &turn.session_id,
                    &turn.message_id,
                    snapshot,
                    finish_reason,
                    usage,
                ))?;
                if compaction::is_overflow(&usage, turn.model) {
                    info!(session = %turn.session_id, input = usage.input, output = usage.output, "context near limit");
                    turn.overflow = true;
                }
            }
            StreamEvent::Finish { finish_reason, .. } => {
                let recorded = self
                    .store
                    .get_message(&turn.message_id)?
                    .as_assistant()
                    .and_then(|a| a.finish);
                if recorded.is_none() {
                    self.store.update_message(&turn.message_id, |m| {
                        if let Some(assistant) = m.as_assistant_mut() {
                            assistant.finish = Some(finish_reason);
                        }
                    })?;
                }
            }
            StreamEvent::Error { message } => {
                return Err(rho_ai::Error::Stream(message).into());
            }
        }
        Ok(())
    }

    fn seal_text(&self, part: &Part, text: &str) -> Result<()> {
        let text = text.trim_end().to_string();
        self.store.update_part(part.id(), |p| {
            if let Part::Text(t) = p {
                t.text = text;
            }
        })?;
        Ok(())
    }

    /// Forget what a failed attempt left in flight before the stream restarts.
    /// Its unfinished text parts stay empty and its unsettled tool calls fail.
    fn discard_attempt(&self, turn: &mut Turn<'_>) -> Result<()> {
        for (_, (part, text)) in turn.texts.drain() {
            debug!(part = %part.id(), dropped = text.len(), "discarding partial text");
        }
        self.abort_tools(turn)
    }

    fn flush_texts(&self, turn: &mut Turn<'_>) -> Result<()> {
        for (_, (part, text)) in turn.texts.drain() {
            self.seal_text(&part, &text)?;
        }
        Ok(())
    }

    /// Fail every tool call of the turn that has not settled
    fn abort_tools(&self, turn: &mut Turn<'_>) -> Result<()> {
        turn.toolcalls.clear();
        let now = id::now();
        for part in self.store.list_parts(&turn.message_id) {
            if !part.is_unsettled_tool() {
                continue;
            }
            debug!(part = %part.id(), "aborting unsettled tool call");
            self.store.update_part(part.id(), |p| {
                if let Part::Tool(tool) = p {
                    let end = tool.state.time.start.map_or(now, |start| now.max(start + 1));
                    tool.state.fail(TOOL_ABORTED.to_string(), end);
                }
            })?;
        }
        Ok(())
    }

    /// Settle everything in flight and set `time.completed`
    fn seal(&self, turn: &mut Turn<'_>, error: Option<String>) -> Result<()> {
        self.flush_texts(turn)?;
        self.abort_tools(turn)?;
        let now = id::now();
        self.store.update_message(&turn.message_id, |m| {
            if let Some(assistant) = m.as_assistant_mut() {
                if error.is_some() {
                    assistant.error = error;
                }
                assistant.time.completed = Some(now);
            }
        })?;
        Ok(())
    }

    fn finish(&self, turn: &mut Turn<'_>) -> Result<Outcome> {
        self.seal(turn, None)?;
        // A stream that ended without a finish reason still ends the turn
        self.store.update_message(&turn.message_id, |m| {
            if let Some(assistant) = m.as_assistant_mut() {
                assistant.finish.get_or_insert(FinishReason::Unknown);
            }
        })?;
        if turn.overflow && self.auto_compact {
            return Ok(Outcome::Compact);
        }
        Ok(Outcome::Continue)
    }

    fn cancelled(&self, turn: &mut Turn<'_>) -> Result<Outcome> {
        info!(session = %turn.session_id, message = %turn.message_id, "turn cancelled");
        self.seal(turn, None)?;
        Ok(Outcome::Stop)
    }

    fn fail(&self, turn: &mut Turn<'_>, message: String) -> Result<Outcome> {
        error!(session = %turn.session_id, error = %message, "turn failed");
        self.seal(turn, Some(message.clone()))?;
        self.store.bus().publish(Event::SessionError {
            session_id: Some(turn.session_id.clone()),
            error: message,
        });
        Ok(Outcome::Stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::events::EventKind;
    use crate::types::{Message, NewSession, ToolStatus};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rho_ai::{EventStream, LanguageModel, StreamRequest, Usage};
    use serde_json::json;
    use std::time::Duration;

    /// Plays back one scripted response per call
    struct Script(Mutex<Vec<rho_ai::Result<Vec<StreamEvent>>>>);

    #[async_trait]
    impl LanguageModel for Script {
        async fn stream(
            &self,
            _request: StreamRequest,
            _cancel: CancellationToken,
        ) -> rho_ai::Result<EventStream> {
            let next = {
                let mut script = self.0.lock();
                if script.is_empty() {
                    Ok(vec![])
                } else {
                    script.remove(0)
                }
            };
            Ok(Box::pin(futures::stream::iter(next?)))
        }
    }

    struct Fixture {
        store: ConversationStore,
        processor: Processor,
        message_id: String,
        model: Model,
    }

    fn fixture() -> Fixture {
        let bus = Bus::default();
        let store = ConversationStore::new(bus.clone());
        let session = store.create_session(NewSession::new("p", "/")).unwrap();
        store.create_message(Message::user(&session.id, "hi")).unwrap();
        let message = store.create_message(Message::assistant(&session.id)).unwrap();
        let processor = Processor::new(store.clone(), StatusTracker::new(bus)).with_retry_config(
            RetryConfig {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                ..Default::default()
            },
        );
        Fixture {
            store,
            processor,
            message_id: message.id().to_string(),
            model: Model::new("test", "scripted").with_limit(100_000, 8_000),
        }
    }

    fn call(script: Vec<rho_ai::Result<Vec<StreamEvent>>>) -> LlmCall {
        let model = Model::new("test", "scripted");
        LlmCall::new(
            Arc::new(Script(Mutex::new(script))),
            StreamRequest::new(model, vec![], vec![]),
        )
    }

    fn text(id: &str, parts: &[&str]) -> Vec<StreamEvent> {
        let mut events = vec![StreamEvent::TextStart { id: id.into() }];
        for part in parts {
            events.push(StreamEvent::TextDelta {
                id: id.into(),
                text: part.to_string(),
            });
        }
        events.push(StreamEvent::TextEnd { id: id.into() });
        events
    }

    fn finish(reason: FinishReason, usage: Usage) -> StreamEvent {
        StreamEvent::FinishStep {
            finish_reason: reason,
            usage,
        }
    }

    #[tokio::test]
    async fn test_text_is_sealed_trimmed_with_deltas() {
        let f = fixture();
        let mut deltas = f.store.bus().subscribe_kind(EventKind::PartDelta);
        let mut events = text("t1", &["Hello", " world  \n"]);
        events.push(finish(FinishReason::Stop, Usage::new(10, 5)));
        let outcome = f
            .processor
            .process(&f.message_id, &call(vec![Ok(events)]), &f.model, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Continue);
        assert_eq!(deltas.drain().len(), 2);
        let parts = f.store.list_parts(&f.message_id);
        let texts: Vec<_> = parts.iter().filter_map(Part::as_text).collect();
        assert_eq!(texts[0].text, "Hello world");
        let message = f.store.get_message(&f.message_id).unwrap();
        let assistant = message.as_assistant().unwrap();
        assert_eq!(assistant.finish, Some(FinishReason::Stop));
        assert_eq!(assistant.tokens, Some(Usage::new(10, 5)));
        assert!(assistant.is_sealed());
        assert!(parts.iter().any(|p| matches!(p, Part::StepFinish(_))));
    }

    #[tokio::test]
    async fn test_unresolved_call_fails_at_stream_end() {
        let f = fixture();
        let events = vec![
            StreamEvent::ToolCall {
                call_id: "c1".into(),
                tool: "bash".into(),
                input: json!({"command": "ls"}),
            },
            finish(FinishReason::ToolCalls, Usage::default()),
        ];
        f.processor
            .process(&f.message_id, &call(vec![Ok(events)]), &f.model, &CancellationToken::new())
            .await
            .unwrap();

        let tool = f.store.find_tool_part(&f.message_id, "c1").unwrap();
        assert_eq!(tool.state.status, ToolStatus::Failed);
        assert_eq!(tool.state.error.as_deref(), Some(TOOL_ABORTED));
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_fatal() {
        let f = fixture();
        let mut errors = f.store.bus().subscribe_kind(EventKind::SessionError);
        let outcome = f
            .processor
            .process(
                &f.message_id,
                &call(vec![Err(rho_ai::Error::api("authentication_error", "bad key"))]),
                &f.model,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Stop);
        let message = f.store.get_message(&f.message_id).unwrap();
        let assistant = message.as_assistant().unwrap();
        assert!(assistant.error.as_deref().unwrap().contains("bad key"));
        assert!(assistant.is_sealed());
        assert_eq!(errors.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_restarts_stream() {
        let f = fixture();
        let first = vec![StreamEvent::Error {
            message: "503 Service Unavailable".into(),
        }];
        let mut second = text("t1", &["ok"]);
        second.push(finish(FinishReason::Stop, Usage::default()));
        let outcome = f
            .processor
            .process(
                &f.message_id,
                &call(vec![Ok(first), Ok(second)]),
                &f.model,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Continue);
        let message = f.store.get_message(&f.message_id).unwrap();
        assert!(message.as_assistant().unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_retry_discards_partial_attempt() {
        let f = fixture();
        let first = vec![
            StreamEvent::TextStart { id: "t1".into() },
            StreamEvent::TextDelta {
                id: "t1".into(),
                text: "half an ans".into(),
            },
            StreamEvent::ToolCall {
                call_id: "c1".into(),
                tool: "bash".into(),
                input: json!({"command": "ls"}),
            },
            StreamEvent::Error {
                message: "upstream overloaded".into(),
            },
        ];
        let mut second = text("t1", &["whole answer"]);
        second.push(finish(FinishReason::Stop, Usage::default()));
        f.processor
            .process(
                &f.message_id,
                &call(vec![Ok(first), Ok(second)]),
                &f.model,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let parts = f.store.list_parts(&f.message_id);
        let texts: Vec<&str> = parts
            .iter()
            .filter_map(Part::as_text)
            .map(|t| t.text.as_str())
            .filter(|t| !t.is_empty())
            .collect();
        assert_eq!(texts, vec!["whole answer"]);
        let tool = f.store.find_tool_part(&f.message_id, "c1").unwrap();
        assert_eq!(tool.state.status, ToolStatus::Failed);
        assert_eq!(tool.state.error.as_deref(), Some(TOOL_ABORTED));
    }

    #[tokio::test]
    async fn test_instant_tool_result_ends_after_start() {
        let f = fixture();
        let events = vec![
            StreamEvent::ToolCall {
                call_id: "c1".into(),
                tool: "read".into(),
                input: json!({}),
            },
            StreamEvent::ToolResult {
                call_id: "c1".into(),
                title: "read".into(),
                output: "ok".into(),
                metadata: serde_json::Value::Null,
            },
            StreamEvent::ToolCall {
                call_id: "c2".into(),
                tool: "read".into(),
                input: json!({}),
            },
            StreamEvent::ToolError {
                call_id: "c2".into(),
                error: "missing".into(),
            },
            finish(FinishReason::ToolCalls, Usage::default()),
        ];
        f.processor
            .process(&f.message_id, &call(vec![Ok(events)]), &f.model, &CancellationToken::new())
            .await
            .unwrap();

        for call_id in ["c1", "c2"] {
            let tool = f.store.find_tool_part(&f.message_id, call_id).unwrap();
            let (start, end) = (tool.state.time.start.unwrap(), tool.state.time.end.unwrap());
            assert!(start < end, "{call_id}: start {start} should precede end {end}");
        }
    }

    #[tokio::test]
    async fn test_usage_near_limit_requests_compaction() {
        let f = fixture();
        let events = vec![finish(FinishReason::Stop, Usage::new(90_000, 2_000))];
        let outcome = f
            .processor
            .process(&f.message_id, &call(vec![Ok(events.clone())]), &f.model, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Compact);

        let manual = f.processor.clone().with_auto_compact(false);
        let session_id = f.store.get_message(&f.message_id).unwrap().session_id().to_string();
        let other = f.store.create_message(Message::assistant(session_id)).unwrap();
        let outcome = manual
            .process(other.id(), &call(vec![Ok(events)]), &f.model, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Continue);
    }

    #[tokio::test]
    async fn test_overflow_error_requests_compaction() {
        let f = fixture();
        let outcome = f
            .processor
            .process(
                &f.message_id,
                &call(vec![Ok(vec![StreamEvent::Error {
                    message: "prompt is too long: 210000 tokens > 200000 maximum".into(),
                }])]),
                &f.model,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Compact);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let f = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = f
            .processor
            .process(&f.message_id, &call(vec![]), &f.model, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Stop);
        let message = f.store.get_message(&f.message_id).unwrap();
        let assistant = message.as_assistant().unwrap();
        assert!(assistant.is_sealed());
        assert!(assistant.error.is_none());
    }
}
