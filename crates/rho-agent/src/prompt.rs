//! The prompt loop
//!
//! One call to [`Runtime::prompt`](crate::Runtime::prompt) appends a user
//! message and then runs assistant turns until the conversation settles:
//! the latest assistant message is finished for a reason other than tool
//! calls, has no unsettled tool parts and comes after the latest user
//! message. The step limit, cancellation and a `stop` from the processor
//! also end the loop.

use rho_ai::{Content, Model, StreamRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::compaction;
use crate::error::Result;
use crate::events::Event;
use crate::llm::{LlmCall, ToolExecutor};
use crate::permission;
use crate::processor::{Outcome, TOOL_ABORTED};
use crate::runtime::Runtime;
use crate::status::SessionStatus;
use crate::store::MessageWithParts;
use crate::summary;
use crate::system;
use crate::tool::{RegisteredTool, to_spec};
use crate::types::{AssistantMessage, Message, Part, ToolStatus};

/// A user turn to run
#[derive(Debug, Clone)]
pub struct PromptInput {
    pub session_id: String,
    pub content: String,
    /// Agent name; defaults to the session's agent, then the default agent
    pub agent: Option<String>,
    /// `provider/model` override for this prompt
    pub model: Option<String>,
}

impl PromptInput {
    pub fn new(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            content: content.into(),
            agent: None,
            model: None,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Convert stored history into model input.
///
/// Starts at the most recent summary turn. Each tool part becomes a tool
/// call on its assistant message followed by a tool result message.
pub fn to_model_messages(history: &[MessageWithParts]) -> Vec<rho_ai::Message> {
    let start = history
        .iter()
        .rposition(|e| e.message.as_assistant().is_some_and(|a| a.summary))
        .unwrap_or(0);

    let mut messages = Vec::new();
    for entry in &history[start..] {
        match &entry.message {
            Message::User(user) => messages.push(rho_ai::Message::user(user.content.as_str())),
            Message::Assistant(_) => {
                let mut content = Vec::new();
                let mut results = Vec::new();
                for part in &entry.parts {
                    match part {
                        Part::Text(text) if !text.text.is_empty() => {
                            content.push(Content::text(text.text.as_str()));
                        }
                        Part::Tool(tool) => {
                            let call_id = tool.call_id.clone().unwrap_or_else(|| tool.id.clone());
                            content.push(Content::tool_call(
                                call_id.as_str(),
                                tool.tool.as_str(),
                                tool.state.input.clone(),
                            ));
                            let (output, is_error) = match tool.state.status {
                                ToolStatus::Completed => {
                                    (tool.state.output.clone().unwrap_or_default(), false)
                                }
                                ToolStatus::Failed => (
                                    format!("Error: {}", tool.state.error.as_deref().unwrap_or_default()),
                                    true,
                                ),
                                ToolStatus::Pending | ToolStatus::Running => {
                                    (format!("Error: {TOOL_ABORTED}"), true)
                                }
                            };
                            results.push(rho_ai::Message::tool_result(
                                call_id,
                                tool.tool.as_str(),
                                output,
                                is_error,
                            ));
                        }
                        _ => {}
                    }
                }
                if content.is_empty() {
                    continue;
                }
                messages.push(rho_ai::Message::Assistant { content });
                messages.extend(results);
            }
        }
    }
    messages
}

/// Whether the conversation needs no further assistant turn
fn is_settled(history: &[MessageWithParts]) -> bool {
    let last_user = history
        .iter()
        .rposition(|e| matches!(e.message, Message::User(_)));
    let Some(index) = history
        .iter()
        .rposition(|e| matches!(e.message, Message::Assistant(_)))
    else {
        return false;
    };
    let entry = &history[index];
    let finished = entry
        .message
        .as_assistant()
        .is_some_and(|a| a.is_sealed() && a.finish.is_some_and(|f| !f.wants_more()));
    finished
        && !entry.parts.iter().any(Part::is_unsettled_tool)
        && last_user.is_none_or(|user| index > user)
}

fn last_assistant(runtime: &Runtime, session_id: &str) -> Option<AssistantMessage> {
    runtime
        .store()
        .list_messages(session_id)
        .into_iter()
        .rev()
        .find_map(|m| match m {
            Message::Assistant(assistant) => Some(assistant),
            Message::User(_) => None,
        })
}

/// Tools the agent may call on `model`
fn active_tools(runtime: &Runtime, model: &Model, ruleset: &permission::Ruleset) -> Vec<RegisteredTool> {
    let tools = runtime.tools().tools_for(model);
    let disabled = permission::disabled(tools.iter().map(RegisteredTool::id), ruleset);
    tools
        .into_iter()
        .filter(|t| !disabled.contains(t.id()))
        .collect()
}

async fn steps(
    runtime: &Runtime,
    session_id: &str,
    agent_name: &str,
    requested_model: Option<&str>,
    cancel: &CancellationToken,
) -> Result<()> {
    let agent = runtime.agents().get(agent_name)?;
    let model = runtime.providers().resolve(&agent, requested_model)?;
    let backend = runtime.providers().language(&model)?;
    let system = system::build(&agent, &model.id, runtime.directory(), runtime.config());
    let max_steps = agent.steps.unwrap_or(runtime.config().limits.max_steps);
    let max_tokens = match (runtime.config().limits.max_tokens, model.limit.output) {
        (configured, 0) => configured,
        (configured, limit) => configured.min(limit),
    };
    info!(session = session_id, agent = %agent.name, model = %model.qualified_id(), "prompt loop started");

    let mut step = 0;
    loop {
        if cancel.is_cancelled() {
            debug!(session = session_id, "loop cancelled");
            break;
        }
        if step >= max_steps {
            warn!(session = session_id, max_steps, "step limit reached");
            break;
        }
        let history = runtime.store().history(session_id);
        if is_settled(&history) {
            break;
        }

        let mut message = Message::assistant(session_id);
        if let Some(assistant) = message.as_assistant_mut() {
            assistant.agent = Some(agent.name.clone());
            assistant.model = Some(model.qualified_id());
        }
        let message = runtime.store().create_message(message)?;

        let tools = active_tools(runtime, &model, &agent.permission);
        let mut request = StreamRequest::new(model.clone(), system.clone(), to_model_messages(&history));
        request.tools = tools.iter().map(|t| to_spec(t.tool.as_ref())).collect();
        request.temperature = agent.temperature;
        request.top_p = agent.top_p;
        request.max_tokens = Some(max_tokens);

        let executor = ToolExecutor::new(
            tools,
            session_id,
            message.id(),
            agent.name.as_str(),
            agent.permission.clone(),
            runtime.permissions().clone(),
            runtime.store().clone(),
            cancel.clone(),
        );
        let call = LlmCall::new(backend.clone(), request).with_tools(executor);
        let outcome = runtime
            .processor()
            .process(message.id(), &call, &model, cancel)
            .await?;
        step += 1;
        debug!(session = session_id, step, ?outcome, "step finished");

        match outcome {
            Outcome::Continue => {}
            Outcome::Stop => break,
            Outcome::Compact => {
                if compaction::process(runtime, session_id, Some(&model), true, cancel).await?
                    == Outcome::Stop
                {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Run assistant turns for the session until it settles, then prune and
/// summarize. Returns the last assistant message.
pub(crate) async fn run(
    runtime: &Runtime,
    session_id: &str,
    agent: &str,
    requested_model: Option<&str>,
    cancel: &CancellationToken,
) -> Result<Option<AssistantMessage>> {
    runtime.status().set(session_id, SessionStatus::Busy);

    if let Err(e) = steps(runtime, session_id, agent, requested_model, cancel).await {
        error!(session = session_id, error = %e, "prompt loop failed");
        runtime.store().bus().publish(Event::SessionError {
            session_id: Some(session_id.to_string()),
            error: e.to_string(),
        });
        runtime.status().set(
            session_id,
            SessionStatus::Error {
                message: e.to_string(),
            },
        );
        return Err(e);
    }

    if runtime.config().compaction.prune {
        if let Err(e) = compaction::prune(runtime.store(), session_id) {
            warn!(session = session_id, error = %e, "pruning failed");
        }
    }
    if let Err(e) = summary::summarize(runtime.store(), runtime.snapshot(), session_id).await {
        warn!(session = session_id, error = %e, "summary failed");
    }

    let last = last_assistant(runtime, session_id);
    let status = match last.as_ref().and_then(|a| a.error.clone()) {
        Some(message) => SessionStatus::Error { message },
        None => SessionStatus::Idle,
    };
    runtime.status().set(session_id, status);
    info!(session = session_id, "prompt loop finished");
    Ok(last)
}
