//! Context compaction for long conversations
//!
//! Two mechanisms keep a session inside the model's context window:
//! - [`process`] asks the compaction agent for a structured summary and
//!   stores it as a summary assistant turn. Model history starts at the most
//!   recent summary, so everything before it drops out of the prompt.
//! - [`prune`] replaces the output of old tool calls with a placeholder once
//!   enough of them have piled up.

use rho_ai::{Model, StreamRequest, Usage};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::COMPACTION;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::id;
use crate::llm::LlmCall;
use crate::processor::Outcome;
use crate::prompt::to_model_messages;
use crate::runtime::Runtime;
use crate::store::ConversationStore;
use crate::summary;
use crate::types::{Message, Part, ToolStatus};

/// Output tokens kept free below the context limit
pub const BUFFER: u32 = 20_000;
/// Pruning only happens when it reclaims more than this many tokens
pub const PRUNE_MINIMUM: usize = 20_000;
/// Tokens of the most recent tool output that are never pruned
pub const PRUNE_PROTECT: usize = 40_000;

pub const PRUNED_OUTPUT: &str = "[output pruned for context management]";

/// Appended after an automatic compaction so the agent picks the work back up
pub const CONTINUE_PROMPT: &str =
    "Continue if you have next steps, or stop and ask for clarification if you are unsure how to proceed.";

const SUMMARY_PROMPT: &str = "\
Provide a detailed summary for continuing our conversation above.
Focus on information helpful for continuing, including what we did, what we're doing, which files we're working on, and what we're going to do next.

When constructing the summary, use this template:
---
## Goal

[What goal(s) is the user trying to accomplish?]

## Instructions

- [Important instructions from the user]
- [If there is a plan or spec, include information about it]

## Discoveries

[Notable things learned during this conversation]

## Accomplished

[What work has been completed, what is still in progress, what is left?]

## Relevant files / directories

[Structured list of relevant files that have been read, edited, or created]
---";

/// Rough token estimate: four bytes per token
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Whether `tokens` leaves too little room in the model's context window.
/// Models with an unknown context size never overflow.
pub fn is_overflow(tokens: &Usage, model: &Model) -> bool {
    let context = model.limit.context;
    if context == 0 {
        return false;
    }
    let max_output = if model.limit.output == 0 {
        BUFFER
    } else {
        model.limit.output
    };
    let reserved = BUFFER.min(max_output);
    let count = tokens.input as u64 + tokens.output as u64;
    count >= context.saturating_sub(reserved) as u64
}

/// Summarize the session into a new summary assistant turn.
///
/// `model` is the model the session is running on; the compaction agent's
/// own model takes precedence. When `auto` is set, a user message asking the
/// agent to continue is appended after the summary.
pub async fn process(
    runtime: &Runtime,
    session_id: &str,
    model: Option<&Model>,
    auto: bool,
    cancel: &CancellationToken,
) -> Result<Outcome> {
    let agent = runtime.agents().get(COMPACTION)?;
    let model = match (&agent.model, model) {
        (None, Some(model)) => model.clone(),
        _ => runtime.providers().resolve(&agent, None)?,
    };
    let backend = runtime.providers().language(&model)?;
    let store = runtime.store();

    let mut messages = to_model_messages(&store.history(session_id));
    messages.push(rho_ai::Message::user(SUMMARY_PROMPT));

    let mut summary = Message::assistant(session_id);
    if let Some(assistant) = summary.as_assistant_mut() {
        assistant.summary = true;
        assistant.agent = Some(COMPACTION.to_string());
        assistant.model = Some(model.qualified_id());
    }
    let summary = store.create_message(summary)?;
    info!(session = session_id, auto, "compacting session");

    let mut request = StreamRequest::new(model, agent.prompt.into_iter().collect(), messages);
    request.temperature = agent.temperature;
    let text = match LlmCall::new(backend, request).text(cancel).await {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => {
            store.remove_message(summary.id())?;
            return Err(Error::Compaction("model returned an empty summary".into()));
        }
        Err(Error::Cancelled) => {
            store.remove_message(summary.id())?;
            return Ok(Outcome::Stop);
        }
        Err(e) => {
            warn!(session = session_id, error = %e, "compaction failed");
            store.remove_message(summary.id())?;
            return Err(Error::Compaction(e.to_string()));
        }
    };

    store.create_part(Part::text(session_id, summary.id(), text.trim_end()))?;
    let now = id::now();
    store.update_message(summary.id(), |m| {
        if let Some(assistant) = m.as_assistant_mut() {
            assistant.finish = Some(rho_ai::FinishReason::Stop);
            assistant.time.completed = Some(now);
        }
    })?;

    if auto {
        store.create_message(Message::user(session_id, CONTINUE_PROMPT))?;
    }

    store.bus().publish(Event::SessionCompacted {
        session_id: session_id.to_string(),
    });
    summary::summarize(store, runtime.snapshot(), session_id).await?;
    info!(session = session_id, "compaction complete");
    Ok(Outcome::Continue)
}

/// Replace the output of old completed tool calls with a placeholder.
///
/// Walks the session newest first, skipping the two most recent user turns
/// and stopping at the latest summary. Once the outputs seen so far exceed
/// [`PRUNE_PROTECT`] tokens, every older output is a candidate; candidates
/// are only rewritten when together they exceed [`PRUNE_MINIMUM`] tokens.
/// Returns the number of parts pruned.
pub fn prune(store: &ConversationStore, session_id: &str) -> Result<usize> {
    let mut total = 0;
    let mut pruned = 0;
    let mut turns = 0;
    let mut candidates = Vec::new();

    'history: for entry in store.history(session_id).iter().rev() {
        let assistant = match &entry.message {
            Message::User(_) => {
                turns += 1;
                continue;
            }
            Message::Assistant(assistant) => assistant,
        };
        if turns < 2 {
            continue;
        }
        if assistant.summary {
            break;
        }
        for part in entry.parts.iter().rev() {
            let Part::Tool(tool) = part else {
                continue;
            };
            if tool.state.status != ToolStatus::Completed {
                continue;
            }
            // Everything older was handled by an earlier pass
            if tool.state.time.compacted.is_some() {
                break 'history;
            }
            let estimate = estimate_tokens(tool.state.output.as_deref().unwrap_or_default());
            total += estimate;
            if total > PRUNE_PROTECT {
                pruned += estimate;
                candidates.push(tool.id.clone());
            }
        }
    }

    if pruned <= PRUNE_MINIMUM {
        return Ok(0);
    }
    let now = id::now();
    for part_id in &candidates {
        store.update_part(part_id, |p| {
            if let Part::Tool(tool) = p {
                if tool.state.status == ToolStatus::Completed {
                    tool.state.output = Some(PRUNED_OUTPUT.to_string());
                    tool.state.time.compacted = Some(now);
                }
            }
        })?;
    }
    info!(session = session_id, count = candidates.len(), tokens = pruned, "pruned tool outputs");
    Ok(candidates.len())
}
