//! Session titles

use rho_ai::StreamRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::TITLE;
use crate::error::Result;
use crate::llm::LlmCall;
use crate::runtime::Runtime;
use crate::types::Message;

const MAX_CHARS: usize = 60;
const CONTEXT_MESSAGES: usize = 4;
const DEFAULT_TEMPERATURE: f32 = 0.5;

/// Transcript of the start of the conversation, the title model's only input
fn transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .take(CONTEXT_MESSAGES)
        .map(|m| match m {
            Message::User(user) => format!("User: {}", user.content),
            Message::Assistant(_) => "Assistant: [response]".to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Trim, drop one pair of surrounding quotes and cap the length
fn clean(raw: &str) -> Option<String> {
    const QUOTES: &[char] = &['"', '\''];
    let title = raw.trim();
    let title = title.strip_prefix(QUOTES).unwrap_or(title);
    let title = title.strip_suffix(QUOTES).unwrap_or(title);
    let title: String = title.trim().chars().take(MAX_CHARS).collect();
    (!title.is_empty()).then_some(title)
}

async fn request(runtime: &Runtime, session_id: &str, cancel: &CancellationToken) -> Result<Option<String>> {
    let agent = runtime.agents().get(TITLE)?;
    let model = runtime.providers().resolve(&agent, None)?;
    let backend = runtime.providers().language(&model)?;

    let messages = runtime.store().list_messages(session_id);
    if messages.is_empty() {
        return Ok(None);
    }
    let prompt = rho_ai::Message::user(transcript(&messages));
    let mut request = StreamRequest::new(model, agent.prompt.into_iter().collect(), vec![prompt]);
    request.temperature = Some(agent.temperature.unwrap_or(DEFAULT_TEMPERATURE));

    let raw = LlmCall::new(backend, request).text(cancel).await?;
    Ok(clean(&raw))
}

/// Ask the title agent for a short title and store it on the session.
/// Failures are logged and leave the title unchanged.
pub async fn generate(runtime: &Runtime, session_id: &str) -> Option<String> {
    let cancel = CancellationToken::new();
    match request(runtime, session_id, &cancel).await {
        Ok(Some(title)) => match runtime.store().set_title(session_id, title.as_str()) {
            Ok(_) => {
                debug!(session = session_id, %title, "session titled");
                Some(title)
            }
            Err(e) => {
                warn!(session = session_id, error = %e, "failed to store title");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!(session = session_id, error = %e, "title generation failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_strips_quotes_and_whitespace() {
        assert_eq!(clean("  \"Fix the parser\"\n").as_deref(), Some("Fix the parser"));
        assert_eq!(clean("'Refactor storage'").as_deref(), Some("Refactor storage"));
        assert_eq!(clean("Plain").as_deref(), Some("Plain"));
        assert_eq!(clean("  \"\" "), None);
        assert_eq!(clean(""), None);
    }

    #[test]
    fn test_clean_caps_length() {
        let long = "ü".repeat(100);
        assert_eq!(clean(&long).unwrap().chars().count(), MAX_CHARS);
    }

    #[test]
    fn test_transcript_uses_first_messages() {
        let messages = vec![
            Message::user("ses_1", "fix the bug"),
            Message::assistant("ses_1"),
            Message::user("ses_1", "and add a test"),
            Message::assistant("ses_1"),
            Message::user("ses_1", "ignored"),
        ];
        assert_eq!(
            transcript(&messages),
            "User: fix the bug\nAssistant: [response]\nUser: and add a test\nAssistant: [response]"
        );
    }
}
