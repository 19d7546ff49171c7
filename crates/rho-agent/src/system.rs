//! System prompt assembly

use std::path::Path;

use crate::agent::AgentInfo;
use crate::config::Config;
use crate::instruction;

const PROMPT_ANTHROPIC: &str = include_str!("prompt/anthropic.txt");
const PROMPT_OPENAI: &str = include_str!("prompt/openai.txt");
const PROMPT_GEMINI: &str = include_str!("prompt/gemini.txt");
const PROMPT_DEFAULT: &str = include_str!("prompt/default.txt");

/// Default prompt for a model family
pub fn provider(model_id: &str) -> &'static str {
    if model_id.contains("claude") {
        PROMPT_ANTHROPIC
    } else if ["gpt-", "o1", "o3", "o4"].iter().any(|p| model_id.contains(p)) {
        PROMPT_OPENAI
    } else if model_id.contains("gemini") {
        PROMPT_GEMINI
    } else {
        PROMPT_DEFAULT
    }
}

/// Facts about where the agent is running
pub fn environment(directory: &Path) -> String {
    let git = if instruction::find_repo_root(directory).is_some() {
        "yes"
    } else {
        "no"
    };
    [
        "Here is useful information about the environment you are running in:".to_string(),
        "<env>".to_string(),
        format!("  Working directory: {}", directory.display()),
        format!("  Is directory a git repo: {git}"),
        format!("  Platform: {}", std::env::consts::OS),
        format!("  Today's date: {}", chrono::Local::now().format("%a %b %d %Y")),
        "</env>".to_string(),
    ]
    .join("\n")
}

/// Agent prompt (or the model family default), environment, then project
/// instructions
pub fn build(agent: &AgentInfo, model_id: &str, directory: &Path, config: &Config) -> Vec<String> {
    let mut parts = vec![match &agent.prompt {
        Some(prompt) => prompt.clone(),
        None => provider(model_id).to_string(),
    }];
    parts.push(environment(directory));
    parts.extend(instruction::system(directory, config));
    parts.retain(|p| !p.trim().is_empty());
    parts
}
