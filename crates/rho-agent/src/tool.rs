//! Tool contract and registry

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rho_ai::{Model, ToolSpec};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::permission::{AskInput, PermissionEngine, PermissionError, Ruleset, ToolRef};
use crate::store::ConversationStore;
use crate::truncate::{self, TruncateOptions};
use crate::types::Part;

/// What a tool hands back on success
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Short label for the UI
    pub title: String,
    /// Text returned to the model
    pub output: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ToolOutput {
    pub fn new(title: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            output: output.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A tool failure, recorded on the tool part and shown to the model
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct ToolError(pub String);

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<PermissionError> for ToolError {
    fn from(e: PermissionError) -> Self {
        Self(e.to_string())
    }
}

impl From<String> for ToolError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ToolError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-call context handed to [`Tool::execute`]
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub message_id: String,
    pub call_id: String,
    pub agent: String,
    cancel: CancellationToken,
    ruleset: Ruleset,
    permissions: PermissionEngine,
    store: ConversationStore,
}

impl ToolContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        call_id: impl Into<String>,
        agent: impl Into<String>,
        cancel: CancellationToken,
        ruleset: Ruleset,
        permissions: PermissionEngine,
        store: ConversationStore,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            message_id: message_id.into(),
            call_id: call_id.into(),
            agent: agent.into(),
            cancel,
            ruleset,
            permissions,
            store,
        }
    }

    /// Fires when the session is cancelled
    pub fn abort(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Ask for permission before an irreversible side effect. Resolves once
    /// policy or a human allows every pattern.
    pub async fn ask(
        &self,
        permission: &str,
        patterns: Vec<String>,
        metadata: serde_json::Value,
        always: Vec<String>,
    ) -> Result<(), PermissionError> {
        let input = AskInput {
            session_id: self.session_id.clone(),
            permission: permission.to_string(),
            patterns,
            metadata,
            always,
            ruleset: self.ruleset.clone(),
            tool: Some(ToolRef {
                message_id: self.message_id.clone(),
                call_id: self.call_id.clone(),
            }),
        };
        self.permissions.ask(input, &self.cancel).await
    }

    /// Report partial progress: updates the title and metadata of the
    /// running tool part.
    pub fn metadata(&self, title: Option<String>, metadata: serde_json::Value) {
        let Some(part) = self.store.find_tool_part(&self.message_id, &self.call_id) else {
            debug!(call_id = %self.call_id, "no tool part for progress update");
            return;
        };
        if part.state.is_terminal() {
            return;
        }
        let result = self.store.update_part(&part.id, |p| {
            if let Part::Tool(tool) = p {
                if !tool.state.is_terminal() {
                    if title.is_some() {
                        tool.state.title = title;
                    }
                    tool.state.metadata = Some(metadata);
                }
            }
        });
        if let Err(e) = result {
            warn!(error = %e, "failed to record tool progress");
        }
    }
}

/// An executable tool
#[async_trait]
pub trait Tool: Send + Sync {
    /// Id the model calls the tool by
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the arguments
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolOutput, ToolError>;
}

pub type BoxedTool = Arc<dyn Tool>;

/// Advertised form of a tool
pub fn to_spec(tool: &dyn Tool) -> ToolSpec {
    ToolSpec::new(tool.id(), tool.description(), tool.parameters_schema())
}

/// A tool with its compiled argument validator
#[derive(Clone)]
pub struct RegisteredTool {
    pub tool: BoxedTool,
    validator: Option<Arc<jsonschema::Validator>>,
    output_dir: Option<Arc<PathBuf>>,
}

impl RegisteredTool {
    fn new(tool: BoxedTool, output_dir: Option<Arc<PathBuf>>) -> Self {
        let validator = match jsonschema::validator_for(&tool.parameters_schema()) {
            Ok(validator) => Some(Arc::new(validator)),
            Err(e) => {
                warn!(
                    "Invalid tool parameter schema for '{}', skipping validation: {}",
                    tool.id(),
                    e
                );
                None
            }
        };
        Self {
            tool,
            validator,
            output_dir,
        }
    }

    pub fn id(&self) -> &str {
        self.tool.id()
    }

    /// Check arguments against the schema. `Some(message)` when invalid.
    pub fn validate(&self, args: &serde_json::Value) -> Option<String> {
        let validator = self.validator.as_ref()?;
        let errors: Vec<String> = validator
            .iter_errors(args)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();
        if errors.is_empty() {
            None
        } else {
            Some(format!(
                "The {} tool was called with invalid arguments: {}.\nPlease rewrite the input so it satisfies the expected schema.",
                self.id(),
                errors.join("; ")
            ))
        }
    }

    /// Validate, execute, then truncate the output
    pub async fn run(
        &self,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        if let Some(message) = self.validate(&args) {
            return Err(ToolError(message));
        }
        let mut result = self.tool.execute(args, ctx).await?;
        let truncated = truncate::output(
            &result.output,
            TruncateOptions::default(),
            self.output_dir.as_deref().map(PathBuf::as_path),
        )
        .await;
        if truncated.truncated {
            result.output = truncated.content;
            if result.metadata.is_null() {
                result.metadata = serde_json::json!({});
            }
            if let serde_json::Value::Object(map) = &mut result.metadata {
                map.insert("truncated".into(), true.into());
                if let Some(path) = truncated.output_path {
                    map.insert("output_path".into(), path.display().to_string().into());
                }
            }
        }
        Ok(result)
    }
}

/// Whether a model should get `apply_patch` instead of `edit`/`write`
pub fn uses_patch(model: &Model) -> bool {
    model.id.contains("gpt-") && !model.id.contains("oss") && !model.id.contains("gpt-4")
}

/// Ordered set of tools, dispatched by id
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<Vec<RegisteredTool>>>,
    output_dir: Option<Arc<PathBuf>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save the full text of truncated outputs under `dir`
    pub fn with_output_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            tools: Arc::default(),
            output_dir: Some(Arc::new(dir.into())),
        }
    }

    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref().map(PathBuf::as_path)
    }

    /// Add a tool, replacing any tool with the same id in place
    pub fn register(&self, tool: BoxedTool) {
        let entry = RegisteredTool::new(tool, self.output_dir.clone());
        let mut tools = self.tools.write();
        match tools.iter().position(|t| t.id() == entry.id()) {
            Some(index) => tools[index] = entry,
            None => tools.push(entry),
        }
    }

    pub fn get(&self, id: &str) -> Option<RegisteredTool> {
        self.tools.read().iter().find(|t| t.id() == id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.tools.read().iter().map(|t| t.id().to_string()).collect()
    }

    /// Tools offered to `model`, with the edit tool family chosen for it
    pub fn tools_for(&self, model: &Model) -> Vec<RegisteredTool> {
        let patch = uses_patch(model);
        self.tools
            .read()
            .iter()
            .filter(|t| match t.id() {
                "apply_patch" => patch,
                "edit" | "write" => !patch,
                _ => true,
            })
            .cloned()
            .collect()
    }
}
