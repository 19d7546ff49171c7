//! The engine façade
//!
//! A [`Runtime`] owns every shared component: the bus, the conversation
//! store, the permission engine, agents, models, tools and the per-session
//! cancellation controllers. Build one with [`Runtime::builder`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rho_ai::LanguageModel;
use tracing::{debug, info};

use crate::agent::AgentRegistry;
use crate::bus::Bus;
use crate::compaction;
use crate::config::Config;
use crate::error::Result;
use crate::handle::Controllers;
use crate::llm::RetryConfig;
use crate::permission::PermissionEngine;
use crate::processor::{Outcome, Processor};
use crate::prompt::{self, PromptInput};
use crate::provider::Providers;
use crate::snapshot::{FileDiff, NoSnapshot, Snapshot};
use crate::status::{SessionStatus, StatusTracker};
use crate::storage::Storage;
use crate::store::ConversationStore;
use crate::summary;
use crate::title;
use crate::truncate;
use crate::tool::{BoxedTool, ToolRegistry};
use crate::types::{AssistantMessage, Message, Session};

pub struct Runtime {
    directory: PathBuf,
    config: Config,
    bus: Bus,
    store: ConversationStore,
    permissions: PermissionEngine,
    status: StatusTracker,
    agents: AgentRegistry,
    providers: Providers,
    tools: ToolRegistry,
    snapshot: Arc<dyn Snapshot>,
    processor: Processor,
    controllers: Controllers,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn permissions(&self) -> &PermissionEngine {
        &self.permissions
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn snapshot(&self) -> &dyn Snapshot {
        self.snapshot.as_ref()
    }

    pub(crate) fn processor(&self) -> &Processor {
        &self.processor
    }

    pub(crate) fn status(&self) -> &StatusTracker {
        &self.status
    }

    pub fn session_status(&self, session_id: &str) -> SessionStatus {
        self.status.get(session_id)
    }

    /// Whether a generation is in flight for the session
    pub fn is_running(&self, session_id: &str) -> bool {
        self.controllers.is_running(session_id)
    }

    /// Append a user message and run the prompt loop to completion.
    ///
    /// A generation already running for the session is cancelled first and
    /// finishes unwinding before this one starts. Returns the last assistant
    /// message of the session.
    pub async fn prompt(&self, input: PromptInput) -> Result<Option<AssistantMessage>> {
        let session = self.store.get_session(&input.session_id)?;
        let generation = self.controllers.start(&session.id);
        let _running = generation.lock().await;
        debug!(session = %session.id, "generation started");

        self.store
            .create_message(Message::user(&session.id, input.content))?;
        self.store.touch(&session.id)?;

        let agent = match input.agent.or(session.agent) {
            Some(agent) => agent,
            None => self.agents.default_agent()?,
        };
        prompt::run(
            self,
            &session.id,
            &agent,
            input.model.as_deref(),
            generation.token(),
        )
        .await
    }

    /// Cancel the session's generation and fail its outstanding permission
    /// requests. Returns whether a generation was running.
    pub fn cancel(&self, session_id: &str) -> bool {
        let running = self.controllers.cancel(session_id);
        self.permissions.cancel_session(session_id);
        if running {
            info!(session = session_id, "session cancelled");
        }
        running
    }

    /// Cancel whatever runs for the session, wait for it to unwind, then
    /// delete the session and everything the engine keeps for it
    pub async fn remove_session(&self, session_id: &str) -> Result<()> {
        self.store.get_session(session_id)?;
        {
            let generation = self.controllers.start(session_id);
            let _running = generation.lock().await;
            self.permissions.forget_session(session_id);
            self.store.remove_session(session_id)?;
        }
        self.status.forget(session_id);
        info!(session = session_id, "session removed");
        Ok(())
    }

    /// Summarize the session now, as a manual compaction
    pub async fn compact(&self, session_id: &str) -> Result<Outcome> {
        self.store.get_session(session_id)?;
        let generation = self.controllers.start(session_id);
        let _running = generation.lock().await;
        let model = self.session_model(session_id);
        compaction::process(self, session_id, model.as_ref(), false, generation.token()).await
    }

    /// Replace old tool output, see [`compaction::prune`]
    pub fn prune(&self, session_id: &str) -> Result<usize> {
        compaction::prune(&self.store, session_id)
    }

    /// Generate and store a title for the session
    pub async fn generate_title(&self, session_id: &str) -> Option<String> {
        title::generate(self, session_id).await
    }

    /// Delete saved tool outputs past their retention. Hosts call this at
    /// startup.
    pub async fn cleanup_tool_output(&self) -> Result<usize> {
        let Some(dir) = self.tools.output_dir() else {
            return Ok(0);
        };
        let removed = truncate::cleanup(dir).await?;
        if removed > 0 {
            info!(removed, "old tool output removed");
        }
        Ok(removed)
    }

    /// Recompute the session's file-change summary
    pub async fn summarize(&self, session_id: &str) -> Result<Vec<FileDiff>> {
        summary::summarize(&self.store, self.snapshot(), session_id).await
    }

    /// The model the session last ran on, if it is still known
    fn session_model(&self, session_id: &str) -> Option<rho_ai::Model> {
        self.store
            .list_messages(session_id)
            .iter()
            .rev()
            .filter_map(Message::as_assistant)
            .find_map(|a| a.model.as_deref())
            .and_then(|qualified| self.providers.get_model(qualified).ok())
    }

    /// Start a session in the runtime's directory
    pub fn create_session(&self, project_id: &str) -> Result<Session> {
        self.store.create_session(crate::types::NewSession::new(
            project_id,
            self.directory.display().to_string(),
        ))
    }
}

/// Assembles a [`Runtime`]
#[derive(Default)]
pub struct RuntimeBuilder {
    directory: Option<PathBuf>,
    config: Option<Config>,
    providers: Option<Providers>,
    backends: Vec<(String, Arc<dyn LanguageModel>)>,
    storage: Option<Arc<dyn Storage>>,
    snapshot: Option<Arc<dyn Snapshot>>,
    retry: Option<RetryConfig>,
    bus: Option<Bus>,
    tools: Vec<BoxedTool>,
    tool_output_dir: Option<PathBuf>,
}

impl RuntimeBuilder {
    /// Project directory; defaults to the current directory
    pub fn directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Configuration; loaded from the directory when not set
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Model catalog; built from the configuration when not set
    pub fn providers(mut self, providers: Providers) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Serve every model of `provider_id` with `backend`
    pub fn backend(mut self, provider_id: impl Into<String>, backend: Arc<dyn LanguageModel>) -> Self {
        self.backends.push((provider_id.into(), backend));
        self
    }

    /// Persist records to `storage`, loading what it already holds
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn snapshot(mut self, snapshot: Arc<dyn Snapshot>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn tool(mut self, tool: BoxedTool) -> Self {
        self.tools.push(tool);
        self
    }

    /// Where truncated tool output is saved in full; defaults to the user's
    /// data directory
    pub fn tool_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tool_output_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let directory = match self.directory {
            Some(directory) => directory,
            None => std::env::current_dir()?,
        };
        let config = match self.config {
            Some(config) => config,
            None => Config::load(&directory)?,
        };
        let bus = self.bus.unwrap_or_default();
        let store = match self.storage {
            Some(storage) => ConversationStore::open(storage, bus.clone())?,
            None => ConversationStore::new(bus.clone()),
        };

        let mut providers = self
            .providers
            .unwrap_or_else(|| Providers::from_config(&config));
        for (provider_id, backend) in self.backends {
            providers.register_backend(provider_id, backend);
        }

        let tools = match self.tool_output_dir.or_else(truncate::default_dir) {
            Some(dir) => ToolRegistry::with_output_dir(dir),
            None => ToolRegistry::new(),
        };
        for tool in self.tools {
            tools.register(tool);
        }

        let status = StatusTracker::new(bus.clone());
        let snapshot = self.snapshot.unwrap_or_else(|| Arc::new(NoSnapshot));
        let processor = Processor::new(store.clone(), status.clone())
            .with_snapshot(snapshot.clone())
            .with_retry_config(self.retry.unwrap_or_default())
            .with_auto_compact(config.compaction.auto);

        info!(
            directory = %directory.display(),
            models = providers.models().len(),
            tools = tools.ids().len(),
            "runtime ready"
        );
        Ok(Runtime {
            agents: AgentRegistry::new(&config),
            permissions: PermissionEngine::new(bus.clone()),
            directory,
            config,
            bus,
            store,
            status,
            providers,
            tools,
            snapshot,
            processor,
            controllers: Controllers::new(),
        })
    }
}
