//! Model catalog and backend lookup

use std::collections::HashMap;
use std::sync::Arc;

use rho_ai::{LanguageModel, Model};
use tracing::{debug, info};

use crate::agent::AgentInfo;
use crate::config::Config;
use crate::error::{Error, Result};

/// Split `provider/model`. The model id may itself contain slashes.
pub fn parse_model(qualified: &str) -> Option<(&str, &str)> {
    qualified
        .split_once('/')
        .filter(|(provider, model)| !provider.is_empty() && !model.is_empty())
}

/// Known models and the backend serving each provider
#[derive(Clone, Default)]
pub struct Providers {
    models: Vec<Model>,
    backends: HashMap<String, Arc<dyn LanguageModel>>,
    default_model: Option<String>,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog from `[[provider]]` tables, with the configured default model
    pub fn from_config(config: &Config) -> Self {
        let mut providers = Self::new();
        for provider in &config.provider {
            for entry in &provider.models {
                let mut model =
                    Model::new(&provider.id, &entry.id).with_limit(entry.context, entry.output);
                if let Some(name) = &entry.name {
                    model.name = name.clone();
                }
                model.capabilities.reasoning = entry.reasoning;
                providers.add_model(model);
            }
            info!(id = %provider.id, models = provider.models.len(), "registered provider");
        }
        providers.default_model = config.model.clone();
        providers
    }

    /// Add a model, replacing one with the same qualified id
    pub fn add_model(&mut self, model: Model) {
        let id = model.qualified_id();
        match self.models.iter().position(|m| m.qualified_id() == id) {
            Some(index) => self.models[index] = model,
            None => self.models.push(model),
        }
    }

    /// Route every model of `provider_id` to `backend`
    pub fn register_backend(&mut self, provider_id: impl Into<String>, backend: Arc<dyn LanguageModel>) {
        self.backends.insert(provider_id.into(), backend);
    }

    pub fn set_default_model(&mut self, qualified: impl Into<String>) {
        self.default_model = Some(qualified.into());
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    /// Look up `provider/model`. Models missing from the catalog are still
    /// usable when their provider has a backend.
    pub fn get_model(&self, qualified: &str) -> Result<Model> {
        let (provider, id) =
            parse_model(qualified).ok_or_else(|| Error::NoModel(qualified.to_string()))?;
        if let Some(model) = self
            .models
            .iter()
            .find(|m| m.provider_id == provider && m.id == id)
        {
            return Ok(model.clone());
        }
        if self.backends.contains_key(provider) {
            debug!(model = qualified, "model not in catalog, using unknown limits");
            return Ok(Model::new(provider, id));
        }
        Err(Error::NoModel(qualified.to_string()))
    }

    /// Model for a turn: explicit override, then the agent's model, then the
    /// configured default, then the first catalog entry.
    pub fn resolve(&self, agent: &AgentInfo, requested: Option<&str>) -> Result<Model> {
        if let Some(qualified) = requested.or(agent.model.as_deref()) {
            return self.get_model(qualified);
        }
        if let Some(qualified) = &self.default_model {
            return self.get_model(qualified);
        }
        self.models
            .first()
            .cloned()
            .ok_or_else(|| Error::NoModel("no models configured".into()))
    }

    /// Backend serving `model`
    pub fn language(&self, model: &Model) -> Result<Arc<dyn LanguageModel>> {
        self.backends
            .get(&model.provider_id)
            .cloned()
            .ok_or_else(|| Error::NoModel(format!("no backend for provider {}", model.provider_id)))
    }
}
