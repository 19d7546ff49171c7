//! Configuration file support
//!
//! Two TOML files are read: the global one under the user's config
//! directory, then `rho.toml` in the project directory. Top-level keys from
//! the project file replace the global ones.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::agent::AgentMode;
use crate::error::Result;
use crate::permission::PermissionConfig;

pub const PROJECT_FILE: &str = "rho.toml";

/// Configuration for rho
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default model as `provider/model`
    pub model: Option<String>,
    pub default_agent: Option<String>,
    /// Extra instruction files, relative to the project directory
    pub instructions: Vec<String>,
    /// Model catalog
    pub provider: Vec<ProviderConfig>,
    /// Per-agent overrides, and additional agents
    pub agent: BTreeMap<String, AgentConfig>,
    /// User permission rules, applied after every agent's own rules
    pub permission: PermissionConfig,
    pub limits: Limits,
    pub compaction: CompactionConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Context window in tokens
    #[serde(default)]
    pub context: u32,
    /// Output limit in tokens
    #[serde(default)]
    pub output: u32,
    #[serde(default)]
    pub reasoning: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub model: Option<String>,
    pub prompt: Option<String>,
    pub description: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub mode: Option<AgentMode>,
    pub hidden: Option<bool>,
    pub steps: Option<u32>,
    pub disable: bool,
    pub permission: Option<PermissionConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Step ceiling for agents that do not set their own
    pub max_steps: u32,
    pub max_tokens: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_steps: 50,
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Summarize automatically when the context overflows
    pub auto: bool,
    /// Replace old tool output once the loop goes idle
    pub prune: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            auto: true,
            prune: true,
        }
    }
}

impl Config {
    /// Get the global config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rho")
    }

    /// Get the global config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("RHO_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Parse a single document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load the global file, then the project file in `directory`
    pub fn load(directory: &Path) -> Result<Self> {
        let mut merged = read_table(&Self::config_path())?.unwrap_or_default();
        if let Some(project) = read_table(&directory.join(PROJECT_FILE))? {
            merged.extend(project);
        }
        Ok(toml::Value::Table(merged).try_into()?)
    }
}

fn read_table(path: &Path) -> Result<Option<toml::Table>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    debug!(path = %path.display(), "loaded config");
    Ok(Some(toml::from_str(&content)?))
}
