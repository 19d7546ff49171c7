//! Agent definitions
//!
//! An agent is a named bundle of system prompt, sampling settings, step
//! limit and permission policy. The built-in set is extended and overridden
//! by the `[agent.*]` tables of the configuration; the user's top-level
//! `[permission]` rules are appended to every agent last, so they win.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{AgentConfig, Config};
use crate::error::{Error, Result};
use crate::permission::{Action, PermissionConfig, Ruleset};

pub const BUILD: &str = "build";
pub const COMPACTION: &str = "compaction";
pub const TITLE: &str = "title";
pub const SUMMARY: &str = "summary";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Primary,
    Subagent,
    All,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentInfo {
    pub name: String,
    pub description: Option<String>,
    pub mode: AgentMode,
    pub hidden: bool,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub permission: Ruleset,
    /// `provider/model` override
    pub model: Option<String>,
    pub prompt: Option<String>,
    /// Step ceiling for the prompt loop
    pub steps: Option<u32>,
}

impl AgentInfo {
    fn new(name: &str, description: &str, mode: AgentMode, permission: Ruleset) -> Self {
        Self {
            name: name.to_string(),
            description: Some(description.to_string()),
            mode,
            hidden: false,
            temperature: None,
            top_p: None,
            permission,
            model: None,
            prompt: None,
            steps: None,
        }
    }

    fn prompt(mut self, prompt: &str) -> Self {
        self.prompt = Some(prompt.to_string());
        self
    }

    fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    fn apply(&mut self, config: &AgentConfig) {
        if let Some(model) = &config.model {
            self.model = Some(model.clone());
        }
        if let Some(prompt) = &config.prompt {
            self.prompt = Some(prompt.clone());
        }
        if let Some(description) = &config.description {
            self.description = Some(description.clone());
        }
        if config.temperature.is_some() {
            self.temperature = config.temperature;
        }
        if config.top_p.is_some() {
            self.top_p = config.top_p;
        }
        if let Some(mode) = config.mode {
            self.mode = mode;
        }
        if let Some(hidden) = config.hidden {
            self.hidden = hidden;
        }
        if config.steps.is_some() {
            self.steps = config.steps;
        }
        if let Some(permission) = &config.permission {
            self.permission =
                Ruleset::merge(&[&self.permission, &Ruleset::from_config(permission)]);
        }
    }
}

/// Rules every agent starts from
pub fn default_permissions() -> Ruleset {
    Ruleset::from_config(
        &PermissionConfig::new()
            .action("*", Action::Allow)
            .action("doom_loop", Action::Ask)
            .action("plan_enter", Action::Deny)
            .action("plan_exit", Action::Deny)
            .patterns(
                "read",
                &[
                    ("*", Action::Allow),
                    ("*.env", Action::Ask),
                    ("*.env.*", Action::Ask),
                ],
            ),
    )
}

fn with_defaults(extra: PermissionConfig) -> Ruleset {
    Ruleset::merge(&[&default_permissions(), &Ruleset::from_config(&extra)])
}

fn builtin() -> Vec<AgentInfo> {
    let deny_all = || with_defaults(PermissionConfig::new().action("*", Action::Deny));
    vec![
        AgentInfo::new(
            BUILD,
            "The default agent. Executes tools based on configured permissions.",
            AgentMode::Primary,
            with_defaults(
                PermissionConfig::new()
                    .action("question", Action::Allow)
                    .action("plan_enter", Action::Allow),
            ),
        )
        .prompt(include_str!("prompt/build.txt")),
        AgentInfo::new(
            "plan",
            "Plan mode. Disallows all edit tools.",
            AgentMode::Primary,
            with_defaults(
                PermissionConfig::new()
                    .action("question", Action::Allow)
                    .action("plan_exit", Action::Allow)
                    .patterns(
                        "edit",
                        &[("*", Action::Deny), (".rho/plans/*.md", Action::Allow)],
                    ),
            ),
        )
        .prompt(include_str!("prompt/plan.txt")),
        AgentInfo::new(
            "general",
            "General-purpose agent for researching complex questions and executing multi-step tasks.",
            AgentMode::Subagent,
            with_defaults(
                PermissionConfig::new()
                    .action("todoread", Action::Deny)
                    .action("todowrite", Action::Deny),
            ),
        ),
        AgentInfo::new(
            "explore",
            "Fast agent specialized for exploring codebases with read-only access.",
            AgentMode::Subagent,
            with_defaults(
                PermissionConfig::new()
                    .action("*", Action::Deny)
                    .action("grep", Action::Allow)
                    .action("glob", Action::Allow)
                    .action("read", Action::Allow)
                    .action("bash", Action::Allow)
                    .action("websearch", Action::Allow),
            ),
        )
        .prompt(include_str!("prompt/explore.txt")),
        AgentInfo::new(
            COMPACTION,
            "Context compaction agent for handling token limits.",
            AgentMode::Primary,
            deny_all(),
        )
        .prompt(include_str!("prompt/compaction.txt"))
        .hidden(),
        AgentInfo {
            temperature: Some(0.5),
            ..AgentInfo::new(
                TITLE,
                "Generates descriptive titles for sessions.",
                AgentMode::Primary,
                deny_all(),
            )
            .prompt(include_str!("prompt/title.txt"))
            .hidden()
        },
        AgentInfo::new(
            SUMMARY,
            "Generates conversation summaries.",
            AgentMode::Primary,
            deny_all(),
        )
        .prompt(include_str!("prompt/summary.txt"))
        .hidden(),
    ]
}

/// The resolved set of agents
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: Vec<AgentInfo>,
    configured_default: Option<String>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

impl AgentRegistry {
    pub fn new(config: &Config) -> Self {
        let mut agents = builtin();
        let user = Ruleset::from_config(&config.permission);

        for (name, overrides) in &config.agent {
            if overrides.disable {
                agents.retain(|a| &a.name != name);
                continue;
            }
            let index = match agents.iter().position(|a| &a.name == name) {
                Some(index) => index,
                None => {
                    agents.push(AgentInfo {
                        description: None,
                        ..AgentInfo::new(name, "", AgentMode::All, default_permissions())
                    });
                    agents.len() - 1
                }
            };
            agents[index].apply(overrides);
        }
        for agent in &mut agents {
            agent.permission = Ruleset::merge(&[&agent.permission, &user]);
        }

        Self {
            agents,
            configured_default: config.default_agent.clone(),
        }
    }

    pub fn get(&self, name: &str) -> Result<AgentInfo> {
        self.agents
            .iter()
            .find(|a| a.name == name)
            .cloned()
            .ok_or_else(|| Error::AgentNotFound(name.to_string()))
    }

    /// Default agent first, the rest by name
    pub fn list(&self) -> Vec<AgentInfo> {
        let default = self.default_agent().ok();
        let mut agents = self.agents.clone();
        agents.sort_by(|a, b| {
            let a_default = Some(&a.name) == default.as_ref();
            let b_default = Some(&b.name) == default.as_ref();
            b_default.cmp(&a_default).then_with(|| a.name.cmp(&b.name))
        });
        agents
    }

    /// The configured default when it is a visible primary agent, else the
    /// first visible primary agent
    pub fn default_agent(&self) -> Result<String> {
        if let Some(name) = &self.configured_default {
            match self.agents.iter().find(|a| &a.name == name) {
                Some(agent) if agent.mode != AgentMode::Subagent && !agent.hidden => {
                    return Ok(agent.name.clone());
                }
                Some(_) => warn!(agent = %name, "default agent is a subagent or hidden"),
                None => warn!(agent = %name, "default agent not found"),
            }
        }
        self.agents
            .iter()
            .find(|a| a.mode != AgentMode::Subagent && !a.hidden)
            .map(|a| a.name.clone())
            .ok_or_else(|| Error::AgentNotFound("no primary visible agent".into()))
    }
}
