//! rho-agent: Agent execution engine
//!
//! Runs conversations between a user and a model that calls tools. The
//! engine records every turn in a [`ConversationStore`], gates tool side
//! effects through the [`PermissionEngine`], turns model streams into
//! durable records with the [`Processor`] and drives turns with the prompt
//! loop behind [`Runtime::prompt`]. Every state change is published on the
//! [`Bus`].

pub mod agent;
pub mod bus;
pub mod compaction;
pub mod config;
pub mod error;
pub mod events;
pub mod handle;
pub mod id;
pub mod instruction;
pub mod llm;
pub mod permission;
pub mod processor;
pub mod prompt;
pub mod provider;
pub mod runtime;
pub mod snapshot;
pub mod status;
pub mod storage;
pub mod store;
pub mod summary;
pub mod system;
pub mod title;
pub mod tool;
pub mod truncate;
pub mod types;

pub use agent::{AgentInfo, AgentMode, AgentRegistry};
pub use bus::{Bus, Subscription};
pub use config::Config;
pub use error::{Error, Result};
pub use events::{Event, EventKind};
pub use handle::{Controllers, Generation};
pub use llm::{LlmCall, RetryConfig, ToolExecutor};
pub use permission::{
    Action, PermissionEngine, PermissionError, PermissionReply, PermissionRequest, Rule, Ruleset,
};
pub use processor::{Outcome, Processor};
pub use prompt::PromptInput;
pub use provider::Providers;
pub use runtime::{Runtime, RuntimeBuilder};
pub use snapshot::{FileDiff, MemorySnapshot, NoSnapshot, Snapshot};
pub use status::SessionStatus;
pub use storage::{JsonStorage, MemoryStorage, Storage};
pub use store::{ConversationStore, MessageWithParts};
pub use tool::{BoxedTool, Tool, ToolContext, ToolError, ToolOutput, ToolRegistry};
pub use types::*;
