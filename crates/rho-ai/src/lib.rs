//! rho-ai: Provider-neutral model vocabulary
//!
//! This crate defines the types shared between the agent engine and whatever
//! provider adapter sits underneath it: model descriptors, conversation
//! messages, the typed stream events a model produces, and the
//! [`LanguageModel`] streaming trait.

pub mod error;
pub mod model;
pub mod stream;
pub mod types;

pub use error::{Error, Result, retry_reason};
pub use model::LanguageModel;
pub use stream::{EventStream, StreamEvent, StreamRequest};
pub use types::*;
