//! The streaming interface every provider adapter implements

use crate::{EventStream, Result, StreamRequest};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A model backend that can stream a response.
///
/// Implementations yield text, tool-call and step events, ending in `Finish`
/// or `Error`. Tool results are never produced by the backend itself; the
/// agent engine executes tools and splices their outcomes into the stream.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Start streaming a response for `request`.
    ///
    /// Errors returned here (as opposed to `Error` events inside the stream)
    /// mean the request never started.
    async fn stream(&self, request: StreamRequest, cancel: CancellationToken)
    -> Result<EventStream>;
}
