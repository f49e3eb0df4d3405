use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::*;

/// LLM backend — completion and streaming over one network endpoint.
///
/// Implementations turn every backend failure (connection refused, timeout,
/// malformed response) into an error value; they never panic.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and return the full completion text.
    fn complete(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<String>>;

    /// Send a chat request and receive a stream of text fragments.
    fn stream_complete(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>>;
}

/// Tool — a capability the executor may invoke by name.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (as referenced by plan steps).
    fn name(&self) -> &str;

    /// Human-readable description, surfaced to the planner prompt.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given input.
    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Session memory store — keyed, ordered conversation history.
pub trait SessionStore: Send + Sync + 'static {
    /// Load up to `limit` most recent messages for a session, oldest first.
    fn history(
        &self,
        sid: &SessionId,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<ChatMessage>>>;

    /// Append messages to a session.
    fn append(&self, sid: &SessionId, msgs: &[ChatMessage]) -> BoxFuture<'_, Result<()>>;

    /// Discard a session's history unconditionally. Idempotent.
    fn clear(&self, sid: &SessionId) -> BoxFuture<'_, Result<()>>;
}
