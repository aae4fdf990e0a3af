use async_trait::async_trait;

use haven_core::context::WindowEntry;
use haven_core::errors::AgentError;

/// Condenses conversation history into one narrative. Implementations
/// call out to a language model and may fail or time out; callers treat
/// both the same and never partially apply a result.
#[async_trait]
pub trait SummarizationAgent: Send + Sync {
    fn name(&self) -> &str;

    /// Produce a condensed narrative of `turns`. When a previous summary
    /// exists it is part of the input, so information carries across
    /// repeated compressions instead of silently dropping.
    async fn summarize(
        &self,
        previous_summary: Option<&str>,
        turns: &[String],
    ) -> Result<String, AgentError>;
}

/// Generates a reply from the current context window. Selection of the
/// concrete implementation is configuration, not runtime probing.
#[async_trait]
pub trait ResponseAgent: Send + Sync {
    fn name(&self) -> &str;

    async fn respond(&self, window: &[WindowEntry]) -> Result<String, AgentError>;
}
