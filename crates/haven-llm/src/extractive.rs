use async_trait::async_trait;

use haven_core::errors::AgentError;

use crate::agent::SummarizationAgent;

/// Model-free degraded-mode summarizer. Carries the prior summary and
/// appends a first-sentence extract of each new turn, trimming oldest
/// material to stay inside the byte budget. Used where no model
/// collaborator is configured; the narrative is crude but nothing is
/// silently dropped mid-window.
pub struct ExtractiveSummarizer {
    max_bytes: usize,
}

const EXTRACT_CAP: usize = 120;

impl ExtractiveSummarizer {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    fn extract(turn: &str) -> &str {
        let end = turn
            .char_indices()
            .find(|(_, c)| matches!(c, '.' | '!' | '?'))
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(turn.len());
        let end = end.min(EXTRACT_CAP);
        // Back off to a char boundary when the cap splits a codepoint.
        let mut end = end;
        while end > 0 && !turn.is_char_boundary(end) {
            end -= 1;
        }
        &turn[..end]
    }
}

#[async_trait]
impl SummarizationAgent for ExtractiveSummarizer {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn summarize(
        &self,
        previous_summary: Option<&str>,
        turns: &[String],
    ) -> Result<String, AgentError> {
        let mut parts: Vec<String> = Vec::with_capacity(turns.len() + 1);
        if let Some(prior) = previous_summary {
            parts.push(prior.to_string());
        }
        parts.extend(turns.iter().map(|t| Self::extract(t).to_string()));

        let mut text = parts.join(" ");
        if text.len() > self.max_bytes {
            let mut cut = text.len() - self.max_bytes;
            while cut < text.len() && !text.is_char_boundary(cut) {
                cut += 1;
            }
            text = text.split_off(cut);
        }
        Ok(text)
    }
}
