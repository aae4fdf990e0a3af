use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use haven_core::context::WindowEntry;
use haven_core::errors::AgentError;

use crate::agent::{ResponseAgent, SummarizationAgent};

/// Pre-programmed replies for deterministic testing without model calls.
#[derive(Clone, Debug)]
pub enum MockReply {
    Text(String),
    Error(AgentError),
    /// Wait, then yield the inner reply.
    Delayed(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn text(s: &str) -> Self {
        Self::Text(s.to_string())
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delayed(delay, Box::new(inner))
    }
}

async fn resolve(reply: MockReply) -> Result<String, AgentError> {
    let mut current = reply;
    loop {
        match current {
            MockReply::Text(text) => return Ok(text),
            MockReply::Error(e) => return Err(e),
            MockReply::Delayed(delay, inner) => {
                tokio::time::sleep(delay).await;
                current = *inner;
            }
        }
    }
}

/// Recorded input of one summarize() call, for assertions.
#[derive(Clone, Debug, PartialEq)]
pub struct SummarizeCall {
    pub previous_summary: Option<String>,
    pub turns: Vec<String>,
}

/// Scripted summarizer: replies are consumed in order; when the script
/// runs dry the fallback (if any) repeats forever.
pub struct MockSummarizer {
    script: Mutex<Vec<MockReply>>,
    fallback: Option<String>,
    calls: Mutex<Vec<SummarizeCall>>,
}

impl MockSummarizer {
    pub fn new(script: Vec<MockReply>) -> Self {
        Self {
            script: Mutex::new(script),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Reply with the same text on every call.
    pub fn always(text: &str) -> Self {
        Self {
            script: Mutex::new(Vec::new()),
            fallback: Some(text.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<SummarizeCall> {
        self.calls.lock().clone()
    }

    fn next_reply(&self) -> Result<MockReply, AgentError> {
        let mut script = self.script.lock();
        if script.is_empty() {
            return match &self.fallback {
                Some(text) => Ok(MockReply::Text(text.clone())),
                None => Err(AgentError::InvalidRequest(
                    "MockSummarizer: script exhausted".into(),
                )),
            };
        }
        Ok(script.remove(0))
    }
}

#[async_trait]
impl SummarizationAgent for MockSummarizer {
    fn name(&self) -> &str {
        "mock-summarizer"
    }

    async fn summarize(
        &self,
        previous_summary: Option<&str>,
        turns: &[String],
    ) -> Result<String, AgentError> {
        self.calls.lock().push(SummarizeCall {
            previous_summary: previous_summary.map(str::to_string),
            turns: turns.to_vec(),
        });
        let reply = self.next_reply()?;
        resolve(reply).await
    }
}

/// Scripted responder, mirroring MockSummarizer.
pub struct MockResponder {
    script: Mutex<Vec<MockReply>>,
    fallback: Option<String>,
    windows_seen: Mutex<Vec<usize>>,
}

impl MockResponder {
    pub fn new(script: Vec<MockReply>) -> Self {
        Self {
            script: Mutex::new(script),
            fallback: None,
            windows_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn always(text: &str) -> Self {
        Self {
            script: Mutex::new(Vec::new()),
            fallback: Some(text.to_string()),
            windows_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.windows_seen.lock().len()
    }

    /// Window sizes observed per call.
    pub fn windows_seen(&self) -> Vec<usize> {
        self.windows_seen.lock().clone()
    }

    fn next_reply(&self) -> Result<MockReply, AgentError> {
        let mut script = self.script.lock();
        if script.is_empty() {
            return match &self.fallback {
                Some(text) => Ok(MockReply::Text(text.clone())),
                None => Err(AgentError::InvalidRequest(
                    "MockResponder: script exhausted".into(),
                )),
            };
        }
        Ok(script.remove(0))
    }
}

#[async_trait]
impl ResponseAgent for MockResponder {
    fn name(&self) -> &str {
        "mock-responder"
    }

    async fn respond(&self, window: &[WindowEntry]) -> Result<String, AgentError> {
        self.windows_seen.lock().push(window.len());
        let reply = self.next_reply()?;
        resolve(reply).await
    }
}
