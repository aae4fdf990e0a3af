use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

use haven_core::context::WindowEntry;
use haven_core::errors::AgentError;

use crate::agent::{ResponseAgent, SummarizationAgent};

/// Configuration for ReliableAgent retry and circuit breaker behavior.
#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

/// Wraps a summarization or response agent with retry logic and a
/// circuit breaker.
///
/// - Retries retryable errors with exponential backoff + jitter
/// - Respects `retry_after` hints from rate limit responses
/// - Circuit breaker: N consecutive failures → open → cooldown →
///   half-open → success → closed
pub struct ReliableAgent<A> {
    inner: A,
    config: ReliableConfig,
    circuit_state: Arc<RwLock<CircuitState>>,
    consecutive_failures: Arc<AtomicU32>,
    total_retries: Arc<AtomicU64>,
}

impl<A> ReliableAgent<A> {
    pub fn new(inner: A, config: ReliableConfig) -> Self {
        Self {
            inner,
            config,
            circuit_state: Arc::new(RwLock::new(CircuitState::Closed)),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            total_retries: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_defaults(inner: A) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    /// Gate a request through the circuit breaker. An open circuit that
    /// has cooled down moves to half-open and lets one probe through.
    fn check_circuit(&self) -> Result<(), AgentError> {
        let cooled_down = {
            let state = self.circuit_state.read();
            match &*state {
                CircuitState::Closed | CircuitState::HalfOpen => return Ok(()),
                CircuitState::Open { since } => {
                    since.elapsed() >= self.config.circuit_breaker_cooldown
                }
            }
        };

        if cooled_down {
            *self.circuit_state.write() = CircuitState::HalfOpen;
            Ok(())
        } else {
            Err(AgentError::Unavailable("circuit breaker open".into()))
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut state = self.circuit_state.write();
        if !matches!(*state, CircuitState::Closed) {
            info!("circuit breaker closed after successful request");
            *state = CircuitState::Closed;
        }
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures < self.config.circuit_breaker_threshold {
            return;
        }

        let mut state = self.circuit_state.write();
        if !matches!(*state, CircuitState::Open { .. }) {
            warn!(
                failures,
                cooldown_secs = self.config.circuit_breaker_cooldown.as_secs(),
                "circuit breaker opened"
            );
            *state = CircuitState::Open {
                since: Instant::now(),
            };
        }
    }

    /// Delay before the next attempt: a rate-limit hint wins outright,
    /// otherwise exponential backoff with jitter, floored at 100ms.
    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(hint) = suggested {
            return hint;
        }

        let base = self.config.base_delay.as_millis() as f64;
        let capped = (base * 2.0_f64.powi(attempt as i32))
            .min(self.config.max_delay.as_millis() as f64);

        let spread = capped * self.config.jitter_factor;
        let jitter = if spread >= 1.0 {
            (jitter_source() % (spread as u64 * 2 + 1)) as f64 - spread
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(100.0) as u64)
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn circuit_state_name(&self) -> &'static str {
        match &*self.circuit_state.read() {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    async fn call_with_retry<T, F, Fut>(&self, mut attempt_fn: F) -> Result<T, AgentError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        self.check_circuit()?;

        let mut last_error: Option<AgentError> = None;

        for attempt in 0..=self.config.max_retries {
            match attempt_fn().await {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(e) => {
                    let budget_spent = attempt == self.config.max_retries;
                    if e.is_fatal() || !e.is_retryable() || budget_spent {
                        self.record_failure();
                        return Err(e);
                    }

                    let delay = self.retry_delay(attempt, e.suggested_delay());
                    self.total_retries.fetch_add(1, Ordering::Relaxed);

                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying agent call after error"
                    );

                    last_error = Some(e);
                    tokio::time::sleep(delay).await;

                    // Re-check circuit after sleep
                    self.check_circuit()?;
                }
            }
        }

        Err(last_error.unwrap_or(AgentError::NetworkError("max retries exceeded".into())))
    }
}

/// Cheap non-cryptographic jitter; RandomState seeds differently per
/// instance, which is all spread needs.
fn jitter_source() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(0x6a69_7474_6572);
    hasher.finish()
}

#[async_trait]
impl<A: SummarizationAgent> SummarizationAgent for ReliableAgent<A> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn summarize(
        &self,
        previous_summary: Option<&str>,
        turns: &[String],
    ) -> Result<String, AgentError> {
        self.call_with_retry(|| self.inner.summarize(previous_summary, turns))
            .await
    }
}

#[async_trait]
impl<A: ResponseAgent> ResponseAgent for ReliableAgent<A> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn respond(&self, window: &[WindowEntry]) -> Result<String, AgentError> {
        self.call_with_retry(|| self.inner.respond(window)).await
    }
}
