//! Retry and circuit breaking around research tools.
//!
//! `ResilientTools` wraps any [`ResearchTools`] backend:
//! - retries network, rate-limit and unknown failures with capped exponential
//!   backoff plus jitter
//! - propagates validation failures immediately
//! - keeps one circuit breaker per operation name and short-circuits calls
//!   while it is open

use super::{
    ComparablesRequest, ExtractRequest, Extraction, Finding, IdentifierRequest,
    LoadSubjectRequest, MarketplaceRequest, ResearchTools, SubjectContext, ToolError, ToolResult,
    WebSearchRequest, ops,
};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Exponential backoff with optional jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 8_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based: the wait after the first failure is attempt 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let capped = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        let millis = if self.jitter && capped > 0 {
            // Jitter within the upper half of the capped delay.
            rand::thread_rng().gen_range(capped / 2..=capped)
        } else {
            capped
        };
        Duration::from_millis(millis)
    }
}

// ---------------------------------------------------------------------------
// Circuit Breaker
// ---------------------------------------------------------------------------

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    /// Calls are permitted.
    Closed,
    /// Too many consecutive failures; calls are blocked.
    Open { since: Instant },
    /// One trial call is permitted.
    HalfOpen,
}

/// Trips after consecutive failures and recovers after a timeout.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: usize,
    failure_threshold: usize,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, recovery_timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            failure_threshold,
            recovery_timeout,
        }
    }

    pub fn is_call_permitted(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open { since } => {
                if since.elapsed() >= self.recovery_timeout {
                    debug!("Circuit breaker transitioning to half-open");
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        if self.state == CircuitState::HalfOpen || self.failure_count >= self.failure_threshold {
            warn!(
                failures = self.failure_count,
                threshold = self.failure_threshold,
                "Circuit breaker opening"
            );
            self.state = CircuitState::Open {
                since: Instant::now(),
            };
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }
}

// ---------------------------------------------------------------------------
// ResilientTools
// ---------------------------------------------------------------------------

/// Circuit breaker settings shared by every operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// `0` disables circuit breaking.
    pub failure_threshold: usize,
    pub recovery_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
        }
    }
}

/// A [`ResearchTools`] backend with retry and per-operation circuit breakers.
pub struct ResilientTools<T> {
    inner: T,
    policy: RetryPolicy,
    breaker: BreakerSettings,
    breakers: Mutex<HashMap<&'static str, CircuitBreaker>>,
}

impl<T: ResearchTools> ResilientTools<T> {
    pub fn new(inner: T, policy: RetryPolicy, breaker: BreakerSettings) -> Self {
        Self {
            inner,
            policy,
            breaker,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Current breaker state for an operation; `Closed` if it was never called.
    pub fn circuit_state(&self, operation: &str) -> CircuitState {
        self.breakers
            .lock()
            .ok()
            .and_then(|map| map.get(operation).map(CircuitBreaker::state))
            .unwrap_or(CircuitState::Closed)
    }

    fn permit(&self, operation: &'static str) -> bool {
        if self.breaker.failure_threshold == 0 {
            return true;
        }
        let Ok(mut map) = self.breakers.lock() else {
            return true;
        };
        map.entry(operation)
            .or_insert_with(|| {
                CircuitBreaker::new(
                    self.breaker.failure_threshold,
                    Duration::from_millis(self.breaker.recovery_timeout_ms),
                )
            })
            .is_call_permitted()
    }

    fn record(&self, operation: &'static str, success: bool) {
        if self.breaker.failure_threshold == 0 {
            return;
        }
        if let Ok(mut map) = self.breakers.lock() {
            if let Some(breaker) = map.get_mut(operation) {
                if success {
                    breaker.record_success();
                } else {
                    breaker.record_failure();
                }
            }
        }
    }

    async fn call<R, F, Fut>(&self, operation: &'static str, mut f: F) -> ToolResult<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ToolResult<R>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            if !self.permit(operation) {
                return Err(ToolError::CircuitOpen {
                    operation: operation.to_string(),
                });
            }
            match f().await {
                Ok(output) => {
                    self.record(operation, true);
                    return Ok(output);
                }
                Err(e) if !e.is_retryable() => {
                    debug!(operation, error = %e, "Non-retryable tool failure");
                    return Err(e);
                }
                Err(e) => {
                    self.record(operation, false);
                    if attempt >= max_attempts {
                        warn!(operation, attempts = attempt, error = %e, "Tool retries exhausted");
                        return Err(if max_attempts == 1 {
                            e
                        } else {
                            ToolError::Exhausted {
                                operation: operation.to_string(),
                                attempts: attempt,
                                message: e.to_string(),
                            }
                        });
                    }
                    let wait = self.policy.delay_for(attempt);
                    info!(
                        operation,
                        attempt,
                        max_attempts,
                        backoff_ms = wait.as_millis() as u64,
                        error = %e,
                        "Retrying after transient tool failure"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl<T: ResearchTools> ResearchTools for ResilientTools<T> {
    async fn load_subject(&self, request: &LoadSubjectRequest) -> ToolResult<SubjectContext> {
        self.call(ops::LOAD_SUBJECT, || self.inner.load_subject(request))
            .await
    }

    async fn extract_attributes(&self, request: &ExtractRequest) -> ToolResult<Extraction> {
        self.call(ops::EXTRACT_ATTRIBUTES, || {
            self.inner.extract_attributes(request)
        })
        .await
    }

    async fn lookup_identifier(&self, request: &IdentifierRequest) -> ToolResult<Vec<Finding>> {
        self.call(ops::LOOKUP_IDENTIFIER, || self.inner.lookup_identifier(request))
            .await
    }

    async fn search_marketplace(
        &self,
        request: &MarketplaceRequest,
    ) -> ToolResult<Vec<Finding>> {
        self.call(ops::SEARCH_MARKETPLACE, || {
            self.inner.search_marketplace(request)
        })
        .await
    }

    async fn fetch_comparables(&self, request: &ComparablesRequest) -> ToolResult<Vec<Finding>> {
        self.call(ops::FETCH_COMPARABLES, || self.inner.fetch_comparables(request))
            .await
    }

    async fn web_search(&self, request: &WebSearchRequest) -> ToolResult<Vec<Finding>> {
        self.call(ops::WEB_SEARCH, || self.inner.web_search(request))
            .await
    }
}
