//! Retry, circuit-breaker and rate-limit decorators over a [`BackendClient`],
//! composed by [`ResilientSenderBuilder`].
//!
//! Mirrors the teacher's `RetryingExporter`/`CircuitBreakerExporter`/
//! `RateLimitedExporter` stack: small wrappers that all implement the same
//! trait as the thing they wrap, so they nest freely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::backend_client::BackendClient;
use crate::entities::EntityBatch;
use crate::errors::SendError;
use crate::rate_limiter::{BoxedRateLimiter, RateLimiter, RateLimiterBoxed};

/// Exponential backoff with a cap, used both for in-process retries here and
/// as the basis for the spool's re-attempt backoff in the sender pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }
}

/// Retries transient (`SendError::Retryable`/network) failures with capped
/// exponential backoff. Non-retryable outcomes (`PayloadTooLarge`,
/// `Rejected`) pass straight through — pushback-splitting and drop-on-4xx are
/// the sender-task pool's job, not this decorator's.
pub struct RetryingSender<C> {
    inner: C,
    config: RetryConfig,
    total_retries: AtomicU64,
    recovered: AtomicU64,
}

impl<C: BackendClient> RetryingSender<C> {
    pub fn new(inner: C, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
        }
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }
}

impl<C: BackendClient> BackendClient for RetryingSender<C> {
    async fn submit(&self, handle: &str, batch: &EntityBatch) -> Result<(), SendError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.submit(handle, batch).await {
                Ok(()) => {
                    if attempt > 0 {
                        self.recovered.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(());
                }
                Err(SendError::Retryable { .. } | SendError::Network(_)) if attempt < self.config.max_retries => {
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(self.config.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

struct CircuitBreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// Trips open after `failure_threshold` consecutive failures, short-circuits
/// submissions while open, and probes with a single half-open attempt after
/// `reset_timeout`.
pub struct CircuitBreakerSender<C> {
    inner: C,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
}

impl<C: BackendClient> CircuitBreakerSender<C> {
    pub fn new(inner: C, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            config,
            state: Mutex::new(CircuitBreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().unwrap().state
    }

    fn should_allow_request(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if state.opened_at.is_some_and(|at| at.elapsed() >= self.config.reset_timeout) {
                    state.state = CircuitState::HalfOpen;
                    state.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures = 0;
        match state.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.opened_at = None;
                }
            }
            CircuitState::Open => debug_assert!(false, "should_allow_request gates Open from reaching here"),
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.consecutive_successes = 0;
            }
            CircuitState::Open => debug_assert!(false, "should_allow_request gates Open from reaching here"),
        }
    }
}

impl<C: BackendClient> BackendClient for CircuitBreakerSender<C> {
    async fn submit(&self, handle: &str, batch: &EntityBatch) -> Result<(), SendError> {
        if !self.should_allow_request() {
            return Err(SendError::Retryable { status: 503 });
        }
        match self.inner.submit(handle, batch).await {
            Ok(()) => {
                self.record_success();
                Ok(())
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }
}

/// Throttles submissions through a [`RateLimiter`] before delegating.
pub struct RateLimitedSender<C, R> {
    inner: C,
    limiter: AsyncMutex<R>,
}

impl<C: BackendClient, R: RateLimiter> RateLimitedSender<C, R> {
    pub fn new(inner: C, limiter: R) -> Self {
        Self {
            inner,
            limiter: AsyncMutex::new(limiter),
        }
    }
}

impl<C: BackendClient, R: RateLimiter> BackendClient for RateLimitedSender<C, R> {
    async fn submit(&self, handle: &str, batch: &EntityBatch) -> Result<(), SendError> {
        self.limiter.lock().await.wait().await;
        self.inner.submit(handle, batch).await
    }
}

/// Composes retry, circuit-breaker and rate-limit decorators around a base
/// [`BackendClient`] in a fixed order: circuit breaker (outermost) wraps
/// retry (innermost wraps the base client), matching the teacher's
/// `ResilientExporterBuilder` composition order.
pub struct ResilientSenderBuilder<C> {
    inner: C,
    retry: Option<RetryConfig>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    rate_limiter: Option<Box<dyn RateLimiterBoxed>>,
}

impl<C: BackendClient> ResilientSenderBuilder<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            retry: None,
            circuit_breaker: None,
            rate_limiter: None,
        }
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: impl RateLimiter + 'static) -> Self {
        self.rate_limiter = Some(Box::new(limiter));
        self
    }

    pub fn build_retry_only(self) -> RetryingSender<C> {
        RetryingSender::new(self.inner, self.retry.unwrap_or_default())
    }

    pub fn build_circuit_breaker_only(self) -> CircuitBreakerSender<C> {
        CircuitBreakerSender::new(self.inner, self.circuit_breaker.unwrap_or_default())
    }

    pub fn build_with_retry_and_circuit_breaker(self) -> CircuitBreakerSender<RetryingSender<C>> {
        let retrying = RetryingSender::new(self.inner, self.retry.unwrap_or_default());
        CircuitBreakerSender::new(retrying, self.circuit_breaker.unwrap_or_default())
    }

    /// Composes every decorator the builder was given, in a fixed order:
    /// rate limiter (outermost, throttles before anything downstream sees a
    /// request) wraps circuit breaker wraps retry wraps the base client.
    /// Decorators that were never configured fall back to their defaults
    /// rather than being skipped, so `build_full` always returns the same
    /// wrapper shape regardless of which `with_*` calls were made.
    pub fn build_full(self) -> RateLimitedSender<CircuitBreakerSender<RetryingSender<C>>, BoxedRateLimiter> {
        let retrying = RetryingSender::new(self.inner, self.retry.unwrap_or_default());
        let breaker = CircuitBreakerSender::new(retrying, self.circuit_breaker.unwrap_or_default());
        let limiter = self
            .rate_limiter
            .unwrap_or_else(|| Box::new(crate::rate_limiter::YieldingRateLimiter));
        RateLimitedSender::new(breaker, BoxedRateLimiter(limiter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_client::{CannedResponse, RecordingBackendClient};
    use crate::entities::EntityBatch;

    fn empty_batch() -> EntityBatch {
        EntityBatch::Points(Vec::new())
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let client = RecordingBackendClient::new(vec![
            CannedResponse::Retryable(503),
            CannedResponse::Retryable(503),
            CannedResponse::Ok,
        ]);
        let sender = ResilientSenderBuilder::new(client)
            .with_retry(RetryConfig {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..Default::default()
            })
            .build_retry_only();

        sender.submit("h1", &empty_batch()).await.unwrap();
        assert_eq!(sender.total_retries(), 2);
    }

    #[tokio::test]
    async fn retry_exhausted_propagates_error() {
        let client = RecordingBackendClient::new(vec![
            CannedResponse::Retryable(503),
            CannedResponse::Retryable(503),
        ]);
        let sender = ResilientSenderBuilder::new(client)
            .with_retry(RetryConfig {
                max_retries: 1,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..Default::default()
            })
            .build_retry_only();

        let result = sender.submit("h1", &empty_batch()).await;
        assert!(matches!(result, Err(SendError::Retryable { status: 503 })));
    }

    #[tokio::test]
    async fn circuit_breaker_opens_after_threshold() {
        let client = RecordingBackendClient::new(vec![
            CannedResponse::Retryable(500),
            CannedResponse::Retryable(500),
        ]);
        let sender = ResilientSenderBuilder::new(client)
            .with_circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_secs(60),
                success_threshold: 1,
            })
            .build_circuit_breaker_only();

        let _ = sender.submit("h1", &empty_batch()).await;
        let _ = sender.submit("h1", &empty_batch()).await;
        assert_eq!(sender.state(), CircuitState::Open);

        let result = sender.submit("h1", &empty_batch()).await;
        assert!(matches!(result, Err(SendError::Retryable { status: 503 })));
    }

    #[tokio::test]
    async fn pushback_and_rejection_are_not_retried() {
        let client = RecordingBackendClient::new(vec![CannedResponse::TooLarge]);
        let sender = ResilientSenderBuilder::new(client)
            .with_retry(RetryConfig::default())
            .build_retry_only();

        let result = sender.submit("h1", &empty_batch()).await;
        assert!(matches!(result, Err(SendError::PayloadTooLarge)));
        assert_eq!(sender.total_retries(), 0);
    }

    #[tokio::test]
    async fn build_full_composes_rate_limiter_circuit_breaker_and_retry() {
        use crate::rate_limiter::TunableRateLimiter;

        let client = RecordingBackendClient::new(vec![CannedResponse::Retryable(503), CannedResponse::Ok]);
        let limiter = TunableRateLimiter::new(0.0, 1.0);
        let sender = ResilientSenderBuilder::new(client)
            .with_retry(RetryConfig {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..Default::default()
            })
            .with_circuit_breaker(CircuitBreakerConfig::default())
            .with_rate_limiter(limiter)
            .build_full();

        sender.submit("h1", &empty_batch()).await.unwrap();
    }
}
