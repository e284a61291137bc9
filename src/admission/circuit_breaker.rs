//! Per-provider circuit breaker.
//!
//! A provider that keeps failing is cut off for a while instead of being
//! hammered. The state moves Closed -> Open after `failure_threshold`
//! consecutive failures. Once `reset_timeout` has passed since the last
//! failure the next check moves it to Half-Open and lets calls through; the
//! first outcome then closes or reopens it.

use serde::{Serialize, Serializer};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::provider::Provider;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Measured from the most recent failure.
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    /// Calls are refused without running.
    Open,
    /// Calls run again; the next outcome decides.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl Serialize for CircuitState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Breaker tuning shared by every provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
        }
    }
}

/// A call was refused because the provider's circuit is open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Circuit breaker open for provider '{provider}' after {failure_count} consecutive failures")]
pub struct CircuitOpenError {
    pub provider: Provider,
    pub failure_count: u32,
    /// Until the circuit goes half-open.
    pub retry_after: Duration,
}

/// Why [`CircuitBreaker::execute`] produced no value.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// Refused; the operation never ran.
    #[error("{0}")]
    Open(CircuitOpenError),
    /// The operation's own error, already counted against the circuit.
    #[error("{0}")]
    Failed(E),
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub trip_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// The unsynchronized state machine behind [`CircuitBreaker`].
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Reset by any success.
    consecutive_failures: u32,
    times_opened: u32,
    last_failure_at: Option<Instant>,
    last_success_at: Option<Instant>,
    last_error: Option<String>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            times_opened: 0,
            last_failure_at: None,
            last_success_at: None,
            last_error: None,
        }
    }

    /// `Err(retry_after)` while open. An open circuit whose timeout has run
    /// out moves to Half-Open here.
    fn admit(&mut self, provider: Provider, reset_timeout: Duration) -> Result<(), Duration> {
        if self.state != CircuitState::Open {
            return Ok(());
        }
        let elapsed = self
            .last_failure_at
            .map_or(reset_timeout, |at| at.elapsed());
        if elapsed < reset_timeout {
            return Err(reset_timeout - elapsed);
        }
        self.state = CircuitState::HalfOpen;
        tracing::info!(provider = %provider, "circuit half-open, letting calls through");
        Ok(())
    }

    fn on_success(&mut self, provider: Provider) {
        self.last_success_at = Some(Instant::now());
        self.consecutive_failures = 0;
        let was = std::mem::replace(&mut self.state, CircuitState::Closed);
        if was != CircuitState::Closed {
            tracing::info!(provider = %provider, from = was.as_str(), "circuit closed");
        }
    }

    fn on_failure(&mut self, provider: Provider, threshold: u32, message: &str) {
        self.consecutive_failures += 1;
        self.last_failure_at = Some(Instant::now());
        self.last_error = Some(message.to_owned());

        let reopen = self.state == CircuitState::HalfOpen;
        let trip = self.state == CircuitState::Closed && self.consecutive_failures >= threshold;
        if trip {
            self.times_opened += 1;
        }
        if reopen || trip {
            self.state = CircuitState::Open;
            tracing::warn!(
                provider = %provider,
                failures = self.consecutive_failures,
                times_opened = self.times_opened,
                error = message,
                "circuit opened",
            );
        }
    }
}

/// One provider's breaker, safe to share between tasks.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: Provider,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(provider: Provider, config: BreakerConfig) -> Self {
        Self {
            provider,
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a call may proceed right now.
    pub fn check(&self) -> Result<(), CircuitOpenError> {
        let mut state = self.lock();
        state
            .admit(self.provider, self.config.reset_timeout)
            .map_err(|retry_after| CircuitOpenError {
                provider: self.provider,
                failure_count: state.consecutive_failures,
                retry_after,
            })
    }

    pub fn record_success(&self) {
        self.lock().on_success(self.provider);
    }

    pub fn record_failure(&self, message: &str) {
        self.lock()
            .on_failure(self.provider, self.config.failure_threshold, message);
    }

    /// Run `operation` unless the circuit is open, and count its outcome.
    /// The lock is released while the operation runs.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.check().map_err(BreakerError::Open)?;

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(err) => self.record_failure(&err.to_string()),
        }
        result.map_err(BreakerError::Failed)
    }

    /// Current state as stored; an expired open circuit still reads Open.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.lock();
        CircuitSnapshot {
            state: state.state,
            failure_count: state.consecutive_failures,
            trip_count: state.times_opened,
            last_error: state.last_error.clone(),
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const PROVIDER: Provider = Provider::OpenAi;

    fn tripped() -> BreakerState {
        let mut state = BreakerState::new();
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            state.on_failure(PROVIDER, DEFAULT_FAILURE_THRESHOLD, "Internal Server Error");
        }
        state
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_state_is_closed() {
        let state = BreakerState::new();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.times_opened, 0);
        assert!(state.last_failure_at.is_none());
        assert!(state.last_success_at.is_none());
        assert!(state.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stays_closed_below_threshold() {
        let mut state = BreakerState::new();
        for _ in 1..DEFAULT_FAILURE_THRESHOLD {
            state.on_failure(PROVIDER, DEFAULT_FAILURE_THRESHOLD, "Bad Gateway");
        }
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.consecutive_failures, DEFAULT_FAILURE_THRESHOLD - 1);
        assert_eq!(state.times_opened, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold() {
        let state = tripped();
        assert_eq!(state.state, CircuitState::Open);
        assert_eq!(state.consecutive_failures, DEFAULT_FAILURE_THRESHOLD);
        assert_eq!(state.times_opened, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_clears_the_streak() {
        let mut state = BreakerState::new();
        state.on_failure(PROVIDER, DEFAULT_FAILURE_THRESHOLD, "Error 1");
        state.on_failure(PROVIDER, DEFAULT_FAILURE_THRESHOLD, "Error 2");
        assert_eq!(state.consecutive_failures, 2);

        state.on_success(PROVIDER);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.state, CircuitState::Closed);
        assert!(state.last_success_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn open_refuses_until_timeout() {
        let mut state = tripped();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(
            state.admit(PROVIDER, DEFAULT_RESET_TIMEOUT),
            Err(Duration::from_secs(1))
        );
        assert_eq!(state.state, CircuitState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(state.admit(PROVIDER, DEFAULT_RESET_TIMEOUT), Ok(()));
        assert_eq!(state.state, CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_success_closes() {
        let mut state = tripped();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(state.admit(PROVIDER, DEFAULT_RESET_TIMEOUT).is_ok());

        state.on_success(PROVIDER);
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.times_opened, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_with_fresh_timer() {
        let mut state = tripped();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(state.admit(PROVIDER, DEFAULT_RESET_TIMEOUT).is_ok());
        assert_eq!(state.state, CircuitState::HalfOpen);

        state.on_failure(PROVIDER, DEFAULT_FAILURE_THRESHOLD, "Still down");
        assert_eq!(state.state, CircuitState::Open);
        assert_eq!(state.consecutive_failures, DEFAULT_FAILURE_THRESHOLD + 1);
        // A reopen is not a new trip.
        assert_eq!(state.times_opened, 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(state.admit(PROVIDER, DEFAULT_RESET_TIMEOUT).is_err());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(state.admit(PROVIDER, DEFAULT_RESET_TIMEOUT).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_latest_error() {
        let mut state = BreakerState::new();
        state.on_failure(PROVIDER, DEFAULT_FAILURE_THRESHOLD, "First error");
        state.on_failure(PROVIDER, DEFAULT_FAILURE_THRESHOLD, "Second error");
        assert_eq!(state.last_error.as_deref(), Some("Second error"));
    }

    async fn failing() -> Result<(), String> {
        Err("upstream 500".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_fails_fast_without_invoking_operation() {
        let breaker = CircuitBreaker::new(PROVIDER, BreakerConfig::default());
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            let _ = breaker.execute(failing).await;
        }
        assert_eq!(breaker.snapshot().state, CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;

        match result {
            Err(BreakerError::Open(err)) => {
                assert_eq!(err.provider, PROVIDER);
                assert_eq!(err.failure_count, DEFAULT_FAILURE_THRESHOLD);
            }
            other => panic!("expected open circuit, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_recovers_after_reset_timeout() {
        let config = BreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(10),
        };
        let breaker = CircuitBreaker::new(PROVIDER, config);
        let _ = breaker.execute(failing).await;
        let _ = breaker.execute(failing).await;
        assert!(breaker.check().is_err());

        tokio::time::advance(Duration::from_secs(10)).await;
        let value = breaker.execute(|| async { Ok::<_, String>(7) }).await;
        assert!(matches!(value, Ok(7)));

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_passes_operation_error_through() {
        let breaker = CircuitBreaker::new(PROVIDER, BreakerConfig::default());
        match breaker.execute(failing).await {
            Err(BreakerError::Failed(msg)) => assert_eq!(msg, "upstream 500"),
            other => panic!("expected failure, got {other:?}"),
        }
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.last_error.as_deref(), Some("upstream 500"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_does_not_transition() {
        let breaker = CircuitBreaker::new(
            PROVIDER,
            BreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(1),
            },
        );
        breaker.record_failure("boom");
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.snapshot().state, CircuitState::Open);
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.snapshot().state, CircuitState::HalfOpen);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&CircuitState::HalfOpen).unwrap(),
            "\"half_open\""
        );
    }
}
