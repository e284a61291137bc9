//! The admission controller: single entry point for admitting, queueing,
//! releasing and tracking provider requests.
//!
//! Every provider's limits, queue, bucket, breaker and active set sit behind
//! that provider's own mutex, so admission decisions for different providers
//! never contend. The mutex is never held across an await point.

use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::circuit_breaker::{BreakerConfig, BreakerError, CircuitBreaker, CircuitState};
use super::queue::AdmissionQueue;
use super::registry::{StreamHandle, StreamRegistry};
use super::token_bucket::{TokenBucket, DEFAULT_REFILL_INTERVAL};
use super::AdmissionError;
use crate::provider::{InvalidLimits, PartialLimits, Provider, ProviderLimits, ProviderTable};

/// Interval between background sweeps.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Streams older than this are reclaimed by the sweep.
const DEFAULT_MAX_STREAM_LIFETIME: Duration = Duration::from_secs(300);

/// Controller-wide tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    pub breaker: BreakerConfig,
    pub refill_interval: Duration,
    pub sweep_interval: Duration,
    pub max_stream_lifetime: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            refill_interval: DEFAULT_REFILL_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_stream_lifetime: DEFAULT_MAX_STREAM_LIFETIME,
        }
    }
}

/// Read-only snapshot of one provider's admission state.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub provider: Provider,
    pub active_requests: usize,
    pub queued_requests: usize,
    pub active_streams: usize,
    pub circuit_state: CircuitState,
    pub circuit_failures: u32,
    pub available_tokens: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_wait_ms: Option<u64>,
    pub limits: ProviderLimits,
}

/// What a sweep reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_streams: usize,
    pub expired_waiters: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired_streams == 0 && self.expired_waiters == 0
    }
}

struct ProviderState {
    limits: ProviderLimits,
    queue: AdmissionQueue,
    active: HashSet<String>,
    bucket: TokenBucket,
    breaker: Arc<CircuitBreaker>,
}

impl ProviderState {
    fn new(provider: Provider, limits: ProviderLimits, config: &ControllerConfig) -> Self {
        Self {
            limits,
            queue: AdmissionQueue::new(),
            active: HashSet::new(),
            bucket: TokenBucket::for_rate_limit(&limits.rate_limit, config.refill_interval),
            breaker: Arc::new(CircuitBreaker::new(provider, config.breaker)),
        }
    }

    /// Hand free slots to waiters, highest priority first.
    ///
    /// Waiters whose caller has gone away are skipped so the slot passes on.
    fn admit_waiters(&mut self, provider: Provider) {
        while self.active.len() < self.limits.max_concurrent_requests {
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            let request_id = waiter.request_id.clone();
            let waited = Instant::now().duration_since(waiter.enqueued_at);
            self.active.insert(request_id.clone());
            if waiter.resolve(Ok(())) {
                tracing::debug!(
                    provider = %provider,
                    request_id = %request_id,
                    waited_ms = waited.as_millis() as u64,
                    "admitted from queue",
                );
            } else {
                self.active.remove(&request_id);
                tracing::debug!(
                    provider = %provider,
                    request_id = %request_id,
                    "skipping abandoned waiter",
                );
            }
        }
    }

    /// Reject waiters beyond `max_queue_size`, lowest priority and newest first.
    fn trim_queue(&mut self, provider: Provider) {
        while self.queue.len() > self.limits.max_queue_size {
            let Some(waiter) = self.queue.pop_back() else {
                break;
            };
            tracing::warn!(
                provider = %provider,
                request_id = %waiter.request_id,
                "queue shrunk, rejecting waiter",
            );
            waiter.resolve(Err(AdmissionError::QueueFull {
                provider,
                max_queue_size: self.limits.max_queue_size,
            }));
        }
    }
}

/// Admission controller shared by every request handler.
///
/// Construct one per process (or per test) and share it behind an `Arc`.
pub struct AdmissionController {
    config: ControllerConfig,
    providers: ProviderTable<Mutex<ProviderState>>,
    streams: StreamRegistry,
    shutdown: CancellationToken,
}

impl AdmissionController {
    /// A controller using each provider's built-in limits.
    pub fn new(config: ControllerConfig) -> Self {
        Self::with_limits(config, std::iter::empty())
    }

    /// A controller with `overrides` replacing the built-in limits of the
    /// providers they name.
    pub fn with_limits(
        config: ControllerConfig,
        overrides: impl IntoIterator<Item = (Provider, ProviderLimits)>,
    ) -> Self {
        let mut limits = ProviderTable::from_fn(|p| p.default_limits());
        for (provider, l) in overrides {
            limits[provider] = l;
        }
        Self {
            providers: ProviderTable::from_fn(|p| {
                Mutex::new(ProviderState::new(p, limits[p], &config))
            }),
            config,
            streams: StreamRegistry::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    fn state(&self, provider: Provider) -> MutexGuard<'_, ProviderState> {
        self.providers[provider]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask for permission to call `provider`.
    ///
    /// Resolves immediately when the provider has capacity, otherwise waits
    /// in the provider's queue until a `release` frees a slot or the
    /// provider's `request_timeout` elapses. Open circuits, exhausted rate
    /// limits and full queues fail without waiting. Never retries.
    pub async fn enqueue(
        &self,
        provider: Provider,
        request_id: &str,
        priority: i32,
    ) -> Result<(), AdmissionError> {
        if self.shutdown.is_cancelled() {
            return Err(AdmissionError::Shutdown { provider });
        }

        let (rx, deadline) = {
            let mut state = self.state(provider);

            if state.active.contains(request_id) || state.queue.contains(request_id) {
                return Err(AdmissionError::DuplicateRequest {
                    provider,
                    request_id: request_id.to_string(),
                });
            }

            if let Err(err) = state.breaker.check() {
                tracing::warn!(provider = %provider, request_id = %request_id, "rejected: circuit open");
                return Err(err.into());
            }

            if !state.bucket.try_consume(1.0) {
                tracing::warn!(provider = %provider, request_id = %request_id, "rejected: rate limit exceeded");
                return Err(AdmissionError::RateLimitExceeded { provider });
            }

            if state.active.len() < state.limits.max_concurrent_requests {
                state.active.insert(request_id.to_string());
                tracing::debug!(
                    provider = %provider,
                    request_id = %request_id,
                    active = state.active.len(),
                    "admitted immediately",
                );
                return Ok(());
            }

            if state.queue.len() >= state.limits.max_queue_size {
                tracing::warn!(
                    provider = %provider,
                    request_id = %request_id,
                    queued = state.queue.len(),
                    "rejected: queue full",
                );
                return Err(AdmissionError::QueueFull {
                    provider,
                    max_queue_size: state.limits.max_queue_size,
                });
            }

            let timeout = state.limits.request_timeout;
            let deadline = Instant::now() + timeout;
            let rx = state.queue.push(request_id.to_string(), priority, timeout);
            tracing::debug!(
                provider = %provider,
                request_id = %request_id,
                priority,
                queued = state.queue.len(),
                "queued for admission",
            );
            (rx, deadline)
        };

        let mut pending = PendingAdmission {
            controller: self,
            provider,
            request_id,
            rx,
            settled: false,
        };
        pending.wait(deadline).await
    }

    /// Give back the slot held by `request_id` and admit the next waiter.
    ///
    /// Unknown ids are ignored so duplicate cleanup paths are harmless.
    pub fn release(&self, provider: Provider, request_id: &str) {
        let mut state = self.state(provider);
        if !state.active.remove(request_id) {
            tracing::trace!(provider = %provider, request_id = %request_id, "release of inactive request ignored");
            return;
        }
        tracing::debug!(provider = %provider, request_id = %request_id, "released");
        state.admit_waiters(provider);
    }

    /// Admit `request_id` and return a permit that releases on drop.
    pub async fn admit(
        self: &Arc<Self>,
        provider: Provider,
        request_id: &str,
        priority: i32,
    ) -> Result<AdmissionPermit, AdmissionError> {
        self.enqueue(provider, request_id, priority).await?;
        Ok(AdmissionPermit {
            controller: Arc::clone(self),
            provider,
            request_id: request_id.to_string(),
            released: false,
        })
    }

    /// Register a streamed response for an admitted request.
    pub fn create_stream(&self, provider: Provider, request_id: &str) -> StreamHandle {
        let handle = self.streams.create(provider, request_id);
        tracing::debug!(
            provider = %provider,
            request_id = %request_id,
            stream_id = %handle.stream_id,
            "stream created",
        );
        handle
    }

    /// Cancel and forget a stream. Idempotent; returns whether it was present.
    pub fn remove_stream(&self, stream_id: &str) -> bool {
        match self.streams.remove(stream_id) {
            Some(stream) => {
                tracing::debug!(
                    provider = %stream.provider,
                    stream_id = %stream_id,
                    "stream removed",
                );
                true
            }
            None => false,
        }
    }

    /// Read-only snapshot of `provider`'s admission state.
    pub fn status(&self, provider: Provider) -> ProviderStatus {
        let now = Instant::now();
        let (active, queued, oldest_wait, tokens, limits, breaker) = {
            let state = self.state(provider);
            (
                state.active.len(),
                state.queue.len(),
                state.queue.oldest_wait(now),
                state.bucket.peek_tokens(),
                state.limits,
                Arc::clone(&state.breaker),
            )
        };
        let circuit = breaker.snapshot();
        ProviderStatus {
            provider,
            active_requests: active,
            queued_requests: queued,
            active_streams: self.streams.count_for(provider),
            circuit_state: circuit.state,
            circuit_failures: circuit.failure_count,
            available_tokens: tokens,
            oldest_wait_ms: oldest_wait.map(|d| d.as_millis() as u64),
            limits,
        }
    }

    pub fn status_all(&self) -> Vec<ProviderStatus> {
        Provider::ALL.into_iter().map(|p| self.status(p)).collect()
    }

    /// The breaker currently guarding `provider`.
    pub fn breaker(&self, provider: Provider) -> Arc<CircuitBreaker> {
        Arc::clone(&self.state(provider).breaker)
    }

    /// Run an outbound call for `provider` through its circuit breaker.
    pub async fn execute<T, E, F, Fut>(
        &self,
        provider: Provider,
        operation: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let breaker = self.breaker(provider);
        breaker.execute(operation).await
    }

    /// Replace `provider`'s breaker with a fresh closed one.
    pub fn reset_circuit_breaker(&self, provider: Provider) {
        let mut state = self.state(provider);
        state.breaker = Arc::new(CircuitBreaker::new(provider, self.config.breaker));
        tracing::info!(provider = %provider, "circuit breaker reset by operator");
    }

    /// Merge `partial` into `provider`'s limits.
    ///
    /// A changed rate limit replaces the token bucket with a full one sized
    /// for the new limit; tokens are not carried over. Raising concurrency
    /// admits waiters immediately, and shrinking the queue rejects overflow.
    pub fn update_limits(
        &self,
        provider: Provider,
        partial: &PartialLimits,
    ) -> Result<ProviderLimits, InvalidLimits> {
        let mut state = self.state(provider);
        let merged = state.limits.merged(partial);
        merged.validate()?;

        if merged.rate_limit != state.limits.rate_limit {
            state.bucket = TokenBucket::for_rate_limit(&merged.rate_limit, self.config.refill_interval);
            tracing::info!(
                provider = %provider,
                requests = merged.rate_limit.requests,
                window_ms = merged.rate_limit.window.as_millis() as u64,
                "rate limit changed, token bucket reset to full capacity",
            );
        }

        state.limits = merged;
        state.admit_waiters(provider);
        state.trim_queue(provider);

        tracing::info!(provider = %provider, limits = ?merged, "limits updated");
        Ok(merged)
    }

    /// Reclaim streams past their maximum lifetime and waiters past their
    /// queue timeout. Normally driven by [`spawn_sweeper`](Self::spawn_sweeper).
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();

        for stream_id in self.streams.expired(now, self.config.max_stream_lifetime) {
            if let Some(stream) = self.streams.remove(&stream_id) {
                tracing::warn!(
                    provider = %stream.provider,
                    request_id = %stream.request_id,
                    stream_id = %stream_id,
                    age_secs = now.duration_since(stream.started_at).as_secs(),
                    "force-removing stream past maximum lifetime",
                );
                report.expired_streams += 1;
            }
        }

        for provider in Provider::ALL {
            let expired = {
                let mut state = self.state(provider);
                let timeout = state.limits.request_timeout;
                state.queue.take_expired(now, timeout)
            };
            for waiter in expired {
                let waited = now.duration_since(waiter.enqueued_at);
                tracing::warn!(
                    provider = %provider,
                    request_id = %waiter.request_id,
                    waited_ms = waited.as_millis() as u64,
                    "sweep rejecting expired waiter",
                );
                let request_id = waiter.request_id.clone();
                waiter.resolve(Err(AdmissionError::QueueTimeout {
                    provider,
                    request_id,
                    waited,
                }));
                report.expired_waiters += 1;
            }
        }

        report
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until shutdown or
    /// until the controller is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(controller) = controller.upgrade() else {
                            break;
                        };
                        let report = controller.sweep();
                        if !report.is_empty() {
                            tracing::info!(
                                expired_streams = report.expired_streams,
                                expired_waiters = report.expired_waiters,
                                "sweep reclaimed resources",
                            );
                        }
                    }
                }
            }
            tracing::debug!("admission sweeper stopped");
        })
    }

    /// Reject every waiter, cancel every stream and stop the sweeper.
    /// Later `enqueue` calls fail with [`AdmissionError::Shutdown`].
    pub fn shutdown(&self) {
        self.shutdown.cancel();

        for provider in Provider::ALL {
            let waiters: Vec<_> = self.state(provider).queue.drain().collect();
            for waiter in waiters {
                waiter.resolve(Err(AdmissionError::Shutdown { provider }));
            }
        }
        for stream_id in self.streams.ids() {
            self.streams.remove(&stream_id);
        }
        tracing::info!("admission controller shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// A queued `enqueue` call.
///
/// If the caller stops waiting, dropping this removes the waiter from the
/// queue, or gives the slot back when admission raced with the drop.
struct PendingAdmission<'a> {
    controller: &'a AdmissionController,
    provider: Provider,
    request_id: &'a str,
    rx: oneshot::Receiver<Result<(), AdmissionError>>,
    settled: bool,
}

impl PendingAdmission<'_> {
    async fn wait(&mut self, deadline: Instant) -> Result<(), AdmissionError> {
        let provider = self.provider;
        let result = match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(verdict) => verdict.unwrap_or(Err(AdmissionError::Shutdown { provider })),
            Err(_elapsed) => {
                let removed = self.controller.state(provider).queue.remove(self.request_id);
                match removed {
                    Some(waiter) => {
                        let waited = Instant::now().duration_since(waiter.enqueued_at);
                        tracing::warn!(
                            provider = %provider,
                            request_id = %self.request_id,
                            waited_ms = waited.as_millis() as u64,
                            "queue wait timed out",
                        );
                        Err(AdmissionError::QueueTimeout {
                            provider,
                            request_id: self.request_id.to_string(),
                            waited,
                        })
                    }
                    // Already resolved under the lock by release or sweep.
                    None => (&mut self.rx)
                        .await
                        .unwrap_or(Err(AdmissionError::Shutdown { provider })),
                }
            }
        };
        self.settled = true;
        result
    }
}

impl Drop for PendingAdmission<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let removed = self
            .controller
            .state(self.provider)
            .queue
            .remove(self.request_id);
        if removed.is_none() {
            if let Ok(Ok(())) = self.rx.try_recv() {
                tracing::debug!(
                    provider = %self.provider,
                    request_id = %self.request_id,
                    "caller left after admission, releasing slot",
                );
                self.controller.release(self.provider, self.request_id);
            }
        }
    }
}

/// An admitted request. Releases its slot when dropped.
#[derive(Debug)]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
    provider: Provider,
    request_id: String,
    released: bool,
}

impl AdmissionPermit {
    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn controller(&self) -> &Arc<AdmissionController> {
        &self.controller
    }

    /// Register a stream for this request. The returned lease owns the
    /// permit and tears down both stream and slot exactly once.
    pub fn into_stream(self) -> StreamLease {
        let handle = self.controller.create_stream(self.provider, &self.request_id);
        StreamLease {
            handle,
            permit: self,
            finished: false,
        }
    }

    /// Release the slot now.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.controller.release(self.provider, &self.request_id);
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.release_once();
    }
}

/// A registered stream plus the admission slot it occupies.
///
/// [`finish`](Self::finish) or drop removes the stream (cancelling its
/// token) and then releases the slot.
#[derive(Debug)]
pub struct StreamLease {
    handle: StreamHandle,
    permit: AdmissionPermit,
    finished: bool,
}

impl StreamLease {
    pub fn stream_id(&self) -> &str {
        &self.handle.stream_id
    }

    pub fn cancel_token(&self) -> &tokio_util::sync::CancellationToken {
        &self.handle.cancel
    }

    pub fn provider(&self) -> Provider {
        self.permit.provider
    }

    pub fn request_id(&self) -> &str {
        &self.permit.request_id
    }

    pub fn finish(mut self) {
        self.finish_once();
    }

    fn finish_once(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.permit.controller.remove_stream(&self.handle.stream_id);
        self.permit.release_once();
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.finish_once();
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("config", &self.config)
            .field("active_streams", &self.streams.len())
            .finish_non_exhaustive()
    }
}
