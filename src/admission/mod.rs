//! Per-provider admission control.
//!
//! This module handles deciding whether a request may call a provider:
//! - Circuit breaker state (fail fast while a provider is down)
//! - Token-bucket rate limit (fail fast, never queued)
//! - Concurrency ceiling with a bounded priority queue of waiters
//! - Lifecycle of in-flight streamed responses

mod circuit_breaker;
mod controller;
mod queue;
mod registry;
mod token_bucket;

use std::time::Duration;

pub use circuit_breaker::{
    BreakerConfig, BreakerError, CircuitBreaker, CircuitOpenError, CircuitSnapshot, CircuitState,
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_RESET_TIMEOUT,
};
pub use controller::{
    AdmissionController, AdmissionPermit, ControllerConfig, ProviderStatus, StreamLease,
    SweepReport,
};
pub use registry::{ActiveStream, StreamHandle, StreamInfo, StreamRegistry};
pub use token_bucket::{TokenBucket, DEFAULT_REFILL_INTERVAL};

use crate::provider::Provider;

/// Why a request was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("Rate limit exceeded for provider '{provider}'")]
    RateLimitExceeded { provider: Provider },

    #[error("Request queue for provider '{provider}' is full ({max_queue_size} waiting)")]
    QueueFull {
        provider: Provider,
        max_queue_size: usize,
    },

    #[error(
        "Request '{request_id}' timed out after {}ms waiting for provider '{provider}'",
        .waited.as_millis()
    )]
    QueueTimeout {
        provider: Provider,
        request_id: String,
        waited: Duration,
    },

    #[error("Request '{request_id}' is already active or queued for provider '{provider}'")]
    DuplicateRequest {
        provider: Provider,
        request_id: String,
    },

    #[error("Admission for provider '{provider}' is shutting down")]
    Shutdown { provider: Provider },
}

impl AdmissionError {
    /// The provider the rejection refers to.
    pub fn provider(&self) -> Provider {
        match self {
            AdmissionError::CircuitOpen(e) => e.provider,
            AdmissionError::RateLimitExceeded { provider }
            | AdmissionError::QueueFull { provider, .. }
            | AdmissionError::QueueTimeout { provider, .. }
            | AdmissionError::DuplicateRequest { provider, .. }
            | AdmissionError::Shutdown { provider } => *provider,
        }
    }

    /// Short machine-readable kind, used in error bodies and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionError::CircuitOpen(_) => "circuit_open",
            AdmissionError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            AdmissionError::QueueFull { .. } => "queue_full",
            AdmissionError::QueueTimeout { .. } => "queue_timeout",
            AdmissionError::DuplicateRequest { .. } => "duplicate_request",
            AdmissionError::Shutdown { .. } => "shutting_down",
        }
    }
}
