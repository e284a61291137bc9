//! llmgate - per-provider admission control and streaming relay for LLM APIs
//!
//! This library provides the core of the llmgate gateway: admission
//! (concurrency, rate limits, circuit breakers, queueing), stream lifecycle
//! tracking, the SSE relay, and the HTTP surface around them.

pub mod admission;
pub mod config;
pub mod error;
pub mod provider;
pub mod proxy;
pub mod storage;

pub use admission::{AdmissionController, AdmissionError};
pub use config::Config;
pub use error::{Error, Result};
pub use provider::{Provider, ProviderLimits};
