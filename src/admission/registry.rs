//! Registry of in-flight streamed responses.
//!
//! Each entry owns a [`CancellationToken`] shared with whoever consumes the
//! provider's chunk source, so either side can trigger teardown.

use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::provider::Provider;

/// One in-flight streamed response.
#[derive(Debug, Clone)]
pub struct ActiveStream {
    pub stream_id: String,
    pub provider: Provider,
    /// The admitted request this stream belongs to.
    pub request_id: String,
    pub started_at: Instant,
    pub cancel: CancellationToken,
}

/// Handle returned when a stream is registered.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub stream_id: String,
    pub cancel: CancellationToken,
}

/// Serializable view of an active stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub stream_id: String,
    pub provider: Provider,
    pub request_id: String,
    pub age_ms: u64,
}

#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: DashMap<String, ActiveStream>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream under a freshly generated id.
    pub fn create(&self, provider: Provider, request_id: &str) -> StreamHandle {
        let stream_id = format!("stream-{}", uuid::Uuid::new_v4());
        let cancel = CancellationToken::new();
        self.streams.insert(
            stream_id.clone(),
            ActiveStream {
                stream_id: stream_id.clone(),
                provider,
                request_id: request_id.to_string(),
                started_at: Instant::now(),
                cancel: cancel.clone(),
            },
        );
        StreamHandle { stream_id, cancel }
    }

    /// Cancel and forget a stream. Returns the entry if it was still present.
    ///
    /// Does not wait for the consumer to observe the cancellation.
    pub fn remove(&self, stream_id: &str) -> Option<ActiveStream> {
        let (_, stream) = self.streams.remove(stream_id)?;
        stream.cancel.cancel();
        Some(stream)
    }

    pub fn get(&self, stream_id: &str) -> Option<ActiveStream> {
        self.streams.get(stream_id).map(|entry| entry.value().clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn count_for(&self, provider: Provider) -> usize {
        self.streams
            .iter()
            .filter(|entry| entry.value().provider == provider)
            .count()
    }

    /// Ids of streams older than `max_age` at `now`.
    pub fn expired(&self, now: Instant, max_age: Duration) -> Vec<String> {
        // Collect first: removing while iterating would deadlock on the shard lock.
        self.streams
            .iter()
            .filter(|entry| now.duration_since(entry.value().started_at) > max_age)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Ids of every registered stream.
    pub fn ids(&self) -> Vec<String> {
        self.streams.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn list(&self, now: Instant) -> Vec<StreamInfo> {
        self.streams
            .iter()
            .map(|entry| {
                let s = entry.value();
                StreamInfo {
                    stream_id: s.stream_id.clone(),
                    provider: s.provider,
                    request_id: s.request_id.clone(),
                    age_ms: now.duration_since(s.started_at).as_millis() as u64,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_create_generates_unique_ids() {
        let registry = StreamRegistry::new();
        let a = registry.create(Provider::OpenAi, "req-1");
        let b = registry.create(Provider::OpenAi, "req-1");
        assert_ne!(a.stream_id, b.stream_id);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(&a.stream_id).unwrap().request_id, "req-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_cancels_and_is_idempotent() {
        let registry = StreamRegistry::new();
        let handle = registry.create(Provider::Anthropic, "req-1");
        assert!(!handle.cancel.is_cancelled());

        assert!(registry.remove(&handle.stream_id).is_some());
        assert!(handle.cancel.is_cancelled());
        assert!(registry.remove(&handle.stream_id).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_uses_age() {
        let registry = StreamRegistry::new();
        let old = registry.create(Provider::Gemini, "old");
        tokio::time::advance(Duration::from_secs(200)).await;
        let _fresh = registry.create(Provider::Gemini, "fresh");
        tokio::time::advance(Duration::from_secs(101)).await;

        let expired = registry.expired(Instant::now(), Duration::from_secs(300));
        assert_eq!(expired, vec![old.stream_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_for_provider() {
        let registry = StreamRegistry::new();
        registry.create(Provider::Xai, "a");
        registry.create(Provider::Xai, "b");
        registry.create(Provider::DeepSeek, "c");
        assert_eq!(registry.count_for(Provider::Xai), 2);
        assert_eq!(registry.count_for(Provider::DeepSeek), 1);
        assert_eq!(registry.count_for(Provider::Tavily), 0);
    }
}
