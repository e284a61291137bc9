//! Known providers and their admission limits.
//!
//! The provider set is closed, so per-provider state lives in a
//! [`ProviderTable`] indexed by [`Provider`] rather than a growable map.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;
use std::time::Duration;

/// An LLM provider the gateway knows how to admit requests for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Gemini,
    Xai,
    DeepSeek,
    OpenRouter,
    Custom,
    Tavily,
}

impl Provider {
    /// Every provider, in table order.
    pub const ALL: [Provider; 8] = [
        Provider::OpenAi,
        Provider::Anthropic,
        Provider::Gemini,
        Provider::Xai,
        Provider::DeepSeek,
        Provider::OpenRouter,
        Provider::Custom,
        Provider::Tavily,
    ];

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
            Provider::Xai => "xai",
            Provider::DeepSeek => "deepseek",
            Provider::OpenRouter => "openrouter",
            Provider::Custom => "custom",
            Provider::Tavily => "tavily",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    /// Built-in limits for this provider.
    ///
    /// `Custom` gets the most conservative values since nothing is known
    /// about the upstream quota.
    pub fn default_limits(&self) -> ProviderLimits {
        let (concurrent, queue, timeout_secs, requests) = match self {
            Provider::OpenAi => (10, 50, 60, 500),
            Provider::Anthropic => (5, 50, 60, 50),
            Provider::Gemini => (10, 50, 60, 60),
            Provider::Xai => (5, 25, 60, 60),
            Provider::DeepSeek => (5, 25, 60, 60),
            Provider::OpenRouter => (10, 50, 60, 200),
            Provider::Tavily => (5, 20, 30, 100),
            Provider::Custom => (2, 10, 30, 20),
        };
        ProviderLimits {
            max_concurrent_requests: concurrent,
            max_queue_size: queue,
            request_timeout: Duration::from_secs(timeout_secs),
            rate_limit: RateLimit {
                requests,
                window: Duration::from_secs(60),
            },
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a provider name is not one of [`Provider::ALL`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown provider '{0}'")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == lower)
            .ok_or_else(|| UnknownProvider(s.to_string()))
    }
}

/// Returned when limits would make a provider unusable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid provider limits: {0}")]
pub struct InvalidLimits(pub &'static str);

/// Requests allowed per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests: u32,
    #[serde(rename = "window_ms", with = "duration_ms")]
    pub window: Duration,
}

/// Per-provider admission limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderLimits {
    pub max_concurrent_requests: usize,
    pub max_queue_size: usize,
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
    pub rate_limit: RateLimit,
}

/// A partial update applied by `update_limits`. Absent fields are unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_requests: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queue_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

impl ProviderLimits {
    /// Merge `partial` into these limits, returning the merged value.
    pub fn merged(&self, partial: &PartialLimits) -> ProviderLimits {
        ProviderLimits {
            max_concurrent_requests: partial
                .max_concurrent_requests
                .unwrap_or(self.max_concurrent_requests),
            max_queue_size: partial.max_queue_size.unwrap_or(self.max_queue_size),
            request_timeout: partial
                .request_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.request_timeout),
            rate_limit: partial.rate_limit.unwrap_or(self.rate_limit),
        }
    }

    /// Check the limits are usable.
    pub fn validate(&self) -> Result<(), InvalidLimits> {
        if self.max_concurrent_requests == 0 {
            return Err(InvalidLimits("max_concurrent_requests must be at least 1"));
        }
        if self.rate_limit.requests == 0 {
            return Err(InvalidLimits("rate_limit.requests must be at least 1"));
        }
        if self.rate_limit.window.is_zero() {
            return Err(InvalidLimits("rate_limit.window_ms must be greater than 0"));
        }
        Ok(())
    }
}

/// Fixed-size table holding one `T` per [`Provider`].
#[derive(Debug, Clone)]
pub struct ProviderTable<T>([T; 8]);

impl<T> ProviderTable<T> {
    /// Build a table by calling `f` once per provider.
    pub fn from_fn(mut f: impl FnMut(Provider) -> T) -> Self {
        Self(std::array::from_fn(|i| f(Provider::ALL[i])))
    }

    /// Iterate `(provider, value)` pairs in table order.
    pub fn iter(&self) -> impl Iterator<Item = (Provider, &T)> {
        Provider::ALL.into_iter().zip(self.0.iter())
    }
}

impl<T> Index<Provider> for ProviderTable<T> {
    type Output = T;

    fn index(&self, provider: Provider) -> &T {
        &self.0[provider.index()]
    }
}

impl<T> IndexMut<Provider> for ProviderTable<T> {
    fn index_mut(&mut self, provider: Provider) -> &mut T {
        &mut self.0[provider.index()]
    }
}

/// Serialize a [`Duration`] as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_provider_names() {
        assert_eq!("openai".parse::<Provider>(), Ok(Provider::OpenAi));
        assert_eq!("Anthropic".parse::<Provider>(), Ok(Provider::Anthropic));
        assert_eq!(" deepseek ".parse::<Provider>(), Ok(Provider::DeepSeek));
        assert_eq!(
            "mistral".parse::<Provider>(),
            Err(UnknownProvider("mistral".to_string()))
        );
    }

    #[test]
    fn test_wire_names_round_trip_through_serde() {
        for provider in Provider::ALL {
            let json = serde_json::to_string(&provider).unwrap();
            assert_eq!(json, format!("\"{}\"", provider.as_str()));
        }
    }

    #[test]
    fn test_custom_defaults_are_most_conservative() {
        let custom = Provider::Custom.default_limits();
        for provider in Provider::ALL {
            let limits = provider.default_limits();
            assert!(custom.max_concurrent_requests <= limits.max_concurrent_requests);
            assert!(custom.rate_limit.requests <= limits.rate_limit.requests);
            assert!(limits.validate().is_ok());
        }
    }

    #[test]
    fn test_merge_partial_limits() {
        let base = Provider::OpenAi.default_limits();
        let merged = base.merged(&PartialLimits {
            max_queue_size: Some(3),
            request_timeout_ms: Some(1500),
            ..Default::default()
        });
        assert_eq!(merged.max_queue_size, 3);
        assert_eq!(merged.request_timeout, Duration::from_millis(1500));
        assert_eq!(merged.max_concurrent_requests, base.max_concurrent_requests);
        assert_eq!(merged.rate_limit, base.rate_limit);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut limits = Provider::Gemini.default_limits();
        limits.max_concurrent_requests = 0;
        assert!(limits.validate().is_err());

        let mut limits = Provider::Gemini.default_limits();
        limits.rate_limit.window = Duration::ZERO;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_limits_serialize_durations_as_millis() {
        let limits = Provider::Tavily.default_limits();
        let json = serde_json::to_value(limits).unwrap();
        assert_eq!(json["request_timeout_ms"], 30_000);
        assert_eq!(json["rate_limit"]["window_ms"], 60_000);
        assert_eq!(json["rate_limit"]["requests"], 100);
    }

    #[test]
    fn test_table_indexing() {
        let mut table = ProviderTable::from_fn(|p| p.as_str().len());
        assert_eq!(table[Provider::Xai], 3);
        table[Provider::Xai] = 42;
        assert_eq!(table[Provider::Xai], 42);
        assert_eq!(table.iter().count(), Provider::ALL.len());
    }
}
