//! Configuration parsing and validation for llmgate.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::admission::{BreakerConfig, ControllerConfig};
use crate::provider::{InvalidLimits, PartialLimits, Provider, ProviderLimits, UnknownProvider};
use crate::proxy::stream::RelayConfig;

/// Root configuration structure.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: Option<DatabaseConfig>,
    pub admission: AdmissionConfig,
    pub providers: Vec<ProviderConfig>,
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Provider used when a request names none.
    #[serde(default)]
    pub default_provider: Option<Provider>,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            default_provider: None,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "./llmgate.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Admission controller and relay tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub sweep_interval_secs: u64,
    pub max_stream_lifetime_secs: u64,
    pub max_buffer_size: usize,
    /// Frames buffered between the relay and the HTTP body.
    pub channel_capacity: usize,
    pub refill_interval_ms: u64,
    /// Overall limit on a streamed response, if any.
    pub stream_timeout_secs: Option<u64>,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            max_stream_lifetime_secs: 300,
            max_buffer_size: crate::proxy::stream::DEFAULT_MAX_BUFFER_SIZE,
            channel_capacity: 16,
            refill_interval_ms: 1000,
            stream_timeout_secs: None,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: crate::admission::DEFAULT_FAILURE_THRESHOLD,
            reset_timeout_secs: crate::admission::DEFAULT_RESET_TIMEOUT.as_secs(),
        }
    }
}

impl AdmissionConfig {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            breaker: BreakerConfig {
                failure_threshold: self.circuit_breaker.failure_threshold,
                reset_timeout: Duration::from_secs(self.circuit_breaker.reset_timeout_secs),
            },
            refill_interval: Duration::from_millis(self.refill_interval_ms),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            max_stream_lifetime: Duration::from_secs(self.max_stream_lifetime_secs),
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_buffer_size: self.max_buffer_size,
            timeout: self.stream_timeout_secs.map(Duration::from_secs),
        }
    }
}

const REDACTED: &str = "[REDACTED]";

/// A provider API key. Never printed or serialized in the clear.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

impl From<String> for ApiKey {
    fn from(key: String) -> Self {
        Self(SecretString::from(key))
    }
}

impl From<&str> for ApiKey {
    fn from(key: &str) -> Self {
        Self(SecretString::from(key))
    }
}

/// Where a provider's API key came from, as reported by `llmgate check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Written out in the config file.
    Literal,
    /// Built from `${VAR}` references.
    EnvExpanded,
    /// Picked up from `LLMGATE_<PROVIDER>_API_KEY`; holds the variable name.
    Convention(String),
    None,
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Literal => f.write_str("literal in config"),
            KeySource::EnvExpanded => f.write_str("expanded from environment"),
            KeySource::Convention(var) => write!(f, "from ${}", var),
            KeySource::None => f.write_str("not set"),
        }
    }
}

/// A configured provider endpoint with optional limit overrides.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub provider: Provider,
    /// Base URL of an OpenAI-compatible API (e.g., "https://api.openai.com/v1")
    pub url: String,
    pub api_key: Option<ApiKey>,
    /// Overrides applied on top of the provider's built-in limits.
    pub limits: PartialLimits,
}

impl ProviderConfig {
    /// Effective limits: built-in defaults merged with overrides.
    pub fn limits(&self) -> ProviderLimits {
        self.provider.default_limits().merged(&self.limits)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to record request metrics to the database
    #[serde(default = "default_true")]
    pub log_requests: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_requests: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Invalid limits for provider '{provider}': {source}")]
    Limits {
        provider: Provider,
        #[source]
        source: InvalidLimits,
    },

    #[error("Cannot expand '{var}' for provider '{provider}': {message}")]
    EnvVar {
        var: String,
        provider: String,
        message: String,
    },
}

/// A `[[providers]]` entry as written, before `${VAR}` expansion.
#[derive(Deserialize)]
pub struct RawProviderConfig {
    name: String,
    url: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(flatten)]
    limits: PartialLimits,
}

/// The config file as written.
#[derive(Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    database: Option<DatabaseConfig>,
    #[serde(default)]
    admission: AdmissionConfig,
    #[serde(default)]
    providers: Vec<RawProviderConfig>,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Replace every `${VAR}` in `input` with `lookup(VAR)`.
fn expand_vars<F>(input: &str, provider: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let fail = |var: &str, message: String| ConfigError::EnvVar {
        var: var.to_string(),
        provider: provider.to_string(),
        message,
    };

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some((literal, reference)) = rest.split_once("${") {
        out.push_str(literal);
        let (var, after) = reference
            .split_once('}')
            .ok_or_else(|| fail("${", format!("unclosed reference in '{}'", input)))?;
        if var.is_empty() {
            return Err(fail("${}", "empty variable name".to_string()));
        }
        let value = lookup(var).ok_or_else(|| fail(var, "variable is not set".to_string()))?;
        out.push_str(&value);
        rest = after;
    }
    out.push_str(rest);
    Ok(out)
}

/// `LLMGATE_<NAME>_API_KEY`, upper-cased with `-` and spaces as `_`.
pub fn convention_env_var_name(provider_name: &str) -> String {
    let name: String = provider_name
        .chars()
        .map(|c| match c {
            '-' | ' ' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect();
    format!("LLMGATE_{}_API_KEY", name)
}

/// Expanded `${VAR}`s, a literal, or the convention variable, in that order.
fn resolve_key<F>(
    provider: Provider,
    raw: Option<&str>,
    lookup: &F,
) -> Result<(Option<ApiKey>, KeySource), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match raw {
        Some(raw) if raw.contains("${") => {
            let key = expand_vars(raw, provider.as_str(), lookup)?;
            Ok((Some(key.into()), KeySource::EnvExpanded))
        }
        Some(raw) => Ok((Some(raw.into()), KeySource::Literal)),
        None => {
            let var = convention_env_var_name(provider.as_str());
            Ok(match lookup(&var) {
                Some(key) => (Some(key.into()), KeySource::Convention(var)),
                None => (None, KeySource::None),
            })
        }
    }
}

impl Config {
    /// Read and parse `path`, resolving `${VAR}` from the process environment.
    /// Also returns where each provider's key came from.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(Provider, KeySource)>), ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse_with_env(&content)
    }

    pub fn parse_with_env(content: &str) -> Result<(Self, Vec<(Provider, KeySource)>), ConfigError> {
        Self::parse_with(content, |name| std::env::var(name).ok())
    }

    /// Like [`parse_with_env`](Self::parse_with_env), without key sources.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse_with_env(content).map(|(config, _)| config)
    }

    /// Parse and validate `content`, resolving variables through `lookup`.
    pub fn parse_with<F>(
        content: &str,
        lookup: F,
    ) -> Result<(Self, Vec<(Provider, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw: RawConfig = toml::from_str(content)?;
        let (config, key_sources) = Self::from_raw_with(raw, lookup)?;
        config.validate()?;
        Ok((config, key_sources))
    }

    /// Build a `Config` from the file as written, expanding `url` and
    /// `api_key`. Does not validate.
    pub fn from_raw_with<F>(
        raw: RawConfig,
        lookup: F,
    ) -> Result<(Self, Vec<(Provider, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut key_sources = Vec::with_capacity(raw.providers.len());
        let providers = raw
            .providers
            .into_iter()
            .map(|rp| {
                let provider: Provider = rp
                    .name
                    .parse()
                    .map_err(|e: UnknownProvider| ConfigError::Validation(e.to_string()))?;
                let url = expand_vars(&rp.url, provider.as_str(), &lookup)?;
                let (api_key, source) = resolve_key(provider, rp.api_key.as_deref(), &lookup)?;
                key_sources.push((provider, source));
                Ok(ProviderConfig {
                    provider,
                    url,
                    api_key,
                    limits: rp.limits,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let config = Config {
            server: raw.server,
            database: raw.database,
            admission: raw.admission,
            providers,
            logging: raw.logging,
        };
        Ok((config, key_sources))
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            tracing::warn!("No providers configured - gateway will reject all requests");
        }

        let mut seen = HashSet::new();
        for p in &self.providers {
            if !seen.insert(p.provider) {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' is configured more than once",
                    p.provider
                )));
            }
            if p.url.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' has empty URL",
                    p.provider
                )));
            }
            p.limits().validate().map_err(|source| ConfigError::Limits {
                provider: p.provider,
                source,
            })?;
        }

        if let Some(default) = self.server.default_provider {
            if !seen.contains(&default) {
                return Err(ConfigError::Validation(format!(
                    "Default provider '{}' is not configured",
                    default
                )));
            }
        }

        if self.admission.refill_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "admission.refill_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.admission.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "admission.sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.admission.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "admission.circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Get database config with defaults.
    pub fn database(&self) -> DatabaseConfig {
        self.database.clone().unwrap_or_default()
    }

    pub fn provider(&self, provider: Provider) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.provider == provider)
    }

    /// Effective limits for every configured provider.
    pub fn provider_limits(&self) -> Vec<(Provider, ProviderLimits)> {
        self.providers.iter().map(|p| (p.provider, p.limits())).collect()
    }
}
