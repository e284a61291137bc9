//! Error types for llmgate.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::admission::{AdmissionError, BreakerError};
use crate::provider::{InvalidLimits, UnknownProvider};
use crate::proxy::upstream::UpstreamError;

/// Result type alias for llmgate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for llmgate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("{0}")]
    UnknownProvider(#[from] UnknownProvider),

    #[error("{0}")]
    InvalidLimits(#[from] InvalidLimits),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<BreakerError<UpstreamError>> for Error {
    fn from(err: BreakerError<UpstreamError>) -> Self {
        match err {
            BreakerError::Open(open) => Error::Admission(open.into()),
            BreakerError::Failed(e) => Error::Upstream(e),
        }
    }
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Admission(e) => match e {
                AdmissionError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
                AdmissionError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                AdmissionError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
                AdmissionError::QueueTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                AdmissionError::DuplicateRequest { .. } => StatusCode::CONFLICT,
                AdmissionError::Shutdown { .. } => StatusCode::SERVICE_UNAVAILABLE,
            },
            Error::Upstream(UpstreamError::NotConfigured { .. }) => StatusCode::BAD_REQUEST,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::UnknownProvider(_) | Error::InvalidLimits(_) | Error::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Config(_) | Error::Internal(_) | Error::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable error type for the response body.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Admission(e) => e.kind(),
            Error::Upstream(_) => "upstream_error",
            Error::UnknownProvider(_) => "unknown_provider",
            Error::InvalidLimits(_) => "invalid_limits",
            Error::BadRequest(_) => "invalid_request",
            Error::Config(_) | Error::Internal(_) | Error::Database(_) => "internal_error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        // OpenAI-compatible error format
        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
                "code": status.as_u16()
            }
        });

        let mut response = (status, axum::Json(body)).into_response();
        let retry_after = match &self {
            Error::Admission(AdmissionError::CircuitOpen(open)) => Some(open.retry_after.as_secs().max(1)),
            Error::Admission(AdmissionError::RateLimitExceeded { .. }) => Some(1),
            _ => None,
        };
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::CircuitOpenError;
    use crate::provider::Provider;
    use std::time::Duration;

    #[test]
    fn test_admission_status_codes() {
        let cases = [
            (
                AdmissionError::CircuitOpen(CircuitOpenError {
                    provider: Provider::OpenAi,
                    failure_count: 5,
                    retry_after: Duration::from_secs(30),
                }),
                503,
            ),
            (
                AdmissionError::RateLimitExceeded {
                    provider: Provider::OpenAi,
                },
                429,
            ),
            (
                AdmissionError::QueueFull {
                    provider: Provider::OpenAi,
                    max_queue_size: 1,
                },
                503,
            ),
            (
                AdmissionError::QueueTimeout {
                    provider: Provider::OpenAi,
                    request_id: "r".into(),
                    waited: Duration::from_secs(60),
                },
                504,
            ),
            (
                AdmissionError::Shutdown {
                    provider: Provider::OpenAi,
                },
                503,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(Error::from(err).status().as_u16(), code);
        }
    }

    #[test]
    fn test_breaker_error_conversion() {
        let open = BreakerError::<UpstreamError>::Open(CircuitOpenError {
            provider: Provider::Gemini,
            failure_count: 5,
            retry_after: Duration::from_secs(10),
        });
        assert_eq!(Error::from(open).kind(), "circuit_open");

        let failed = BreakerError::Failed(UpstreamError::Status {
            provider: Provider::Gemini,
            status: 500,
            body: "oops".into(),
        });
        assert_eq!(Error::from(failed).status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_retry_after_header_on_rate_limit() {
        let response = Error::from(AdmissionError::RateLimitExceeded {
            provider: Provider::Anthropic,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
    }

    #[test]
    fn test_messages_name_the_provider() {
        let err = Error::from(AdmissionError::RateLimitExceeded {
            provider: Provider::Anthropic,
        });
        assert!(err.to_string().contains("anthropic"));
    }
}
