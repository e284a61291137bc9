//! HTTP request handlers.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use std::convert::Infallible;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use super::server::AppState;
use super::stream::{relay, ChannelSink, RelayOutcome};
use super::types::{extract_usage, ChatCompletionRequest};
use crate::admission::CircuitState;
use crate::error::Error;
use crate::provider::{PartialLimits, Provider};
use crate::storage::{RequestRecord, StreamingRecord};

/// Request header: provider to call.
pub const LLMGATE_PROVIDER_HEADER: &str = "x-llmgate-provider";
/// Request header: admission priority (integer, higher first, default 1).
pub const LLMGATE_PRIORITY_HEADER: &str = "x-llmgate-priority";

/// Response header: correlation ID (UUID v4).
pub const LLMGATE_REQUEST_ID_HEADER: &str = "x-llmgate-request-id";
/// Response header: provider that handled the request.
pub const LLMGATE_PROVIDER_RESPONSE_HEADER: &str = "x-llmgate-provider";
/// Response header: present with value "true" on streaming responses.
pub const LLMGATE_STREAMING_HEADER: &str = "x-llmgate-streaming";
/// Response header: time spent waiting for admission, in milliseconds.
pub const LLMGATE_QUEUE_MS_HEADER: &str = "x-llmgate-queue-ms";

const DEFAULT_PRIORITY: i32 = 1;

/// Attach llmgate metadata headers to a response.
fn attach_llmgate_headers(
    response: &mut Response,
    request_id: &str,
    provider: Option<Provider>,
    queue_wait_ms: Option<u64>,
    is_streaming: bool,
) {
    let headers = response.headers_mut();

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HeaderName::from_static(LLMGATE_REQUEST_ID_HEADER), value);
    }
    if let Some(provider) = provider {
        headers.insert(
            HeaderName::from_static(LLMGATE_PROVIDER_RESPONSE_HEADER),
            HeaderValue::from_static(provider.as_str()),
        );
    }
    if let Some(ms) = queue_wait_ms {
        headers.insert(
            HeaderName::from_static(LLMGATE_QUEUE_MS_HEADER),
            HeaderValue::from(ms),
        );
    }
    if is_streaming {
        headers.insert(
            HeaderName::from_static(LLMGATE_STREAMING_HEADER),
            HeaderValue::from_static("true"),
        );
    }
}

/// Pick the provider from the request header, else the configured default.
fn resolve_provider(state: &AppState, headers: &HeaderMap) -> Result<Provider, Error> {
    match headers.get(LLMGATE_PROVIDER_HEADER) {
        Some(value) => {
            let name = value
                .to_str()
                .map_err(|_| Error::BadRequest(format!("{} is not valid UTF-8", LLMGATE_PROVIDER_HEADER)))?;
            Ok(name.parse()?)
        }
        None => state.config.server.default_provider.ok_or_else(|| {
            Error::BadRequest(format!(
                "No provider given: set the {} header or server.default_provider",
                LLMGATE_PROVIDER_HEADER
            ))
        }),
    }
}

fn parse_priority(headers: &HeaderMap) -> Result<i32, Error> {
    match headers.get(LLMGATE_PRIORITY_HEADER) {
        None => Ok(DEFAULT_PRIORITY),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| {
                Error::BadRequest(format!("{} must be an integer", LLMGATE_PRIORITY_HEADER))
            }),
    }
}

/// Per-request values shared by the success and failure paths.
struct RequestContext {
    request_id: String,
    provider: Option<Provider>,
    model: String,
    priority: i32,
    started: Instant,
    admitted_at: Option<Instant>,
}

impl RequestContext {
    fn queue_wait_ms(&self) -> Option<u64> {
        self.admitted_at
            .map(|t| t.duration_since(self.started).as_millis() as u64)
    }

    fn record(&self, provider: Provider, outcome: &str, error: Option<&Error>) -> RequestRecord {
        RequestRecord {
            request_id: self.request_id.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            provider,
            model: self.model.clone(),
            priority: self.priority,
            outcome: outcome.to_string(),
            error_kind: error.map(|e| e.kind().to_string()),
            error_message: error.map(|e| e.to_string()),
            queue_wait_ms: self.queue_wait_ms().unwrap_or(0),
            latency_ms: self.started.elapsed().as_millis() as u64,
            usage: None,
        }
    }
}

/// Handle POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let mut ctx = RequestContext {
        request_id: uuid::Uuid::new_v4().to_string(),
        provider: None,
        model: request.model.clone(),
        priority: DEFAULT_PRIORITY,
        started: Instant::now(),
        admitted_at: None,
    };
    let is_streaming = request.is_streaming();

    match execute_request(&state, &headers, request, &mut ctx).await {
        Ok(mut response) => {
            attach_llmgate_headers(
                &mut response,
                &ctx.request_id,
                ctx.provider,
                ctx.queue_wait_ms(),
                is_streaming,
            );
            response
        }
        Err(error) => {
            tracing::warn!(
                request_id = %ctx.request_id,
                provider = ?ctx.provider,
                error = %error,
                "Chat completion request failed"
            );
            if let Some(provider) = ctx.provider {
                let outcome = match error {
                    Error::Admission(_) => "rejected",
                    Error::Upstream(_) => "upstream_error",
                    _ => "error",
                };
                state
                    .metrics
                    .record_request(ctx.record(provider, outcome, Some(&error)));
            }
            let mut response = error.into_response();
            attach_llmgate_headers(
                &mut response,
                &ctx.request_id,
                ctx.provider,
                ctx.queue_wait_ms(),
                false,
            );
            response
        }
    }
}

/// Admit, call the provider, and build the response.
async fn execute_request(
    state: &AppState,
    headers: &HeaderMap,
    request: ChatCompletionRequest,
    ctx: &mut RequestContext,
) -> Result<Response, Error> {
    let provider = resolve_provider(state, headers)?;
    ctx.provider = Some(provider);
    ctx.priority = parse_priority(headers)?;
    request.validate().map_err(Error::BadRequest)?;

    tracing::info!(
        request_id = %ctx.request_id,
        provider = %provider,
        model = %request.model,
        priority = ctx.priority,
        stream = request.is_streaming(),
        "Received chat completion request"
    );

    let permit = state
        .controller
        .admit(provider, &ctx.request_id, ctx.priority)
        .await?;
    let admitted_at = Instant::now();
    ctx.admitted_at = Some(admitted_at);

    let source = state.source.clone();

    if !request.is_streaming() {
        let result = state
            .controller
            .execute(provider, || source.create_chat_completion(provider, request))
            .await;
        permit.release();
        let body = result?;

        let mut record = ctx.record(provider, "success", None);
        record.usage = extract_usage(&body);
        state.metrics.record_request(record);

        return Ok(Json(body).into_response());
    }

    // The permit is still held; dropping it on error releases the slot.
    let chunks = state
        .controller
        .execute(provider, || source.stream_chat_completion(provider, request))
        .await?;

    let lease = permit.into_stream();
    let (sink, rx) = ChannelSink::new(state.config.admission.channel_capacity);
    let relay_config = state.config.admission.relay_config();
    let controller = state.controller.clone();
    let metrics = state.metrics.clone();
    let base = ctx.record(provider, "", None);
    let started = ctx.started;

    tokio::spawn(async move {
        let report = relay(lease, chunks, sink, relay_config, admitted_at).await;
        if let RelayOutcome::Failed(message) = &report.outcome {
            controller.breaker(provider).record_failure(message);
        }
        let mut request = base;
        request.outcome = report.outcome.as_str().to_string();
        if let RelayOutcome::Failed(message) = &report.outcome {
            request.error_kind = Some("stream_error".to_string());
            request.error_message = Some(message.clone());
        }
        request.latency_ms = started.elapsed().as_millis() as u64;
        request.usage = report.usage;
        metrics.record_streaming_request(StreamingRecord {
            request,
            first_token_ms: report.first_token_latency.map(|d| d.as_millis() as u64),
            chunks: report.chunks as u64,
            bytes: report.bytes as u64,
        });
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    let mut response = Response::new(body);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(response)
}

/// Handle GET /health
///
/// `ok` when every configured provider's circuit is closed, `degraded` when
/// some are not, `unhealthy` (503) when all are open.
pub async fn health(State(state): State<AppState>) -> Response {
    let mut providers = serde_json::Map::new();
    let mut open = 0;
    let mut not_closed = 0;

    for p in &state.config.providers {
        let snapshot = state.controller.breaker(p.provider).snapshot();
        match snapshot.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                open += 1;
                not_closed += 1;
            }
            CircuitState::HalfOpen => not_closed += 1,
        }
        providers.insert(
            p.provider.to_string(),
            serde_json::json!({
                "state": snapshot.state,
                "failure_count": snapshot.failure_count,
            }),
        );
    }

    let configured = state.config.providers.len();
    let (status_code, status) = if configured > 0 && open == configured {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else if not_closed > 0 {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "ok")
    };

    (
        status_code,
        Json(serde_json::json!({
            "status": status,
            "service": "llmgate",
            "providers": providers,
        })),
    )
        .into_response()
}

/// Handle GET /v1/admission
pub async fn admission_status_all(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "providers": state.controller.status_all(),
        "streams": state.controller.streams().list(Instant::now()),
    }))
}

/// Handle GET /v1/admission/:provider
pub async fn admission_status(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let provider: Provider = provider.parse()?;
    Ok(Json(state.controller.status(provider)))
}

/// Handle POST /v1/admission/:provider/reset
pub async fn reset_circuit(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let provider: Provider = provider.parse()?;
    state.controller.reset_circuit_breaker(provider);
    Ok(Json(state.controller.status(provider)))
}

/// Handle PATCH /v1/admission/:provider/limits
pub async fn update_limits(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(partial): Json<PartialLimits>,
) -> Result<impl IntoResponse, Error> {
    let provider: Provider = provider.parse()?;
    state.controller.update_limits(provider, &partial)?;
    Ok(Json(state.controller.status(provider)))
}
