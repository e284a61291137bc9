//! Integration tests for the HTTP surface.
//!
//! Verifies that:
//! - Streaming completions are relayed as SSE ending with `[DONE]`
//! - Non-streaming completions return the provider JSON
//! - Admission rejections map to 429 / 503 with an OpenAI-style error body
//! - Upstream failures trip the circuit and /health reflects it
//! - The /v1/admission endpoints report, reset and reconfigure providers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use llmgate::admission::CircuitState;
use llmgate::config::Config;
use llmgate::proxy::{
    create_router, AppState, ChatCompletionRequest, ChunkSource, ChunkStream, UpstreamError,
};
use llmgate::storage::{MetricsSink, RequestRecord, StreamingRecord};
use llmgate::Provider;

/// Chunk source that replays fixed chunks, or fails with a status.
struct ScriptedSource {
    chunks: Vec<Value>,
    fail_status: Option<u16>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    fn ok() -> Self {
        Self {
            chunks: vec![
                json!({"choices": [{"delta": {"content": "Hel"}}]}),
                json!({"choices": [{"delta": {"content": "lo"}}]}),
                json!({"choices": [], "usage": {"prompt_tokens": 3, "completion_tokens": 2}}),
            ],
            fail_status: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn failing(status: u16) -> Self {
        Self {
            fail_status: Some(status),
            ..Self::ok()
        }
    }
}

impl ChunkSource for ScriptedSource {
    fn stream_chat_completion(
        &self,
        provider: Provider,
        _request: ChatCompletionRequest,
    ) -> BoxFuture<'_, Result<ChunkStream, UpstreamError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let chunks = self.chunks.clone();
        let fail_status = self.fail_status;
        Box::pin(async move {
            if let Some(status) = fail_status {
                return Err(UpstreamError::Status {
                    provider,
                    status,
                    body: "upstream exploded".to_string(),
                });
            }
            Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
        })
    }

    fn create_chat_completion(
        &self,
        provider: Provider,
        request: ChatCompletionRequest,
    ) -> BoxFuture<'_, Result<Value, UpstreamError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fail_status = self.fail_status;
        Box::pin(async move {
            if let Some(status) = fail_status {
                return Err(UpstreamError::Status {
                    provider,
                    status,
                    body: "upstream exploded".to_string(),
                });
            }
            Ok(json!({
                "id": "chatcmpl-1",
                "model": request.model,
                "choices": [{"message": {"role": "assistant", "content": "Hello"}}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 1},
            }))
        })
    }
}

#[derive(Default)]
struct RecordingMetrics {
    requests: Mutex<Vec<RequestRecord>>,
    streams: Mutex<Vec<StreamingRecord>>,
}

impl MetricsSink for RecordingMetrics {
    fn record_request(&self, record: RequestRecord) {
        self.requests.lock().unwrap().push(record);
    }

    fn record_streaming_request(&self, record: StreamingRecord) {
        self.streams.lock().unwrap().push(record);
    }
}

const CONFIG: &str = r#"
    [server]
    listen = "127.0.0.1:0"
    default_provider = "openai"

    [admission.circuit_breaker]
    failure_threshold = 2
    reset_timeout_secs = 60

    [[providers]]
    name = "openai"
    url = "http://127.0.0.1:1/v1"
    api_key = "sk-test"

    [[providers]]
    name = "anthropic"
    url = "http://127.0.0.1:1/v1"
    api_key = "sk-test"
    rate_limit = { requests = 1, window_ms = 60000 }
"#;

fn setup_with(
    source: Arc<ScriptedSource>,
) -> (axum::Router, AppState, Arc<RecordingMetrics>) {
    let config = Config::parse_str(CONFIG).unwrap();
    let metrics = Arc::new(RecordingMetrics::default());
    let state = AppState::new(config, source).with_metrics(metrics.clone());
    (create_router(state.clone()), state, metrics)
}

fn setup(source: ScriptedSource) -> (axum::Router, AppState, Arc<RecordingMetrics>) {
    setup_with(Arc::new(source))
}

fn chat_request(provider: Option<&str>, stream: bool) -> Request<Body> {
    let body = json!({
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": "Hi"}],
        "stream": stream,
    });
    let mut builder = Request::post("/v1/chat/completions").header("content-type", "application/json");
    if let Some(provider) = provider {
        builder = builder.header("x-llmgate-provider", provider);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), 1_048_576)
        .await
        .unwrap()
        .to_vec()
}

async fn parse_body(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Let the relay task finish its cleanup after the body has ended.
async fn settle(state: &AppState, provider: Provider) {
    for _ in 0..100 {
        if state.controller.status(provider).active_requests == 0 {
            return;
        }
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_streaming_completion_relays_sse() {
    let (app, state, metrics) = setup(ScriptedSource::ok());

    let response = app.oneshot(chat_request(None, true)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers.get("content-type").unwrap(), "text/event-stream");
    assert_eq!(headers.get("x-llmgate-streaming").unwrap(), "true");
    assert_eq!(headers.get("x-llmgate-provider").unwrap(), "openai");
    assert!(headers.contains_key("x-llmgate-request-id"));
    assert!(headers.contains_key("x-llmgate-queue-ms"));

    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(text.starts_with("data: {"));
    assert!(text.contains("\"Hel\""));
    assert!(text.contains("\"lo\""));
    assert!(text.ends_with("data: [DONE]\n\n"));

    settle(&state, Provider::OpenAi).await;
    let status = state.controller.status(Provider::OpenAi);
    assert_eq!(status.active_requests, 0);
    assert_eq!(status.active_streams, 0);

    let streams = metrics.streams.lock().unwrap();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].request.outcome, "completed");
    assert_eq!(streams[0].chunks, 3);
    assert_eq!(streams[0].request.usage.map(|u| u.completion_tokens), Some(2));
}

#[tokio::test]
async fn test_non_streaming_completion_returns_json() {
    let (app, state, metrics) = setup(ScriptedSource::ok());

    let response = app
        .oneshot(chat_request(Some("openai"), false))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-llmgate-streaming").is_none());

    let body = parse_body(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], "Hello");
    assert_eq!(state.controller.status(Provider::OpenAi).active_requests, 0);

    let requests = metrics.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].outcome, "success");
    assert_eq!(requests[0].model, "gpt-4o");
}

#[tokio::test]
async fn test_rate_limit_returns_429() {
    let (app, _state, metrics) = setup(ScriptedSource::ok());

    let first = app
        .clone()
        .oneshot(chat_request(Some("anthropic"), false))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(chat_request(Some("anthropic"), false))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().contains_key("retry-after"));
    assert_eq!(second.headers().get("x-llmgate-provider").unwrap(), "anthropic");

    let body = parse_body(second).await;
    assert_eq!(body["error"]["type"], "rate_limit_exceeded");
    assert_eq!(body["error"]["code"], 429);

    let requests = metrics.requests.lock().unwrap();
    assert_eq!(requests.last().unwrap().outcome, "rejected");
}

#[tokio::test]
async fn test_upstream_failures_open_circuit() {
    let source = Arc::new(ScriptedSource::failing(500));
    let (app, state, _metrics) = setup_with(source.clone());

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(chat_request(Some("openai"), true))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = parse_body(response).await;
        assert_eq!(body["error"]["type"], "upstream_error");
    }
    assert_eq!(
        state.controller.status(Provider::OpenAi).circuit_state,
        CircuitState::Open
    );
    // Slots are returned even though no stream was created
    assert_eq!(state.controller.status(Provider::OpenAi).active_requests, 0);

    let response = app
        .clone()
        .oneshot(chat_request(Some("openai"), true))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key("retry-after"));
    let body = parse_body(response).await;
    assert_eq!(body["error"]["type"], "circuit_open");
    assert_eq!(source.calls.load(Ordering::SeqCst), 2, "open circuit must not call the provider");

    // Anthropic is unaffected, so the gateway is degraded rather than down
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = parse_body(response).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["providers"]["openai"]["state"], "open");
    assert_eq!(body["providers"]["openai"]["failure_count"], 2);
    assert_eq!(body["providers"]["anthropic"]["state"], "closed");
}

#[tokio::test]
async fn test_health_status_levels() {
    let (app, state, _metrics) = setup(ScriptedSource::ok());

    let response = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = parse_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "llmgate");

    for provider in [Provider::OpenAi, Provider::Anthropic] {
        let breaker = state.controller.breaker(provider);
        breaker.record_failure("down");
        breaker.record_failure("down");
    }
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = parse_body(response).await;
    assert_eq!(body["status"], "unhealthy");
}

#[tokio::test]
async fn test_unknown_provider_is_bad_request() {
    let (app, _state, _metrics) = setup(ScriptedSource::ok());

    let response = app
        .oneshot(chat_request(Some("mistral"), false))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = parse_body(response).await;
    assert_eq!(body["error"]["type"], "unknown_provider");
}

#[tokio::test]
async fn test_invalid_priority_is_bad_request() {
    let (app, _state, _metrics) = setup(ScriptedSource::ok());

    let mut request = chat_request(Some("openai"), false);
    request
        .headers_mut()
        .insert("x-llmgate-priority", "urgent".parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = parse_body(response).await;
    assert_eq!(body["error"]["type"], "invalid_request");
}

#[tokio::test]
async fn test_admission_status_endpoints() {
    let (app, _state, _metrics) = setup(ScriptedSource::ok());

    let response = app
        .clone()
        .oneshot(Request::get("/v1/admission").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = parse_body(response).await;
    assert_eq!(body["providers"].as_array().unwrap().len(), Provider::ALL.len());
    assert!(body["streams"].as_array().unwrap().is_empty());

    let response = app
        .clone()
        .oneshot(Request::get("/v1/admission/anthropic").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = parse_body(response).await;
    assert_eq!(body["provider"], "anthropic");
    assert_eq!(body["active_requests"], 0);
    assert_eq!(body["circuit_state"], "closed");
    assert_eq!(body["limits"]["rate_limit"]["requests"], 1);

    let response = app
        .oneshot(Request::get("/v1/admission/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_reset_circuit_endpoint() {
    let (app, state, _metrics) = setup(ScriptedSource::ok());
    let breaker = state.controller.breaker(Provider::OpenAi);
    breaker.record_failure("down");
    breaker.record_failure("down");

    let response = app
        .oneshot(
            Request::post("/v1/admission/openai/reset")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = parse_body(response).await;
    assert_eq!(body["circuit_state"], "closed");
    assert_eq!(body["circuit_failures"], 0);
}

#[tokio::test]
async fn test_update_limits_endpoint() {
    let (app, state, _metrics) = setup(ScriptedSource::ok());

    let response = app
        .clone()
        .oneshot(
            Request::patch("/v1/admission/openai/limits")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"max_concurrent_requests": 3}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = parse_body(response).await;
    assert_eq!(body["limits"]["max_concurrent_requests"], 3);
    assert_eq!(
        state
            .controller
            .status(Provider::OpenAi)
            .limits
            .max_concurrent_requests,
        3
    );

    let response = app
        .oneshot(
            Request::patch("/v1/admission/openai/limits")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"max_concurrent_requests": 0}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = parse_body(response).await;
    assert_eq!(body["error"]["type"], "invalid_limits");
}
