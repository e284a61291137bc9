//! Chunk sources: where streamed completions come from.
//!
//! [`ChunkSource`] is the seam between admission and provider adapters.
//! [`HttpChunkSource`] talks to OpenAI-compatible `/chat/completions`
//! endpoints and decodes their SSE bodies with [`SseDecoder`].

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::header;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt::Display;
use std::time::Duration;

use super::types::ChatCompletionRequest;
use crate::config::{ApiKey, Config};
use crate::provider::{Provider, ProviderTable};

/// Longest SSE line the decoder will buffer. Longer lines end the stream
/// with a decode error.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Errors from calling a provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("Provider '{provider}' is not configured")]
    NotConfigured { provider: Provider },

    #[error("Failed to reach provider '{provider}': {message}")]
    Transport { provider: Provider, message: String },

    #[error("Provider '{provider}' returned {status}: {body}")]
    Status {
        provider: Provider,
        status: u16,
        body: String,
    },

    #[error("Invalid response from provider '{provider}': {message}")]
    Decode { provider: Provider, message: String },
}

/// A lazy sequence of provider-neutral chunk payloads.
pub type ChunkStream = BoxStream<'static, Result<Value, UpstreamError>>;

/// Produces completions for a provider.
pub trait ChunkSource: Send + Sync {
    /// Open a streamed completion. Errors before the first chunk are
    /// returned here; later errors arrive in the stream.
    fn stream_chat_completion(
        &self,
        provider: Provider,
        request: ChatCompletionRequest,
    ) -> BoxFuture<'_, Result<ChunkStream, UpstreamError>>;

    /// Run a non-streamed completion.
    fn create_chat_completion(
        &self,
        provider: Provider,
        request: ChatCompletionRequest,
    ) -> BoxFuture<'_, Result<Value, UpstreamError>>;
}

/// Line-buffered decoder for `text/event-stream` bodies.
///
/// Reassembles lines split across network reads and yields the JSON payload
/// of each `data:` line until `data: [DONE]`.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
    oversized: Option<usize>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `[DONE]` has been seen. Nothing is decoded after it.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Length of the line that exceeded [`MAX_LINE_BYTES`], if one did.
    /// Nothing is decoded after it.
    pub fn oversized_line(&self) -> Option<usize> {
        self.oversized
    }

    /// Feed raw bytes, returning every payload completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Value> {
        let mut out = Vec::new();
        if self.done || self.oversized.is_some() {
            return out;
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.process_line(&line[..line.len() - 1], &mut out);
            if self.done {
                self.buffer.clear();
                return out;
            }
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            tracing::warn!(buffered = self.buffer.len(), "SSE line too long, giving up");
            self.oversized = Some(self.buffer.len());
            self.buffer = Vec::new();
        }
        out
    }

    /// Decode whatever is left once the body has ended.
    pub fn finish(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        if !self.done && self.oversized.is_none() && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.process_line(&line, &mut out);
        }
        out
    }

    fn process_line(&mut self, raw: &[u8], out: &mut Vec<Value>) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let Ok(line) = std::str::from_utf8(raw) else {
            tracing::warn!("Skipping non-UTF-8 SSE line");
            return;
        };
        // event:, id:, retry:, comments and blank separators carry nothing we forward
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.strip_prefix(' ').unwrap_or(data);
        if data == "[DONE]" {
            self.done = true;
            return;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(value) => out.push(value),
            Err(e) => tracing::warn!(error = %e, "Skipping malformed SSE data line"),
        }
    }
}

/// Decode an SSE byte stream into a [`ChunkStream`].
///
/// The stream ends at `[DONE]` or when the body ends; a body error is
/// yielded once and ends the stream.
pub fn sse_chunk_stream<S, E>(provider: Provider, body: S) -> ChunkStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display,
{
    struct State<S> {
        body: std::pin::Pin<Box<S>>,
        decoder: SseDecoder,
        pending: VecDeque<Value>,
        error: Option<UpstreamError>,
        finished: bool,
    }

    let state = State {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        error: None,
        finished: false,
    };

    stream::unfold(state, move |mut state| async move {
        loop {
            if let Some(chunk) = state.pending.pop_front() {
                return Some((Ok(chunk), state));
            }
            if let Some(err) = state.error.take() {
                return Some((Err(err), state));
            }
            if state.finished || state.decoder.is_done() {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    state.pending.extend(state.decoder.feed(&bytes));
                    if let Some(len) = state.decoder.oversized_line() {
                        state.finished = true;
                        state.error = Some(UpstreamError::Decode {
                            provider,
                            message: format!(
                                "SSE line of {} bytes exceeds the {} byte limit",
                                len, MAX_LINE_BYTES
                            ),
                        });
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    let err = UpstreamError::Transport {
                        provider,
                        message: e.to_string(),
                    };
                    return Some((Err(err), state));
                }
                None => {
                    state.finished = true;
                    state.pending.extend(state.decoder.finish());
                }
            }
        }
    })
    .boxed()
}

/// Where to reach one provider.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: String,
    pub api_key: Option<ApiKey>,
}

/// [`ChunkSource`] for OpenAI-compatible HTTP endpoints.
#[derive(Debug, Clone)]
pub struct HttpChunkSource {
    client: reqwest::Client,
    endpoints: ProviderTable<Option<Endpoint>>,
}

impl HttpChunkSource {
    pub fn new(
        client: reqwest::Client,
        endpoints: impl IntoIterator<Item = (Provider, Endpoint)>,
    ) -> Self {
        let mut table = ProviderTable::from_fn(|_| None);
        for (provider, endpoint) in endpoints {
            table[provider] = Some(endpoint);
        }
        Self {
            client,
            endpoints: table,
        }
    }

    /// Build from the `[[providers]]` section of `config`.
    pub fn from_config(config: &Config) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let endpoints = config.providers.iter().map(|p| {
            (
                p.provider,
                Endpoint {
                    url: p.url.clone(),
                    api_key: p.api_key.clone(),
                },
            )
        });
        Ok(Self::new(client, endpoints))
    }

    pub fn is_configured(&self, provider: Provider) -> bool {
        self.endpoints[provider].is_some()
    }

    async fn send(
        &self,
        provider: Provider,
        request: &ChatCompletionRequest,
    ) -> Result<reqwest::Response, UpstreamError> {
        let endpoint = self.endpoints[provider]
            .as_ref()
            .ok_or(UpstreamError::NotConfigured { provider })?;
        let url = format!("{}/chat/completions", endpoint.url.trim_end_matches('/'));

        let mut builder = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(request);
        if let Some(api_key) = &endpoint.api_key {
            builder = builder.header(
                header::AUTHORIZATION,
                format!("Bearer {}", api_key.expose_secret()),
            );
        }

        let response = builder.send().await.map_err(|e| {
            tracing::error!(provider = %provider, error = %e, "Failed to reach provider");
            UpstreamError::Transport {
                provider,
                message: e.to_string(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(provider = %provider, status = %status, body = %body, "Provider returned error");
            return Err(UpstreamError::Status {
                provider,
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

impl ChunkSource for HttpChunkSource {
    fn stream_chat_completion(
        &self,
        provider: Provider,
        mut request: ChatCompletionRequest,
    ) -> BoxFuture<'_, Result<ChunkStream, UpstreamError>> {
        Box::pin(async move {
            request.stream = Some(true);
            request.request_usage_trailer();
            let response = self.send(provider, &request).await?;
            Ok(sse_chunk_stream(provider, response.bytes_stream()))
        })
    }

    fn create_chat_completion(
        &self,
        provider: Provider,
        mut request: ChatCompletionRequest,
    ) -> BoxFuture<'_, Result<Value, UpstreamError>> {
        Box::pin(async move {
            request.stream = Some(false);
            let response = self.send(provider, &request).await?;
            response
                .json::<Value>()
                .await
                .map_err(|e| UpstreamError::Decode {
                    provider,
                    message: e.to_string(),
                })
        })
    }
}
