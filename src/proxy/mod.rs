//! HTTP proxy server module.
//!
//! This module provides the OpenAI-compatible HTTP API that admits
//! requests, calls the selected provider, and relays streamed responses.

mod handlers;
mod server;
pub mod stream;
pub mod types;
pub mod upstream;

pub use handlers::{
    LLMGATE_PRIORITY_HEADER, LLMGATE_PROVIDER_HEADER, LLMGATE_QUEUE_MS_HEADER,
    LLMGATE_REQUEST_ID_HEADER, LLMGATE_STREAMING_HEADER,
};
pub use server::{create_router, run_server, AppState};
pub use stream::{relay, ChannelSink, FrameSink, RelayConfig, RelayOutcome, RelayReport, SinkClosed};
pub use types::{ChatCompletionRequest, Message};
pub use upstream::{
    sse_chunk_stream, ChunkSource, ChunkStream, Endpoint, HttpChunkSource, SseDecoder,
    UpstreamError,
};
