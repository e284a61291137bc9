//! Streaming relay: forwards a provider's chunk stream to a client as
//! server-sent events.
//!
//! Chunks are framed as `data: <json>\n\n` into a bounded buffer that is
//! flushed when it fills, or when the source has nothing ready. The sink is
//! usually a bounded channel feeding the HTTP body, so a slow client
//! suspends the relay instead of growing memory.

use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::types::chunk_has_content;
use super::upstream::ChunkStream;
use crate::admission::StreamLease;

/// Flush threshold for buffered frames.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 64 * 1024;

/// Terminal sentinel frame.
pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// The consumer of a relay has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("frame sink closed")]
pub struct SinkClosed;

/// Destination for relayed frames.
pub trait FrameSink: Send {
    /// Write one or more complete frames. Suspends while the consumer is
    /// behind.
    fn write(&mut self, frame: Bytes) -> impl Future<Output = Result<(), SinkClosed>> + Send;

    /// Signal that no more frames follow.
    fn close(&mut self);

    /// Resolves once the consumer has gone away.
    fn closed(&self) -> impl Future<Output = ()> + Send {
        std::future::pending()
    }
}

/// [`FrameSink`] over a bounded channel whose receiver becomes the response body.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Bytes>>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }
}

impl FrameSink for ChannelSink {
    fn write(&mut self, frame: Bytes) -> impl Future<Output = Result<(), SinkClosed>> + Send {
        let tx = self.tx.clone();
        async move {
            match tx {
                Some(tx) => tx.send(frame).await.map_err(|_| SinkClosed),
                None => Err(SinkClosed),
            }
        }
    }

    fn close(&mut self) {
        self.tx = None;
    }

    fn closed(&self) -> impl Future<Output = ()> + Send {
        let tx = self.tx.clone();
        async move {
            if let Some(tx) = tx {
                tx.closed().await;
            }
        }
    }
}

/// Relay tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    pub max_buffer_size: usize,
    /// Overall limit on the relay, measured from its start.
    pub timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            timeout: None,
        }
    }
}

/// How a relay ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The source was exhausted and `[DONE]` was sent.
    Completed,
    /// The stream was cancelled or the client went away.
    Cancelled,
    /// The overall timeout fired.
    TimedOut,
    /// The chunk source failed.
    Failed(String),
}

impl RelayOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayOutcome::Completed => "completed",
            RelayOutcome::Cancelled => "cancelled",
            RelayOutcome::TimedOut => "timed_out",
            RelayOutcome::Failed(_) => "failed",
        }
    }
}

/// What a relay did.
#[derive(Debug, Clone)]
pub struct RelayReport {
    pub outcome: RelayOutcome,
    pub chunks: usize,
    pub bytes: usize,
    pub writes: usize,
    /// Time from admission to the first chunk carrying generated content.
    pub first_token_latency: Option<Duration>,
    pub duration: Duration,
    /// Usage from the last chunk that reported it.
    pub usage: Option<super::types::Usage>,
}

struct FrameBuffer {
    buf: Vec<u8>,
    max: usize,
    bytes: usize,
    writes: usize,
}

impl FrameBuffer {
    fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            buf: Vec::with_capacity(max.min(DEFAULT_MAX_BUFFER_SIZE)),
            max,
            bytes: 0,
            writes: 0,
        }
    }

    fn push_chunk(&mut self, chunk: &serde_json::Value) -> Result<(), serde_json::Error> {
        self.buf.extend_from_slice(b"data: ");
        serde_json::to_writer(&mut self.buf, chunk)?;
        self.buf.extend_from_slice(b"\n\n");
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.buf.len() >= self.max
    }

    /// Send buffered frames, then `frame` if given.
    async fn flush<S: FrameSink>(
        &mut self,
        sink: &mut S,
        frame: Option<Bytes>,
        stop: &Interrupt,
    ) -> Result<(), WriteStopped> {
        if !self.buf.is_empty() {
            let buffered = Bytes::from(std::mem::take(&mut self.buf));
            self.send(sink, buffered, stop).await?;
        }
        match frame {
            Some(frame) => self.send(sink, frame, stop).await,
            None => Ok(()),
        }
    }

    async fn send<S: FrameSink>(
        &mut self,
        sink: &mut S,
        frame: Bytes,
        stop: &Interrupt,
    ) -> Result<(), WriteStopped> {
        self.bytes += frame.len();
        self.writes += 1;
        tokio::select! {
            biased;
            _ = stop.cancel.cancelled() => Err(WriteStopped::Cancelled),
            _ = stop.expired() => Err(WriteStopped::TimedOut),
            written = sink.write(frame) => written.map_err(|_| WriteStopped::SinkClosed),
        }
    }

    /// Write `frame` only if the sink takes it without waiting.
    fn try_send<S: FrameSink>(&mut self, sink: &mut S, frame: Bytes) -> bool {
        self.bytes += frame.len();
        self.writes += 1;
        matches!(sink.write(frame).now_or_never(), Some(Ok(())))
    }
}

/// What ends a relay besides its source: cancellation and the deadline.
struct Interrupt {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Interrupt {
    fn expired(&self) -> impl Future<Output = ()> {
        let deadline = self.deadline;
        async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        }
    }

    fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// A sink write that did not finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteStopped {
    SinkClosed,
    Cancelled,
    TimedOut,
}

impl WriteStopped {
    fn as_str(self) -> &'static str {
        match self {
            WriteStopped::SinkClosed => "sink closed",
            WriteStopped::Cancelled => "cancelled",
            WriteStopped::TimedOut => "timed out",
        }
    }

    /// A closed sink cancels the stream so its owner sees why it ended.
    fn outcome(self, cancel: &CancellationToken) -> RelayOutcome {
        match self {
            WriteStopped::SinkClosed => {
                cancel.cancel();
                RelayOutcome::Cancelled
            }
            WriteStopped::Cancelled => RelayOutcome::Cancelled,
            WriteStopped::TimedOut => RelayOutcome::TimedOut,
        }
    }
}

fn error_frame(message: &str) -> Bytes {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": "stream_error",
        }
    });
    Bytes::from(format!("data: {}\n\n", body))
}

/// Relay `source` into `sink` until it ends, fails, times out or the
/// lease's stream is cancelled.
///
/// The lease is finished on every path, removing the stream and releasing
/// its admission slot; if this future is dropped instead, the lease's own
/// drop does the same.
pub async fn relay<S: FrameSink>(
    lease: StreamLease,
    mut source: ChunkStream,
    mut sink: S,
    config: RelayConfig,
    admitted_at: Instant,
) -> RelayReport {
    let started = Instant::now();
    let stop = Interrupt {
        cancel: lease.cancel_token().clone(),
        deadline: config.timeout.map(|t| started + t),
    };
    let cancel = &stop.cancel;

    let mut buffer = FrameBuffer::new(config.max_buffer_size);
    let mut chunks = 0usize;
    let mut first_token_latency = None;
    let mut usage = None;

    let outcome = loop {
        if cancel.is_cancelled() {
            break RelayOutcome::Cancelled;
        }
        if stop.is_expired() {
            break RelayOutcome::TimedOut;
        }

        let next = match source.next().now_or_never() {
            Some(item) => item,
            None => {
                // Nothing ready: send what we have before waiting.
                if let Err(stopped) = buffer.flush(&mut sink, None, &stop).await {
                    break stopped.outcome(cancel);
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break RelayOutcome::Cancelled,
                    _ = sink.closed() => break WriteStopped::SinkClosed.outcome(cancel),
                    _ = stop.expired() => break RelayOutcome::TimedOut,
                    item = source.next() => item,
                }
            }
        };

        match next {
            None => break RelayOutcome::Completed,
            Some(Err(e)) => break RelayOutcome::Failed(e.to_string()),
            Some(Ok(chunk)) => {
                chunks += 1;
                if first_token_latency.is_none() && chunk_has_content(&chunk) {
                    first_token_latency = Some(Instant::now().duration_since(admitted_at));
                }
                if let Some(u) = super::types::extract_usage(&chunk) {
                    usage = Some(u);
                }
                if let Err(e) = buffer.push_chunk(&chunk) {
                    break RelayOutcome::Failed(e.to_string());
                }
                if buffer.is_full() {
                    if let Err(stopped) = buffer.flush(&mut sink, None, &stop).await {
                        break stopped.outcome(cancel);
                    }
                    tokio::task::yield_now().await;
                }
            }
        }
    };

    let outcome = match outcome {
        RelayOutcome::Completed => {
            let done = Some(Bytes::from_static(DONE_FRAME));
            match buffer.flush(&mut sink, done, &stop).await {
                Ok(()) => RelayOutcome::Completed,
                Err(stopped) => stopped.outcome(cancel),
            }
        }
        RelayOutcome::Failed(message) => {
            tracing::warn!(
                provider = %lease.provider(),
                request_id = %lease.request_id(),
                error = %message,
                "Chunk source failed mid-stream"
            );
            let frame = Some(error_frame(&message));
            if let Err(stopped) = buffer.flush(&mut sink, frame, &stop).await {
                tracing::debug!(reason = stopped.as_str(), "Could not deliver error frame");
            }
            RelayOutcome::Failed(message)
        }
        other => other,
    };

    if outcome == RelayOutcome::TimedOut {
        tracing::warn!(
            provider = %lease.provider(),
            request_id = %lease.request_id(),
            "Stream exceeded its timeout"
        );
        if !buffer.try_send(&mut sink, error_frame("stream timed out")) {
            tracing::debug!("Could not deliver timeout frame");
        }
    }

    sink.close();
    // Dropping the source here stops the upstream before the slot is reused.
    drop(source);

    tracing::info!(
        provider = %lease.provider(),
        request_id = %lease.request_id(),
        stream_id = %lease.stream_id(),
        outcome = outcome.as_str(),
        chunks,
        bytes = buffer.bytes,
        "Stream finished"
    );
    lease.finish();

    RelayReport {
        outcome,
        chunks,
        bytes: buffer.bytes,
        writes: buffer.writes,
        first_token_latency,
        duration: Instant::now().duration_since(started),
        usage,
    }
}
