//! Metrics sink for admitted and rejected requests.

use sqlx::SqlitePool;

use crate::provider::Provider;
use crate::proxy::types::Usage;

/// One finished request, streamed or not.
///
/// All fields are owned types to satisfy `tokio::spawn` `'static` requirement.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub request_id: String,
    pub timestamp: String,
    pub provider: Provider,
    pub model: String,
    pub priority: i32,
    /// `success`, `rejected`, `upstream_error`, or a relay outcome.
    pub outcome: String,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub queue_wait_ms: u64,
    pub latency_ms: u64,
    pub usage: Option<Usage>,
}

/// A finished streamed request.
#[derive(Debug, Clone)]
pub struct StreamingRecord {
    pub request: RequestRecord,
    pub first_token_ms: Option<u64>,
    pub chunks: u64,
    pub bytes: u64,
}

/// Fire-and-forget observability hook. Implementations must never block
/// or fail the caller.
pub trait MetricsSink: Send + Sync {
    fn record_request(&self, record: RequestRecord);
    fn record_streaming_request(&self, record: StreamingRecord);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_request(&self, _record: RequestRecord) {}
    fn record_streaming_request(&self, _record: StreamingRecord) {}
}

/// Writes records to the `requests` table, one spawned task per record.
#[derive(Debug, Clone)]
pub struct SqliteMetrics {
    pool: SqlitePool,
}

impl SqliteMetrics {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a record. `stream` carries the streamed-only columns.
    pub async fn insert(
        &self,
        record: &RequestRecord,
        stream: Option<(Option<u64>, u64, u64)>,
    ) -> Result<(), sqlx::Error> {
        let (first_token_ms, chunks, bytes) = match stream {
            Some((first, chunks, bytes)) => (first, Some(chunks), Some(bytes)),
            None => (None, None, None),
        };
        sqlx::query(
            "INSERT INTO requests (
                request_id, timestamp, provider, model, priority,
                streaming, outcome, error_kind, error_message,
                queue_wait_ms, latency_ms, first_token_ms, chunks, bytes,
                input_tokens, output_tokens
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.request_id)
        .bind(&record.timestamp)
        .bind(record.provider.as_str())
        .bind(&record.model)
        .bind(record.priority)
        .bind(stream.is_some())
        .bind(&record.outcome)
        .bind(record.error_kind.as_deref())
        .bind(record.error_message.as_deref())
        .bind(record.queue_wait_ms as i64)
        .bind(record.latency_ms as i64)
        .bind(first_token_ms.map(|v| v as i64))
        .bind(chunks.map(|v| v as i64))
        .bind(bytes.map(|v| v as i64))
        .bind(record.usage.map(|u| u.prompt_tokens as i64))
        .bind(record.usage.map(|u| u.completion_tokens as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn spawn_insert(&self, record: RequestRecord, stream: Option<(Option<u64>, u64, u64)>) {
        let sink = self.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.insert(&record, stream).await {
                tracing::warn!(
                    request_id = %record.request_id,
                    error = %e,
                    "Failed to write request metrics to database"
                );
            }
        });
    }
}

impl MetricsSink for SqliteMetrics {
    fn record_request(&self, record: RequestRecord) {
        self.spawn_insert(record, None);
    }

    fn record_streaming_request(&self, record: StreamingRecord) {
        let stream = Some((record.first_token_ms, record.chunks, record.bytes));
        self.spawn_insert(record.request, stream);
    }
}
