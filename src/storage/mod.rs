//! Request metrics persisted to SQLite.

pub mod metrics;

pub use metrics::{MetricsSink, NoopMetrics, RequestRecord, SqliteMetrics, StreamingRecord};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;

const MAX_CONNECTIONS: u32 = 4;

/// Open (creating if needed) the metrics database in WAL mode and apply
/// pending migrations.
pub async fn init_pool(db_path: impl AsRef<Path>) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await?;
    sqlx::migrate!().run(&pool).await?;
    Ok(pool)
}
