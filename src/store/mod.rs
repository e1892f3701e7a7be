//! Store adapters for the three persistence backends.
//!
//! All three adapters are narrow wrappers over SQLite via `sqlx`:
//!
//! - [`relational::RelationalStore`] — turns, memories, the outbox,
//!   idempotency keys, affinity history, and conflict records.
//! - [`vector::VectorStore`] — memory embeddings with cosine search.
//! - [`graph::GraphStore`] — typed entities and decaying weighted edges.
//!
//! They share one pool (and therefore one transaction domain for the
//! relational tables), but each adapter only touches its own tables, so
//! any of them could be re-pointed at a dedicated backend without
//! changing callers.

pub mod graph;
pub mod relational;
pub mod vector;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An invalid enum value was read from the database.
    #[error("invalid {field} value: {value:?}")]
    InvalidEnum {
        /// Which column contained the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },

    /// A stored JSON column failed to parse.
    #[error("corrupt {column} json: {source}")]
    CorruptJson {
        /// Which column contained the bad JSON.
        column: &'static str,
        /// Parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// An embedding blob did not match the configured dimension.
    #[error("embedding dimension mismatch: got {got}, expected {expected}")]
    DimensionMismatch {
        /// Actual element count.
        got: usize,
        /// Configured dimension.
        expected: usize,
    },
}

/// Format a timestamp the way every table stores it.
///
/// RFC 3339 UTC with microsecond precision and a trailing `Z`. The
/// fixed width makes lexicographic `TEXT` comparison chronological,
/// which the outbox claim query relies on.
pub fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp back into a [`DateTime<Utc>`].
///
/// # Errors
///
/// Returns [`StoreError::InvalidEnum`] with field `timestamp` if the
/// value is not valid RFC 3339.
pub fn parse_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidEnum {
            field: "timestamp",
            value: value.to_owned(),
        })
}

/// Open a SQLite pool and apply the schema.
///
/// `path` may be `:memory:` for tests. Foreign keys are not enforced;
/// cross-table integrity is the adapters' responsibility.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or the schema
/// fails to apply.
pub async fn open_pool(path: &str, max_connections: u32) -> Result<SqlitePool, StoreError> {
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(opts)
        .await?;

    let schema = include_str!("../../migrations/001_schema.sql");
    sqlx::raw_sql(schema).execute(&pool).await?;

    Ok(pool)
}
