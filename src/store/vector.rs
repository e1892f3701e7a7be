//! Vector store adapter: memory embeddings with cosine search.
//!
//! Embeddings are stored as little-endian `f32` blobs keyed by the
//! memory id, and similarity is ranked in-process. A native vector
//! index can replace the scan later without changing this interface;
//! the row format already matches what such an index would ingest.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{parse_ts, ts, StoreError};

/// A scored vector search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    /// Memory id of the matching row.
    pub memory_id: Uuid,
    /// Cosine similarity in `[-1, 1]`.
    pub cosine: f64,
    /// Stored content (saves a relational round-trip on the read path).
    pub content: String,
    /// Stored valence.
    pub valence: Option<f64>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// Narrow adapter over the `vector_rows` table.
#[derive(Debug, Clone)]
pub struct VectorStore {
    pool: SqlitePool,
    dimension: usize,
}

impl VectorStore {
    /// Wrap an open pool with a fixed embedding dimension.
    pub fn new(pool: SqlitePool, dimension: usize) -> Self {
        Self { pool, dimension }
    }

    /// The configured embedding dimension.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Upsert one row keyed by memory id.
    ///
    /// Re-running with the same key overwrites the same row, so the
    /// write is idempotent under drainer retries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DimensionMismatch`] for a wrong-sized
    /// embedding, or a database error.
    pub async fn upsert(
        &self,
        memory_id: Uuid,
        user_id: &str,
        embedding: &[f32],
        content: &str,
        valence: Option<f64>,
        created_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if embedding.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                got: embedding.len(),
                expected: self.dimension,
            });
        }
        sqlx::query(
            "INSERT INTO vector_rows (memory_id, user_id, embedding, content, valence, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(memory_id) DO UPDATE SET \
                 user_id = excluded.user_id, embedding = excluded.embedding, \
                 content = excluded.content, valence = excluded.valence",
        )
        .bind(memory_id.to_string())
        .bind(user_id)
        .bind(encode(embedding))
        .bind(content)
        .bind(valence)
        .bind(ts(created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cosine search over one user's rows.
    ///
    /// Rows with a stored dimension that does not match the query are
    /// skipped rather than failing the whole search.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub async fn search(
        &self,
        user_id: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorHit>, StoreError> {
        if query.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                got: query.len(),
                expected: self.dimension,
            });
        }

        let rows: Vec<(String, Vec<u8>, String, Option<f64>, String)> = sqlx::query_as(
            "SELECT memory_id, embedding, content, valence, created_at \
             FROM vector_rows WHERE user_id = ?1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for (memory_id, blob, content, valence, created_at) in rows {
            let stored = decode(&blob);
            if stored.len() != query.len() {
                continue;
            }
            let memory_id = Uuid::parse_str(&memory_id).map_err(|_| StoreError::InvalidEnum {
                field: "memory_id",
                value: memory_id.clone(),
            })?;
            hits.push(VectorHit {
                memory_id,
                cosine: cosine(query, &stored),
                content,
                valence,
                created_at: parse_ts(&created_at)?,
            });
        }

        hits.sort_by(|a, b| {
            b.cosine
                .partial_cmp(&a.cosine)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Delete one row (conflict supersession does not remove vectors;
    /// this exists for operator tooling and tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete(&self, memory_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM vector_rows WHERE memory_id = ?1")
            .bind(memory_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Number of rows stored for a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count(&self, user_id: &str) -> Result<u64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM vector_rows WHERE user_id = ?1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.cast_unsigned())
    }
}

/// Serialize an embedding as a little-endian `f32` blob.
fn encode(embedding: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(embedding.len().saturating_mul(4));
    for v in embedding {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Deserialize a little-endian `f32` blob. Trailing bytes that do not
/// form a full `f32` are ignored.
fn decode(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Cosine similarity between two equal-length vectors.
///
/// Returns `0.0` when either vector has zero norm.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = f64::from(*x);
        let y = f64::from(*y);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
