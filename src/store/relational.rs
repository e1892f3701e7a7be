//! Relational store adapter: turns, memories, the outbox, idempotency
//! keys, affinity history, and conflict records.
//!
//! Write-path methods that must commit atomically with each other take
//! a generic [`SqliteExecutor`] so the conversation engine can thread a
//! single transaction through them. Single-statement operations (the
//! outbox claim, status flips) are bound to the pool directly; the
//! claim relies on SQLite's atomic conditional `UPDATE` to guarantee
//! at-most-one claimer per event.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteExecutor;
use sqlx::{SqlitePool, Transaction};
use tracing::trace;
use uuid::Uuid;

use super::{parse_ts, ts, StoreError};

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    /// Human user message.
    User,
    /// Assistant reply.
    Assistant,
}

impl TurnRole {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised role.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(StoreError::InvalidEnum {
                field: "role",
                value: other.to_owned(),
            }),
        }
    }
}

/// Lifecycle status of a memory in the cross-store fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    /// Written by the conversation core, not yet fanned out.
    Pending,
    /// Fan-out completed; vector and graph writes are durable.
    Committed,
    /// Superseded by a newer conflicting memory.
    Deprecated,
    /// Marked for deletion (hard deletion is out of scope).
    Deleted,
    /// Held back: extraction confidence was too low.
    PendingReview,
}

impl MemoryStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::Deprecated => "deprecated",
            Self::Deleted => "deleted",
            Self::PendingReview => "pending_review",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "committed" => Ok(Self::Committed),
            "deprecated" => Ok(Self::Deprecated),
            "deleted" => Ok(Self::Deleted),
            "pending_review" => Ok(Self::PendingReview),
            other => Err(StoreError::InvalidEnum {
                field: "memory_status",
                value: other.to_owned(),
            }),
        }
    }
}

/// Processing status of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting for a drainer worker.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Fan-out completed.
    Done,
    /// Terminal failure (legacy value, kept for operators).
    Failed,
    /// Dead-lettered after exhausting retries or a permanent error.
    Dlq,
    /// Held for review alongside its memory.
    PendingReview,
}

impl OutboxStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Dlq => "dlq",
            Self::PendingReview => "pending_review",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "dlq" => Ok(Self::Dlq),
            "pending_review" => Ok(Self::PendingReview),
            other => Err(StoreError::InvalidEnum {
                field: "outbox_status",
                value: other.to_owned(),
            }),
        }
    }
}

/// How a detected conflict between two memories was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Awaiting clarification from the user.
    Unresolved,
    /// The older memory was deprecated in favor of the newer one.
    SupersededByNewer,
    /// The user answered a clarification prompt.
    UserClarified,
}

impl ConflictResolution {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::SupersededByNewer => "superseded_by_newer",
            Self::UserClarified => "user_clarified",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised resolution.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "unresolved" => Ok(Self::Unresolved),
            "superseded_by_newer" => Ok(Self::SupersededByNewer),
            "user_clarified" => Ok(Self::UserClarified),
            other => Err(StoreError::InvalidEnum {
                field: "resolution",
                value: other.to_owned(),
            }),
        }
    }
}

/// One immutable conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRecord {
    /// Turn id.
    pub id: Uuid,
    /// Session the turn belongs to.
    pub session_id: Uuid,
    /// Owning user.
    pub user_id: String,
    /// Author role.
    pub role: TurnRole,
    /// Message text.
    pub content: String,
    /// Optional primary emotion label computed at intake.
    pub emotion_tag: Option<String>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

/// A durable fact candidate distilled from a user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Memory id — also the vector store primary key.
    pub id: Uuid,
    /// Owning user.
    pub user_id: String,
    /// Verbatim or normalized text.
    pub content: String,
    /// Emotional valence in `[-1, 1]`.
    pub valence: Option<f64>,
    /// Lifecycle status.
    pub status: MemoryStatus,
    /// Session the memory was distilled from.
    pub conversation_id: Option<Uuid>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Set when the drainer commits the fan-out.
    pub committed_at: Option<DateTime<Utc>>,
    /// Free-form metadata (e.g. `graph_skipped`).
    pub metadata: serde_json::Value,
}

/// A durable work item for the asynchronous fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEventRecord {
    /// Row id.
    pub id: Uuid,
    /// Globally unique short key, `memory_created:<memory_id>`.
    pub event_id: String,
    /// Memory this event fans out.
    pub memory_id: Option<Uuid>,
    /// JSON payload (see the outbox module for the typed form).
    pub payload: serde_json::Value,
    /// Processing status.
    pub status: OutboxStatus,
    /// Transient-failure retry count so far.
    pub retry_count: i64,
    /// Idempotency key of the originating request, if any.
    pub idempotency_key: Option<String>,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Earliest time a worker may claim this event (backoff schedule).
    pub next_attempt_at: DateTime<Utc>,
    /// Set when a worker claims the event.
    pub processing_started_at: Option<DateTime<Utc>>,
    /// Set once the vector upsert is durable.
    pub vector_written_at: Option<DateTime<Utc>>,
    /// Set once the graph merge is durable (or principled-skipped).
    pub graph_written_at: Option<DateTime<Utc>>,
    /// Set when the event reaches a terminal status.
    pub processed_at: Option<DateTime<Utc>>,
    /// Last failure message, for operators.
    pub error_message: Option<String>,
}

/// A detected contradiction between two memories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Row id.
    pub id: Uuid,
    /// Owning user.
    pub user_id: String,
    /// First memory (detection order).
    pub memory_id_1: Uuid,
    /// Second memory.
    pub memory_id_2: Uuid,
    /// Shared topic the two memories disagree on.
    pub topic: String,
    /// The opposite pair that triggered detection, e.g. `喜欢/讨厌`.
    pub opposite_pair: String,
    /// Detection confidence in `[0, 1]`.
    pub confidence: f64,
    /// Resolution state.
    pub resolution: ConflictResolution,
    /// The surviving memory, when resolved by supersession.
    pub superseded_by: Option<Uuid>,
    /// Detection time.
    pub detected_at: DateTime<Utc>,
    /// Resolution time.
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Latest affinity reading for a user.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffinityReading {
    /// Current score in `[0, 1]`.
    pub score: f64,
    /// Delta applied by the most recent update.
    pub delta: f64,
}

/// A cached idempotent response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotentHit {
    /// Turn created by the first request.
    pub turn_id: Option<Uuid>,
    /// The stored reply, returned byte-identical.
    pub response: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Narrow adapter over the relational tables.
#[derive(Debug, Clone)]
pub struct RelationalStore {
    pool: SqlitePool,
}

type MemoryRow = (
    String,
    String,
    String,
    Option<f64>,
    String,
    Option<String>,
    String,
    Option<String>,
    String,
);

type OutboxRow = (
    String,
    String,
    Option<String>,
    String,
    String,
    i64,
    Option<String>,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn parse_uuid(field: &'static str, value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|_| StoreError::InvalidEnum {
        field,
        value: value.to_owned(),
    })
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.as_deref().map(parse_ts).transpose()
}

fn row_to_memory(row: MemoryRow) -> Result<MemoryRecord, StoreError> {
    let (id, user_id, content, valence, status, conversation_id, created_at, committed_at, meta) =
        row;
    Ok(MemoryRecord {
        id: parse_uuid("memory_id", &id)?,
        user_id,
        content,
        valence,
        status: MemoryStatus::parse(&status)?,
        conversation_id: conversation_id
            .as_deref()
            .map(|s| parse_uuid("conversation_id", s))
            .transpose()?,
        created_at: parse_ts(&created_at)?,
        committed_at: parse_opt_ts(committed_at)?,
        metadata: serde_json::from_str(&meta).map_err(|source| StoreError::CorruptJson {
            column: "metadata",
            source,
        })?,
    })
}

fn row_to_event(row: OutboxRow) -> Result<OutboxEventRecord, StoreError> {
    let (
        id,
        event_id,
        memory_id,
        payload,
        status,
        retry_count,
        idempotency_key,
        created_at,
        next_attempt_at,
        processing_started_at,
        vector_written_at,
        graph_written_at,
        processed_at,
        error_message,
    ) = row;
    Ok(OutboxEventRecord {
        id: parse_uuid("outbox_id", &id)?,
        event_id,
        memory_id: memory_id
            .as_deref()
            .map(|s| parse_uuid("memory_id", s))
            .transpose()?,
        payload: serde_json::from_str(&payload).map_err(|source| StoreError::CorruptJson {
            column: "payload",
            source,
        })?,
        status: OutboxStatus::parse(&status)?,
        retry_count,
        idempotency_key,
        created_at: parse_ts(&created_at)?,
        next_attempt_at: parse_ts(&next_attempt_at)?,
        processing_started_at: parse_opt_ts(processing_started_at)?,
        vector_written_at: parse_opt_ts(vector_written_at)?,
        graph_written_at: parse_opt_ts(graph_written_at)?,
        processed_at: parse_opt_ts(processed_at)?,
        error_message,
    })
}

impl RelationalStore {
    /// Wrap an open pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool (for tests and maintenance).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction for the conversation write path.
    ///
    /// # Errors
    ///
    /// Returns an error if a connection cannot be acquired.
    pub async fn begin(&self) -> Result<Transaction<'_, sqlx::Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    /// Create the session row if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn ensure_session<'e, E>(
        &self,
        exec: E,
        session_id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query("INSERT OR IGNORE INTO sessions (id, user_id, started_at) VALUES (?1, ?2, ?3)")
            .bind(session_id.to_string())
            .bind(user_id)
            .bind(ts(now))
            .execute(exec)
            .await?;
        Ok(())
    }

    /// Insert an immutable turn row.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_turn<'e, E>(&self, exec: E, turn: &TurnRecord) -> Result<(), StoreError>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query(
            "INSERT INTO turns (id, session_id, user_id, role, content, emotion_tag, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(turn.id.to_string())
        .bind(turn.session_id.to_string())
        .bind(&turn.user_id)
        .bind(turn.role.as_str())
        .bind(&turn.content)
        .bind(&turn.emotion_tag)
        .bind(ts(turn.created_at))
        .execute(exec)
        .await?;
        trace!(turn = %turn.id, role = turn.role.as_str(), "turn inserted");
        Ok(())
    }

    /// Insert a new pending memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_memory<'e, E>(
        &self,
        exec: E,
        memory: &MemoryRecord,
    ) -> Result<(), StoreError>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query(
            "INSERT INTO memories \
             (id, user_id, content, valence, status, conversation_id, created_at, committed_at, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(memory.id.to_string())
        .bind(&memory.user_id)
        .bind(&memory.content)
        .bind(memory.valence)
        .bind(memory.status.as_str())
        .bind(memory.conversation_id.map(|id| id.to_string()))
        .bind(ts(memory.created_at))
        .bind(memory.committed_at.map(ts))
        .bind(memory.metadata.to_string())
        .execute(exec)
        .await?;
        Ok(())
    }

    /// Enqueue an outbox event.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails (including a duplicate
    /// `event_id`, which callers must treat as already-enqueued).
    pub async fn insert_outbox<'e, E>(
        &self,
        exec: E,
        event: &OutboxEventRecord,
    ) -> Result<(), StoreError>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query(
            "INSERT INTO outbox_events \
             (id, event_id, memory_id, payload, status, retry_count, idempotency_key, \
              created_at, next_attempt_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(event.id.to_string())
        .bind(&event.event_id)
        .bind(event.memory_id.map(|id| id.to_string()))
        .bind(event.payload.to_string())
        .bind(event.status.as_str())
        .bind(event.retry_count)
        .bind(&event.idempotency_key)
        .bind(ts(event.created_at))
        .bind(ts(event.next_attempt_at))
        .execute(exec)
        .await?;
        Ok(())
    }

    /// Fetch one memory by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row is corrupt.
    pub async fn get_memory(&self, id: Uuid) -> Result<Option<MemoryRecord>, StoreError> {
        let row: Option<MemoryRow> = sqlx::query_as(
            "SELECT id, user_id, content, valence, status, conversation_id, \
                    created_at, committed_at, metadata \
             FROM memories WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_memory).transpose()
    }

    /// Fetch memories by id set, preserving no particular order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub async fn get_memories(
        &self,
        user_id: &str,
        ids: &[Uuid],
    ) -> Result<Vec<MemoryRecord>, StoreError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let row: Option<MemoryRow> = sqlx::query_as(
                "SELECT id, user_id, content, valence, status, conversation_id, \
                        created_at, committed_at, metadata \
                 FROM memories WHERE id = ?1 AND user_id = ?2",
            )
            .bind(id.to_string())
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                out.push(row_to_memory(row)?);
            }
        }
        Ok(out)
    }

    /// List a user's most recent memories with the given status.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub async fn recent_memories(
        &self,
        user_id: &str,
        status: MemoryStatus,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<MemoryRow> = sqlx::query_as(
            "SELECT id, user_id, content, valence, status, conversation_id, \
                    created_at, committed_at, metadata \
             FROM memories \
             WHERE user_id = ?1 AND status = ?2 \
             ORDER BY created_at DESC LIMIT ?3",
        )
        .bind(user_id)
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_memory).collect()
    }

    /// Update a memory's status; sets `committed_at` when committing.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn update_memory_status<'e, E>(
        &self,
        exec: E,
        id: Uuid,
        status: MemoryStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>
    where
        E: SqliteExecutor<'e>,
    {
        let committed_at = (status == MemoryStatus::Committed).then(|| ts(now));
        sqlx::query(
            "UPDATE memories SET status = ?1, committed_at = COALESCE(?2, committed_at) \
             WHERE id = ?3",
        )
        .bind(status.as_str())
        .bind(committed_at)
        .bind(id.to_string())
        .execute(exec)
        .await?;
        Ok(())
    }

    /// Merge keys into a memory's metadata map.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or the write fails.
    pub async fn merge_memory_metadata(
        &self,
        id: Uuid,
        patch: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let Some(memory) = self.get_memory(id).await? else {
            return Ok(());
        };
        let mut meta = memory.metadata;
        if let (Some(obj), Some(patch_obj)) = (meta.as_object_mut(), patch.as_object()) {
            for (k, v) in patch_obj {
                obj.insert(k.clone(), v.clone());
            }
        }
        sqlx::query("UPDATE memories SET metadata = ?1 WHERE id = ?2")
            .bind(meta.to_string())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- outbox ------------------------------------------------------------

    /// Claim up to `limit` due pending events.
    ///
    /// Each candidate is claimed with a conditional
    /// `UPDATE … WHERE status = 'pending'`; a row whose update reports
    /// zero affected rows was taken by another worker and is skipped,
    /// so at most one worker ever holds an event.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails.
    pub async fn claim_outbox(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEventRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let candidates: Vec<(String,)> = sqlx::query_as(
            "SELECT event_id FROM outbox_events \
             WHERE status = 'pending' AND next_attempt_at <= ?1 \
             ORDER BY created_at ASC LIMIT ?2",
        )
        .bind(ts(now))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::new();
        for (event_id,) in candidates {
            let res = sqlx::query(
                "UPDATE outbox_events \
                 SET status = 'processing', processing_started_at = ?1 \
                 WHERE event_id = ?2 AND status = 'pending'",
            )
            .bind(ts(now))
            .bind(&event_id)
            .execute(&self.pool)
            .await?;
            if res.rows_affected() == 0 {
                continue;
            }
            if let Some(event) = self.get_outbox_event(&event_id).await? {
                claimed.push(event);
            }
        }
        Ok(claimed)
    }

    /// Claim one specific pending event (the inline-drain path).
    ///
    /// Returns `None` when the event is absent or already claimed by a
    /// background worker.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails.
    pub async fn claim_event(
        &self,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OutboxEventRecord>, StoreError> {
        let res = sqlx::query(
            "UPDATE outbox_events \
             SET status = 'processing', processing_started_at = ?1 \
             WHERE event_id = ?2 AND status = 'pending'",
        )
        .bind(ts(now))
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_outbox_event(event_id).await
    }

    /// Fetch one outbox event by its `event_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row is corrupt.
    pub async fn get_outbox_event(
        &self,
        event_id: &str,
    ) -> Result<Option<OutboxEventRecord>, StoreError> {
        let row: Option<OutboxRow> = sqlx::query_as(
            "SELECT id, event_id, memory_id, payload, status, retry_count, idempotency_key, \
                    created_at, next_attempt_at, processing_started_at, vector_written_at, \
                    graph_written_at, processed_at, error_message \
             FROM outbox_events WHERE event_id = ?1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_event).transpose()
    }

    /// Stamp the vector-write timestamp on an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn mark_vector_written(
        &self,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE outbox_events SET vector_written_at = ?1 WHERE event_id = ?2")
            .bind(ts(now))
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Stamp the graph-write timestamp on an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn mark_graph_written(
        &self,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE outbox_events SET graph_written_at = ?1 WHERE event_id = ?2")
            .bind(ts(now))
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flip memory `committed` and event `done` in one transaction.
    ///
    /// This is the final step of a successful fan-out; both stores have
    /// already accepted their idempotent writes when this runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub async fn commit_fanout(
        &self,
        event_id: &str,
        memory_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE memories SET status = 'committed', committed_at = ?1 WHERE id = ?2",
        )
        .bind(ts(now))
        .bind(memory_id.to_string())
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE outbox_events SET status = 'done', processed_at = ?1, error_message = NULL \
             WHERE event_id = ?2",
        )
        .bind(ts(now))
        .bind(event_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        trace!(event_id, memory = %memory_id, "fan-out committed");
        Ok(())
    }

    /// Hold both the event and its memory for review (low confidence).
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub async fn quarantine_fanout(
        &self,
        event_id: &str,
        memory_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE memories SET status = 'pending_review' WHERE id = ?1")
            .bind(memory_id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE outbox_events \
             SET status = 'pending_review', processed_at = ?1, error_message = ?2 \
             WHERE event_id = ?3",
        )
        .bind(ts(now))
        .bind(reason)
        .bind(event_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Mark an event done without any fan-out (e.g. memory missing).
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn skip_outbox(
        &self,
        event_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbox_events \
             SET status = 'done', processed_at = ?1, error_message = ?2 \
             WHERE event_id = ?3",
        )
        .bind(ts(now))
        .bind(reason)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reschedule a transiently-failed event for a later attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn reschedule_outbox(
        &self,
        event_id: &str,
        retry_count: i64,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbox_events \
             SET status = 'pending', retry_count = ?1, next_attempt_at = ?2, \
                 error_message = ?3, processing_started_at = NULL \
             WHERE event_id = ?4",
        )
        .bind(retry_count)
        .bind(ts(next_attempt_at))
        .bind(error)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move an event to the dead-letter queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn dead_letter_outbox(
        &self,
        event_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbox_events \
             SET status = 'dlq', processed_at = ?1, error_message = ?2 \
             WHERE event_id = ?3",
        )
        .bind(ts(now))
        .bind(reason)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Requeue events stuck in `processing` longer than `timeout`.
    ///
    /// Returns the number of requeued rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn requeue_stuck(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let cutoff = now.checked_sub_signed(timeout).unwrap_or(now);
        let res = sqlx::query(
            "UPDATE outbox_events \
             SET status = 'pending', processing_started_at = NULL, next_attempt_at = ?1 \
             WHERE status = 'processing' AND processing_started_at < ?2",
        )
        .bind(ts(now))
        .bind(ts(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    // -- idempotency -------------------------------------------------------

    /// Store the response for an idempotency key; first write wins.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_idempotency<'e, E>(
        &self,
        exec: E,
        user_id: &str,
        key: &str,
        turn_id: Option<Uuid>,
        response: &serde_json::Value,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), StoreError>
    where
        E: SqliteExecutor<'e>,
    {
        let expires_at = now.checked_add_signed(ttl).unwrap_or(now);
        sqlx::query(
            "INSERT OR IGNORE INTO idempotency_keys \
             (user_id, key, turn_id, response, created_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(user_id)
        .bind(key)
        .bind(turn_id.map(|id| id.to_string()))
        .bind(response.to_string())
        .bind(ts(now))
        .bind(ts(expires_at))
        .execute(exec)
        .await?;
        Ok(())
    }

    /// Look up a live idempotency key for a user.
    ///
    /// Expired keys are treated as absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row is corrupt.
    pub async fn get_idempotency(
        &self,
        user_id: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotentHit>, StoreError> {
        let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT turn_id, response FROM idempotency_keys \
             WHERE user_id = ?1 AND key = ?2 AND expires_at > ?3",
        )
        .bind(user_id)
        .bind(key)
        .bind(ts(now))
        .fetch_optional(&self.pool)
        .await?;
        let Some((turn_id, response)) = row else {
            return Ok(None);
        };
        let Some(response) = response else {
            return Ok(None);
        };
        Ok(Some(IdempotentHit {
            turn_id: turn_id
                .as_deref()
                .map(|s| parse_uuid("turn_id", s))
                .transpose()?,
            response: serde_json::from_str(&response).map_err(|source| {
                StoreError::CorruptJson {
                    column: "response",
                    source,
                }
            })?,
        }))
    }

    /// Delete expired idempotency keys; returns the count removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn cleanup_idempotency(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= ?1")
            .bind(ts(now))
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    // -- affinity ----------------------------------------------------------

    /// Latest affinity reading for a user, if any update ever ran.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_last_affinity(
        &self,
        user_id: &str,
    ) -> Result<Option<AffinityReading>, StoreError> {
        let row: Option<(f64, f64)> = sqlx::query_as(
            "SELECT new_score, delta FROM affinity_history \
             WHERE user_id = ?1 ORDER BY id DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(score, delta)| AffinityReading { score, delta }))
    }

    /// Append an affinity history row.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_affinity_row<'e, E>(
        &self,
        exec: E,
        user_id: &str,
        old_score: f64,
        new_score: f64,
        delta: f64,
        trigger_event: &str,
        signals: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query(
            "INSERT INTO affinity_history \
             (user_id, old_score, new_score, delta, trigger_event, signals, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(user_id)
        .bind(old_score)
        .bind(new_score)
        .bind(delta)
        .bind(trigger_event)
        .bind(signals.to_string())
        .bind(ts(now))
        .execute(exec)
        .await?;
        Ok(())
    }

    // -- conflicts ---------------------------------------------------------

    /// Persist a conflict record.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_conflict(&self, record: &ConflictRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO conflict_records \
             (id, user_id, memory_id_1, memory_id_2, topic, opposite_pair, confidence, \
              resolution, superseded_by, detected_at, resolved_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(record.id.to_string())
        .bind(&record.user_id)
        .bind(record.memory_id_1.to_string())
        .bind(record.memory_id_2.to_string())
        .bind(&record.topic)
        .bind(&record.opposite_pair)
        .bind(record.confidence)
        .bind(record.resolution.as_str())
        .bind(record.superseded_by.map(|id| id.to_string()))
        .bind(ts(record.detected_at))
        .bind(record.resolved_at.map(ts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// List a user's unresolved conflicts, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub async fn unresolved_conflicts(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ConflictRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<(
            String,
            String,
            String,
            String,
            String,
            String,
            f64,
            String,
            Option<String>,
            String,
            Option<String>,
        )> = sqlx::query_as(
            "SELECT id, user_id, memory_id_1, memory_id_2, topic, opposite_pair, confidence, \
                    resolution, superseded_by, detected_at, resolved_at \
             FROM conflict_records \
             WHERE user_id = ?1 AND resolution = 'unresolved' \
             ORDER BY detected_at DESC LIMIT ?2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ConflictRecord {
                    id: parse_uuid("conflict_id", &row.0)?,
                    user_id: row.1,
                    memory_id_1: parse_uuid("memory_id_1", &row.2)?,
                    memory_id_2: parse_uuid("memory_id_2", &row.3)?,
                    topic: row.4,
                    opposite_pair: row.5,
                    confidence: row.6,
                    resolution: ConflictResolution::parse(&row.7)?,
                    superseded_by: row
                        .8
                        .as_deref()
                        .map(|s| parse_uuid("superseded_by", s))
                        .transpose()?,
                    detected_at: parse_ts(&row.9)?,
                    resolved_at: parse_opt_ts(row.10)?,
                })
            })
            .collect()
    }

    // -- turns -------------------------------------------------------------

    /// Most recent turns in a session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub async fn recent_turns(
        &self,
        session_id: Uuid,
        limit: usize,
    ) -> Result<Vec<TurnRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<(String, String, String, String, String, Option<String>, String)> =
            sqlx::query_as(
                "SELECT id, session_id, user_id, role, content, emotion_tag, created_at \
                 FROM turns WHERE session_id = ?1 \
                 ORDER BY created_at DESC LIMIT ?2",
            )
            .bind(session_id.to_string())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut turns: Vec<TurnRecord> = rows
            .into_iter()
            .map(|row| {
                Ok(TurnRecord {
                    id: parse_uuid("turn_id", &row.0)?,
                    session_id: parse_uuid("session_id", &row.1)?,
                    user_id: row.2,
                    role: TurnRole::parse(&row.3)?,
                    content: row.4,
                    emotion_tag: row.5,
                    created_at: parse_ts(&row.6)?,
                })
            })
            .collect::<Result<_, StoreError>>()?;
        turns.reverse();
        Ok(turns)
    }

    /// When the user last sent a turn, across all sessions.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn last_turn_at(
        &self,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT created_at FROM turns \
             WHERE user_id = ?1 AND role = 'user' \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(at,)| parse_ts(&at)).transpose()
    }

    /// Count turns for a user (test and dashboard helper).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count_turns(&self, user_id: &str) -> Result<u64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM turns WHERE user_id = ?1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.cast_unsigned())
    }
}
