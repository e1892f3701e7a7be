//! Tests for `src/outbox/mod.rs` — the fan-out pipeline, the retry
//! path, quarantine, and the question fence.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use kindred::config::Config;
use kindred::context::Context;
use kindred::convo::{ConversationMode, TurnRequest};
use kindred::oracle::{Embedder, Generator, OracleError};
use kindred::store::relational::{MemoryStatus, OutboxStatus};

const DIM: usize = 8;

struct HashEmbedder;

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, OracleError> {
        let mut v = vec![0.0_f32; DIM];
        for ch in text.chars() {
            v[(ch as usize) % DIM] += 1.0;
        }
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        DIM
    }
}

/// Fails the first `failures` embed calls, then succeeds.
struct FlakyEmbedder {
    failures: AtomicU32,
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, OracleError> {
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(OracleError::Unavailable("embedder down".to_owned()));
        }
        HashEmbedder.embed(text).await
    }

    fn dimensions(&self) -> usize {
        DIM
    }
}

struct EmptyGenerator;

#[async_trait]
impl Generator for EmptyGenerator {
    async fn generate(&self, prompt: &str, _max_tokens: u32) -> Result<String, OracleError> {
        if prompt.starts_with("Extract durable facts") {
            return Ok(r#"{"entities": [], "relations": []}"#.to_owned());
        }
        if prompt.starts_with("List the people") {
            return Ok("[]".to_owned());
        }
        Ok("好的。".to_owned())
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.stores.database_path = ":memory:".to_owned();
    config.stores.max_connections = 1;
    config.stores.embedding_dim = DIM;
    config.outbox.max_retries = 2;
    config.outbox.backoff_base_ms = 0;
    config
}

async fn setup_with_embedder(embedder: Arc<dyn Embedder>) -> Context {
    Context::build_with_oracles(test_config(), embedder, Arc::new(EmptyGenerator))
        .await
        .expect("context should build")
}

fn request(text: &str) -> TurnRequest {
    TurnRequest {
        user_id: "u1".to_owned(),
        session_id: None,
        text: text.to_owned(),
        idempotency_key: None,
        mode: ConversationMode::Hybrid,
        memorize_only: false,
        eval_mode: false,
    }
}

/// Graph-only requests skip the query embedding, which keeps the
/// flaky-embedder failure budget deterministic.
fn graph_only_request(text: &str) -> TurnRequest {
    TurnRequest {
        mode: ConversationMode::GraphOnly,
        ..request(text)
    }
}

async fn sole_event_status(ctx: &Context) -> OutboxStatus {
    let row: (String,) = sqlx::query_as("SELECT status FROM outbox_events LIMIT 1")
        .fetch_one(ctx.relational.pool())
        .await
        .expect("event row should exist");
    OutboxStatus::parse(&row.0).expect("status should parse")
}

async fn sole_memory_status(ctx: &Context) -> MemoryStatus {
    let row: (String,) = sqlx::query_as("SELECT status FROM memories LIMIT 1")
        .fetch_one(ctx.relational.pool())
        .await
        .expect("memory row should exist");
    MemoryStatus::parse(&row.0).expect("status should parse")
}

#[tokio::test]
async fn drain_commits_memory_vector_and_graph() {
    let ctx = setup_with_embedder(Arc::new(HashEmbedder)).await;
    ctx.engine
        .process_turn(request("我和二丫去过沈阳旅游"))
        .await
        .expect("turn should succeed");

    let drained = ctx.drainer.drain_once().await;
    assert_eq!(drained, 1);

    assert_eq!(sole_memory_status(&ctx).await, MemoryStatus::Committed);
    assert_eq!(sole_event_status(&ctx).await, OutboxStatus::Done);
    assert_eq!(ctx.vector.count("u1").await.expect("count"), 1);
    assert!(
        ctx.graph.count_relations("u1").await.expect("count") >= 2,
        "the companion and the destination should both land in the graph"
    );

    let event: (Option<String>, Option<String>) = sqlx::query_as(
        "SELECT vector_written_at, graph_written_at FROM outbox_events LIMIT 1",
    )
    .fetch_one(ctx.relational.pool())
    .await
    .expect("event row should exist");
    assert!(event.0.is_some(), "vector write must be stamped");
    assert!(event.1.is_some(), "graph write must be stamped");
}

#[tokio::test]
async fn draining_twice_leaves_one_row_per_store() {
    let ctx = setup_with_embedder(Arc::new(HashEmbedder)).await;
    ctx.engine
        .process_turn(request("我喜欢茶"))
        .await
        .expect("turn should succeed");

    ctx.drainer.drain_once().await;
    // Rewind both rows to pending, as if the worker had crashed after
    // the store writes but before the status flip; the retry must
    // replay the whole pipeline onto the same keys.
    sqlx::query("UPDATE outbox_events SET status = 'pending', next_attempt_at = ?1")
        .bind(kindred::store::ts(Utc::now()))
        .execute(ctx.relational.pool())
        .await
        .expect("requeue should succeed");
    sqlx::query("UPDATE memories SET status = 'pending', committed_at = NULL")
        .execute(ctx.relational.pool())
        .await
        .expect("rewind should succeed");
    ctx.drainer.drain_once().await;

    assert_eq!(ctx.vector.count("u1").await.expect("count"), 1);
    let edges: (i64,) = sqlx::query_as(
        "SELECT count(*) FROM graph_relations WHERE user_id = 'u1' \
         AND source_id = 'user' AND kind = 'LIKES'",
    )
    .fetch_one(ctx.relational.pool())
    .await
    .expect("count should succeed");
    assert_eq!(edges.0, 1, "the graph merge must stay idempotent");
}

#[tokio::test]
async fn transient_failures_reschedule_then_dead_letter() {
    let embedder = Arc::new(FlakyEmbedder {
        failures: AtomicU32::new(10),
    });
    let ctx = setup_with_embedder(embedder).await;
    ctx.engine
        .process_turn(graph_only_request("我喜欢茶"))
        .await
        .expect("turn should succeed");

    ctx.drainer.drain_once().await;
    assert_eq!(sole_event_status(&ctx).await, OutboxStatus::Pending);
    let retry: (i64,) = sqlx::query_as("SELECT retry_count FROM outbox_events LIMIT 1")
        .fetch_one(ctx.relational.pool())
        .await
        .expect("row should exist");
    assert_eq!(retry.0, 1);

    ctx.drainer.drain_once().await;
    assert_eq!(
        sole_event_status(&ctx).await,
        OutboxStatus::Dlq,
        "retries exhausted at max_retries = 2"
    );
    assert_eq!(
        sole_memory_status(&ctx).await,
        MemoryStatus::Pending,
        "a dead-lettered memory is never falsely committed"
    );
}

#[tokio::test]
async fn recovery_after_transient_failure_commits() {
    let embedder = Arc::new(FlakyEmbedder {
        failures: AtomicU32::new(1),
    });
    let ctx = setup_with_embedder(embedder).await;
    ctx.engine
        .process_turn(graph_only_request("我喜欢茶"))
        .await
        .expect("turn should succeed");

    ctx.drainer.drain_once().await;
    assert_eq!(sole_event_status(&ctx).await, OutboxStatus::Pending);

    ctx.drainer.drain_once().await;
    assert_eq!(sole_event_status(&ctx).await, OutboxStatus::Done);
    assert_eq!(sole_memory_status(&ctx).await, MemoryStatus::Committed);
}

#[tokio::test]
async fn low_confidence_extractions_are_quarantined() {
    let ctx = setup_with_embedder(Arc::new(HashEmbedder)).await;
    ctx.engine
        .process_turn(request("可能昨天也许见过某人"))
        .await
        .expect("turn should succeed");

    ctx.drainer.drain_once().await;

    assert_eq!(sole_memory_status(&ctx).await, MemoryStatus::PendingReview);
    assert_eq!(sole_event_status(&ctx).await, OutboxStatus::PendingReview);
    assert_eq!(
        ctx.graph.count_relations("u1").await.expect("count"),
        0,
        "quarantined memories must not write the graph"
    );
}

#[tokio::test]
async fn a_question_event_commits_without_graph_writes() {
    let ctx = setup_with_embedder(Arc::new(HashEmbedder)).await;
    // The conversation core refuses to enqueue questions, so seed one
    // directly to exercise the drainer's second fence.
    let memory_id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO memories (id, user_id, content, status, created_at, metadata) \
         VALUES (?1, 'u1', '谁去沈阳旅游过', 'pending', ?2, '{}')",
    )
    .bind(memory_id.to_string())
    .bind(kindred::store::ts(now))
    .execute(ctx.relational.pool())
    .await
    .expect("memory insert should succeed");
    sqlx::query(
        "INSERT INTO outbox_events (id, event_id, memory_id, payload, status, created_at, next_attempt_at) \
         VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(format!("memory_created:{memory_id}"))
    .bind(memory_id.to_string())
    .bind(
        serde_json::json!({
            "memory_id": memory_id,
            "user_id": "u1",
            "content": "谁去沈阳旅游过",
        })
        .to_string(),
    )
    .bind(kindred::store::ts(now))
    .execute(ctx.relational.pool())
    .await
    .expect("event insert should succeed");

    ctx.drainer.drain_once().await;

    assert_eq!(sole_memory_status(&ctx).await, MemoryStatus::Committed);
    assert_eq!(ctx.graph.count_relations("u1").await.expect("count"), 0);
    assert_eq!(ctx.vector.count("u1").await.expect("count"), 1);

    let meta: (String,) = sqlx::query_as("SELECT metadata FROM memories LIMIT 1")
        .fetch_one(ctx.relational.pool())
        .await
        .expect("memory row should exist");
    assert!(meta.0.contains("graph_skipped"));
}

#[tokio::test]
async fn conflicting_memory_supersedes_the_older_one() {
    let ctx = setup_with_embedder(Arc::new(HashEmbedder)).await;

    // Day 0: the user likes tea; backdate it so the gap allows silent
    // supersession.
    ctx.engine
        .process_turn(request("我喜欢茶"))
        .await
        .expect("turn should succeed");
    ctx.drainer.drain_once().await;
    let two_days_ago = kindred::store::ts(Utc::now() - chrono::Duration::days(2));
    sqlx::query("UPDATE memories SET created_at = ?1")
        .bind(&two_days_ago)
        .execute(ctx.relational.pool())
        .await
        .expect("backdate should succeed");

    // Day 2: the opposite.
    ctx.engine
        .process_turn(request("我讨厌茶"))
        .await
        .expect("turn should succeed");
    ctx.drainer.drain_once().await;

    let old_status: (String,) = sqlx::query_as(
        "SELECT status FROM memories WHERE content = '我喜欢茶'",
    )
    .fetch_one(ctx.relational.pool())
    .await
    .expect("old memory should exist");
    assert_eq!(old_status.0, "deprecated");

    let record: (String, Option<String>) = sqlx::query_as(
        "SELECT resolution, superseded_by FROM conflict_records LIMIT 1",
    )
    .fetch_one(ctx.relational.pool())
    .await
    .expect("conflict record should exist");
    assert_eq!(record.0, "superseded_by_newer");
    assert!(record.1.is_some());
}
