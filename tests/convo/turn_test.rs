//! Tests for `src/convo/mod.rs` — the turn pipeline, the question
//! gate, and idempotent retries.

use std::sync::Arc;

use async_trait::async_trait;

use kindred::config::Config;
use kindred::context::Context;
use kindred::convo::{ConversationMode, TurnRequest};
use kindred::error::ErrorCode;
use kindred::oracle::{Embedder, Generator, OracleError};

const DIM: usize = 8;

pub struct HashEmbedder;

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

/// Answers extraction prompts with an empty IR, entity prompts with an
/// empty list, and everything else with a canned reply.
pub struct ScriptedGenerator {
    pub reply: String,
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, prompt: &str, _max_tokens: u32) -> Result<String, OracleError> {
        if prompt.starts_with("Extract durable facts") {
            return Ok(r#"{"entities": [], "relations": []}"#.to_owned());
        }
        if prompt.starts_with("List the people") {
            return Ok("[]".to_owned());
        }
        Ok(self.reply.clone())
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.stores.database_path = ":memory:".to_owned();
    config.stores.max_connections = 1;
    config.stores.embedding_dim = DIM;
    config
}

pub async fn setup(reply: &str) -> Context {
    Context::build_with_oracles(
        test_config(),
        Arc::new(HashEmbedder),
        Arc::new(ScriptedGenerator {
            reply: reply.to_owned(),
        }),
    )
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

async fn count(ctx: &Context, sql: &str) -> i64 {
    let row: (i64,) = sqlx::query_as(sql)
        .fetch_one(ctx.relational.pool())
        .await
        .expect("count query should succeed");
    row.0
}

#[tokio::test]
async fn a_statement_records_turns_memory_and_event() {
    let ctx = setup("听起来很开心！").await;
    let reply = ctx
        .engine
        .process_turn(request("我和二丫去过沈阳旅游"))
        .await
        .expect("turn should succeed");

    assert_eq!(reply.reply, "听起来很开心！");
    assert_eq!(reply.memory_status, "pending");
    assert_eq!(count(&ctx, "SELECT count(*) FROM turns").await, 2);
    assert_eq!(count(&ctx, "SELECT count(*) FROM memories").await, 1);
    assert_eq!(count(&ctx, "SELECT count(*) FROM outbox_events").await, 1);
    assert_eq!(count(&ctx, "SELECT count(*) FROM affinity_history").await, 1);
}

#[tokio::test]
async fn a_question_only_reads() {
    let ctx = setup("你和二丫一起去过沈阳。").await;
    ctx.engine
        .process_turn(request("谁去沈阳旅游过"))
        .await
        .expect("turn should succeed");

    assert_eq!(count(&ctx, "SELECT count(*) FROM turns").await, 2);
    assert_eq!(
        count(&ctx, "SELECT count(*) FROM memories").await,
        0,
        "questions never create memories"
    );
    assert_eq!(
        count(&ctx, "SELECT count(*) FROM outbox_events").await,
        0,
        "questions never enqueue outbox events"
    );
}

#[tokio::test]
async fn greetings_answer_from_templates_without_memory_writes() {
    let ctx = setup("unreachable").await;
    let reply = ctx
        .engine
        .process_turn(request("你好"))
        .await
        .expect("turn should succeed");

    assert_ne!(reply.reply, "unreachable", "the oracle must not be called");
    assert!(!reply.reply.is_empty());
    assert!(reply.context_source.expect("context source").cached);
    assert_eq!(count(&ctx, "SELECT count(*) FROM turns").await, 2);
    assert_eq!(count(&ctx, "SELECT count(*) FROM memories").await, 0);
    assert_eq!(count(&ctx, "SELECT count(*) FROM outbox_events").await, 0);
}

#[tokio::test]
async fn idempotent_retry_returns_the_cached_reply() {
    let ctx = setup("你好呀！").await;
    let mut first_request = request("你好");
    first_request.idempotency_key = Some("key-1".to_owned());

    let first = ctx
        .engine
        .process_turn(first_request.clone())
        .await
        .expect("first turn should succeed");
    let second = ctx
        .engine
        .process_turn(first_request)
        .await
        .expect("retry should succeed");

    assert_eq!(first, second, "the cached reply is returned byte-identical");
    assert_eq!(
        count(&ctx, "SELECT count(*) FROM turns").await,
        2,
        "the retry must not create new turns"
    );
    assert_eq!(count(&ctx, "SELECT count(*) FROM vector_rows").await, 0);
}

#[tokio::test]
async fn statement_idempotent_retry_creates_one_fanout() {
    let ctx = setup("记住啦。").await;
    let mut req = request("我喜欢茶");
    req.idempotency_key = Some("key-2".to_owned());

    ctx.engine
        .process_turn(req.clone())
        .await
        .expect("first turn should succeed");
    ctx.engine
        .process_turn(req)
        .await
        .expect("retry should succeed");

    assert_eq!(count(&ctx, "SELECT count(*) FROM memories").await, 1);
    assert_eq!(count(&ctx, "SELECT count(*) FROM outbox_events").await, 1);
}

#[tokio::test]
async fn memorize_only_skips_the_reply_path() {
    let ctx = setup("unreachable").await;
    let mut req = request("我喜欢茶");
    req.memorize_only = true;

    let reply = ctx
        .engine
        .process_turn(req)
        .await
        .expect("turn should succeed");

    assert_ne!(reply.reply, "unreachable");
    assert_eq!(count(&ctx, "SELECT count(*) FROM memories").await, 1);
    assert_eq!(
        count(&ctx, "SELECT count(*) FROM turns").await,
        1,
        "memorize-only records the user turn but no assistant turn"
    );
}

#[tokio::test]
async fn empty_text_is_rejected_without_side_effects() {
    let ctx = setup("unreachable").await;
    let err = ctx
        .engine
        .process_turn(request("   "))
        .await
        .expect_err("empty text must be rejected");

    assert_eq!(err.code, ErrorCode::InvalidInput);
    assert_eq!(count(&ctx, "SELECT count(*) FROM turns").await, 0);
}

#[tokio::test]
async fn affinity_moves_within_bounds_each_turn() {
    let ctx = setup("嗯嗯！").await;
    let reply = ctx
        .engine
        .process_turn(request("今天超级开心，我喜欢这种感觉"))
        .await
        .expect("turn should succeed");

    assert!(reply.affinity.score >= 0.0 && reply.affinity.score <= 1.0);
    assert!(reply.affinity.delta.abs() <= 0.1 + 1e-9);
    assert!(
        reply.affinity.delta > 0.0,
        "a happy user-initiated turn should raise affinity"
    );
}
