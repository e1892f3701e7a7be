//! Tests for `src/retrieval/mod.rs` — the fork-join hybrid retrieve
//! against in-memory stores.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use kindred::config::RetrievalConfig;
use kindred::oracle::{Embedder, OracleError};
use kindred::retrieval::RetrievalEngine;
use kindred::store::graph::GraphStore;
use kindred::store::open_pool;
use kindred::store::relational::{MemoryRecord, MemoryStatus, RelationalStore};
use kindred::store::vector::VectorStore;
use kindred::types::{EntityKind, Ir, IrEntity, IrRelation, IrSource, RelationKind};

const DIM: usize = 8;

/// Deterministic bag-of-characters embedder.
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

/// Panics if the engine ever asks for an embedding.
struct PanickingEmbedder;

#[async_trait]
impl Embedder for PanickingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, OracleError> {
        panic!("graph-only retrieval must not embed");
    }

    fn dimensions(&self) -> usize {
        DIM
    }
}

struct Harness {
    relational: RelationalStore,
    vector: VectorStore,
    graph: GraphStore,
    engine: RetrievalEngine,
}

async fn setup() -> Harness {
    let pool = open_pool(":memory:", 1).await.expect("pool should open");
    let relational = RelationalStore::new(pool.clone());
    let vector = VectorStore::new(pool.clone(), DIM);
    let graph = GraphStore::new(pool);
    let engine = RetrievalEngine::new(
        relational.clone(),
        vector.clone(),
        graph.clone(),
        Arc::new(HashEmbedder),
        None,
        RetrievalConfig::default(),
    );
    Harness {
        relational,
        vector,
        graph,
        engine,
    }
}

async fn seed_memory(harness: &Harness, user_id: &str, content: &str) -> Uuid {
    let memory = MemoryRecord {
        id: Uuid::new_v4(),
        user_id: user_id.to_owned(),
        content: content.to_owned(),
        valence: Some(0.1),
        status: MemoryStatus::Committed,
        conversation_id: None,
        created_at: Utc::now(),
        committed_at: Some(Utc::now()),
        metadata: serde_json::json!({}),
    };
    harness
        .relational
        .insert_memory(harness.relational.pool(), &memory)
        .await
        .expect("memory insert should succeed");
    let embedding = HashEmbedder
        .embed(content)
        .await
        .expect("embed should succeed");
    harness
        .vector
        .upsert(memory.id, user_id, &embedding, content, Some(0.1), memory.created_at)
        .await
        .expect("vector upsert should succeed");
    memory.id
}

#[tokio::test]
async fn hybrid_returns_vector_and_graph_context() {
    let harness = setup().await;
    seed_memory(&harness, "u1", "我和二丫去过沈阳旅游").await;
    harness
        .graph
        .merge_ir(
            "u1",
            &Ir {
                entities: vec![
                    IrEntity::user(),
                    IrEntity::new("二丫", "二丫", EntityKind::Person, 0.9),
                    IrEntity::new("沈阳", "沈阳", EntityKind::Location, 0.9),
                ],
                relations: vec![IrRelation {
                    source_id: "user".to_owned(),
                    target_id: "二丫".to_owned(),
                    kind: RelationKind::FriendOf,
                    confidence: 0.9,
                    weight: Some(1.0),
                    desc: None,
                }],
                source: IrSource::Merged,
                overall_confidence: 0.9,
            },
            None,
            Utc::now(),
        )
        .await
        .expect("merge should succeed");

    let result = harness
        .engine
        .hybrid_retrieve("u1", "二丫和我去哪旅游过", 0.5, Utc::now())
        .await;

    assert!(result.vector_hits > 0, "the vector branch should fire");
    assert!(
        result.facts.iter().any(|f| f.relation == RelationKind::FriendOf),
        "the graph branch should surface the friendship"
    );
    assert!(!result.memories.is_empty());
}

#[tokio::test]
async fn entity_facts_come_back_without_any_vector_work() {
    let harness = setup().await;
    harness
        .graph
        .merge_ir(
            "u1",
            &Ir {
                entities: vec![
                    IrEntity::user(),
                    IrEntity::new("茶", "茶", EntityKind::Preference, 0.9),
                ],
                relations: vec![IrRelation {
                    source_id: "user".to_owned(),
                    target_id: "茶".to_owned(),
                    kind: RelationKind::Likes,
                    confidence: 0.9,
                    weight: Some(1.0),
                    desc: None,
                }],
                source: IrSource::Merged,
                overall_confidence: 0.9,
            },
            None,
            Utc::now(),
        )
        .await
        .expect("merge should succeed");

    // The graph-only path: an engine with a panicking embedder proves
    // the embedding oracle is never consulted.
    let engine = RetrievalEngine::new(
        harness.relational.clone(),
        harness.vector.clone(),
        harness.graph.clone(),
        Arc::new(PanickingEmbedder),
        None,
        RetrievalConfig::default(),
    );
    let facts = engine
        .retrieve_entity_facts("u1", "我喜欢茶吗", Utc::now())
        .await;

    assert!(
        facts.iter().any(|f| f.relation == RelationKind::Likes),
        "the traversal should surface the preference"
    );
}

#[tokio::test]
async fn facts_evidenced_only_by_deprecated_memories_are_dropped() {
    let harness = setup().await;
    let superseded = seed_memory(&harness, "u1", "我喜欢茶").await;
    harness
        .graph
        .merge_ir(
            "u1",
            &Ir {
                entities: vec![
                    IrEntity::user(),
                    IrEntity::new("茶", "茶", EntityKind::Preference, 0.9),
                ],
                relations: vec![IrRelation {
                    source_id: "user".to_owned(),
                    target_id: "茶".to_owned(),
                    kind: RelationKind::Likes,
                    confidence: 0.9,
                    weight: Some(1.0),
                    desc: None,
                }],
                source: IrSource::Merged,
                overall_confidence: 0.9,
            },
            Some(superseded),
            Utc::now(),
        )
        .await
        .expect("merge should succeed");
    // An edge with no provenance at all stays retrievable.
    harness
        .graph
        .merge_ir(
            "u1",
            &Ir {
                entities: vec![
                    IrEntity::user(),
                    IrEntity::new("二丫", "二丫", EntityKind::Person, 0.9),
                ],
                relations: vec![IrRelation {
                    source_id: "user".to_owned(),
                    target_id: "二丫".to_owned(),
                    kind: RelationKind::FriendOf,
                    confidence: 0.9,
                    weight: Some(1.0),
                    desc: None,
                }],
                source: IrSource::Merged,
                overall_confidence: 0.9,
            },
            None,
            Utc::now(),
        )
        .await
        .expect("merge should succeed");

    harness
        .relational
        .update_memory_status(
            harness.relational.pool(),
            superseded,
            MemoryStatus::Deprecated,
            Utc::now(),
        )
        .await
        .expect("status update should succeed");

    let facts = harness
        .engine
        .retrieve_entity_facts("u1", "我喜欢茶吗，二丫呢", Utc::now())
        .await;

    assert!(
        !facts.iter().any(|f| f.relation == RelationKind::Likes),
        "an edge whose only evidence was superseded must not resurface"
    );
    assert!(
        facts.iter().any(|f| f.relation == RelationKind::FriendOf),
        "provenance-free edges stay retrievable"
    );
}

#[tokio::test]
async fn deprecated_memories_never_resurface() {
    let harness = setup().await;
    let old = seed_memory(&harness, "u1", "我喜欢茶").await;
    let new = seed_memory(&harness, "u1", "我讨厌茶啦").await;
    harness
        .relational
        .update_memory_status(
            harness.relational.pool(),
            old,
            MemoryStatus::Deprecated,
            Utc::now(),
        )
        .await
        .expect("status update should succeed");

    let result = harness
        .engine
        .hybrid_retrieve("u1", "我对茶的感觉", 0.5, Utc::now())
        .await;

    assert!(
        result.memories.iter().all(|m| m.id != old),
        "deprecated memories must be filtered out"
    );
    assert!(
        result.memories.iter().any(|m| m.id == new),
        "the superseding memory must still rank"
    );
}

#[tokio::test]
async fn retrieval_is_scoped_by_user() {
    let harness = setup().await;
    seed_memory(&harness, "u2", "我喜欢茶").await;

    let result = harness
        .engine
        .hybrid_retrieve("u1", "我喜欢什么", 0.5, Utc::now())
        .await;
    assert!(result.memories.is_empty());
}
