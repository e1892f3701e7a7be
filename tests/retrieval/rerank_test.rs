//! Tests for `src/retrieval/rerank.rs` — the unified scoring
//! function.

use chrono::{Duration, Utc};
use uuid::Uuid;

use kindred::config::RetrievalConfig;
use kindred::retrieval::rerank::rerank;
use kindred::store::vector::VectorHit;
use kindred::types::{GraphFact, RelationKind};

fn hit(cosine: f64, valence: Option<f64>, age_days: i64) -> VectorHit {
    VectorHit {
        memory_id: Uuid::new_v4(),
        cosine,
        content: format!("memory aged {age_days}d"),
        valence,
        created_at: Utc::now() - Duration::days(age_days),
    }
}

fn config() -> RetrievalConfig {
    RetrievalConfig::default()
}

#[test]
fn fresher_memories_outrank_stale_ones_at_equal_cosine() {
    let hits = vec![hit(0.8, None, 60), hit(0.8, None, 1)];
    let ranked = rerank(&hits, &[], 0.5, false, Utc::now(), &config());

    assert_eq!(ranked[0].content, "memory aged 1d");
    assert!(ranked[0].score > ranked[1].score);
}

#[test]
fn most_recent_boost_is_suppressed_for_questions() {
    let hits = vec![hit(0.8, None, 1)];
    let now = Utc::now();

    let statement = rerank(&hits, &[], 0.5, false, now, &config());
    let question = rerank(&hits, &[], 0.5, true, now, &config());

    let difference = statement[0].score - question[0].score;
    assert!(
        (difference - 0.15).abs() < 1e-9,
        "the +0.15 boost must vanish under the intent gate, got {difference}"
    );
}

#[test]
fn provenance_edges_lift_the_evidenced_memory() {
    let evidenced = hit(0.5, None, 30);
    let plain = hit(0.5, None, 30);
    let fact = GraphFact {
        entity_id: "user".to_owned(),
        entity_name: "user".to_owned(),
        relation: RelationKind::FriendOf,
        target_id: "erya".to_owned(),
        target_name: "二丫".to_owned(),
        hop: 1,
        weight: 0.9,
        provenance: vec![evidenced.memory_id],
    };

    let ranked = rerank(
        &[plain.clone(), evidenced.clone()],
        &[fact],
        0.5,
        false,
        Utc::now(),
        &config(),
    );
    assert_eq!(ranked[0].id, evidenced.memory_id);
    assert!(ranked[0].score > ranked[1].score);
}

#[test]
fn affinity_bonus_applies_only_to_positive_valence() {
    let positive = hit(0.5, Some(0.8), 30);
    let negative = hit(0.5, Some(-0.8), 30);
    let neutral = hit(0.5, None, 30);

    let ranked = rerank(
        &[negative, neutral, positive.clone()],
        &[],
        1.0,
        false,
        Utc::now(),
        &config(),
    );
    assert_eq!(ranked[0].id, positive.memory_id);
    assert!(
        (ranked[1].score - ranked[2].score).abs() < 1e-9,
        "negative and missing valence earn the same (zero) bonus"
    );
}

#[test]
fn results_are_capped_at_top_k() {
    let hits: Vec<VectorHit> = (0..40).map(|_| hit(0.5, None, 10)).collect();
    let ranked = rerank(&hits, &[], 0.5, false, Utc::now(), &config());
    assert_eq!(ranked.len(), config().top_k);
}
