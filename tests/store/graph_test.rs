//! Tests for `src/store/graph.rs` — merge semantics, bounded
//! traversal, and decay.

use chrono::{Duration, Utc};
use uuid::Uuid;

use kindred::store::graph::{effective_weight, GraphStore, MIN_WEIGHT_FLOOR};
use kindred::store::open_pool;
use kindred::types::{EntityKind, Ir, IrEntity, IrRelation, IrSource, RelationKind};

async fn setup_store() -> GraphStore {
    let pool = open_pool(":memory:", 1).await.expect("pool should open");
    GraphStore::new(pool)
}

fn person(id: &str, name: &str) -> IrEntity {
    IrEntity::new(id, name, EntityKind::Person, 0.9)
}

fn relation(source: &str, target: &str, kind: RelationKind, weight: f64) -> IrRelation {
    IrRelation {
        source_id: source.to_owned(),
        target_id: target.to_owned(),
        kind,
        confidence: 0.9,
        weight: Some(weight),
        desc: None,
    }
}

fn ir(entities: Vec<IrEntity>, relations: Vec<IrRelation>) -> Ir {
    Ir {
        entities,
        relations,
        source: IrSource::Merged,
        overall_confidence: 0.9,
    }
}

#[tokio::test]
async fn entity_merge_counts_mentions_and_keeps_first_seen() {
    let store = setup_store().await;
    let first = Utc::now() - Duration::days(3);
    let second = Utc::now();

    store
        .merge_entity("u1", &person("erya", "二丫"), first)
        .await
        .expect("merge should succeed");
    store
        .merge_entity("u1", &person("erya", "二丫"), second)
        .await
        .expect("merge should succeed");

    let entity = store
        .get_entity("u1", "erya")
        .await
        .expect("get")
        .expect("entity should exist");
    assert_eq!(entity.mention_count, 2);
    // Stored timestamps carry microsecond precision.
    assert!((entity.first_mentioned_at - first).num_milliseconds().abs() < 1);
    assert!((entity.last_mentioned_at - second).num_milliseconds().abs() < 1);
}

#[tokio::test]
async fn relation_merge_takes_max_weight_and_unions_provenance() {
    let store = setup_store().await;
    let now = Utc::now();
    let m1 = Uuid::new_v4();
    let m2 = Uuid::new_v4();

    store
        .merge_ir(
            "u1",
            &ir(
                vec![IrEntity::user(), person("erya", "二丫")],
                vec![relation("user", "erya", RelationKind::FriendOf, 0.7)],
            ),
            Some(m1),
            now,
        )
        .await
        .expect("merge should succeed");
    store
        .merge_ir(
            "u1",
            &ir(
                vec![IrEntity::user(), person("erya", "二丫")],
                vec![relation("user", "erya", RelationKind::FriendOf, 0.5)],
            ),
            Some(m2),
            now,
        )
        .await
        .expect("merge should succeed");

    let edges = store.neighbors("u1", "erya").await.expect("neighbors");
    assert_eq!(edges.len(), 1, "duplicate edges must merge");
    let edge = &edges[0];
    assert!((edge.weight - 0.7).abs() < 1e-9, "weight takes the max");
    assert!(edge.provenance.contains(&m1));
    assert!(edge.provenance.contains(&m2));
}

#[tokio::test]
async fn self_loops_never_reach_the_table() {
    let store = setup_store().await;
    store
        .merge_ir(
            "u1",
            &ir(
                vec![person("erya", "二丫")],
                vec![relation("erya", "erya", RelationKind::FriendOf, 1.0)],
            ),
            None,
            Utc::now(),
        )
        .await
        .expect("merge should skip the loop, not fail");
    assert_eq!(store.count_relations("u1").await.expect("count"), 0);
}

#[tokio::test]
async fn traversal_walks_multiple_hops_and_dedupes() {
    let store = setup_store().await;
    let now = Utc::now();
    store
        .merge_ir(
            "u1",
            &ir(
                vec![
                    IrEntity::user(),
                    person("erya", "二丫"),
                    IrEntity::new("dalian", "大连", EntityKind::Location, 0.9),
                ],
                vec![
                    relation("user", "erya", RelationKind::FriendOf, 1.0),
                    relation("erya", "dalian", RelationKind::LivesIn, 1.0),
                ],
            ),
            None,
            now,
        )
        .await
        .expect("merge should succeed");

    let facts = store
        .query_paths("u1", &["二丫".to_owned()], 3, now)
        .await
        .expect("traversal should succeed");

    assert!(
        facts
            .iter()
            .any(|f| f.relation == RelationKind::FriendOf && f.target_id == "erya"),
        "hop 1 should surface the friendship"
    );
    assert!(
        facts
            .iter()
            .any(|f| f.relation == RelationKind::LivesIn && f.target_id == "dalian"),
        "traversal should reach 大连 from 二丫"
    );
    let friend_edges = facts
        .iter()
        .filter(|f| f.relation == RelationKind::FriendOf)
        .count();
    assert_eq!(friend_edges, 1, "edges must be surfaced once");
}

#[tokio::test]
async fn traversal_is_scoped_by_user() {
    let store = setup_store().await;
    let now = Utc::now();
    store
        .merge_ir(
            "u2",
            &ir(
                vec![IrEntity::user(), person("erya", "二丫")],
                vec![relation("user", "erya", RelationKind::FriendOf, 1.0)],
            ),
            None,
            now,
        )
        .await
        .expect("merge should succeed");

    let facts = store
        .query_paths("u1", &["二丫".to_owned()], 3, now)
        .await
        .expect("traversal should succeed");
    assert!(facts.is_empty(), "another user's graph must stay invisible");
}

#[tokio::test]
async fn decay_reduces_stale_edges_and_respects_the_floor() {
    let store = setup_store().await;
    let old = Utc::now() - Duration::days(10);
    store
        .merge_ir(
            "u1",
            &ir(
                vec![IrEntity::user(), person("erya", "二丫")],
                vec![relation("user", "erya", RelationKind::FriendOf, 1.0)],
            ),
            None,
            old,
        )
        .await
        .expect("merge should succeed");

    let now = Utc::now();
    let updated = store.apply_decay(1000, now).await.expect("decay");
    assert_eq!(updated, 1);

    let edges = store.neighbors("u1", "erya").await.expect("neighbors");
    let edge = &edges[0];
    assert!(edge.weight < 1.0, "stale edge must decay");
    assert!(edge.weight >= MIN_WEIGHT_FLOOR);
    assert!(
        (edge.updated_at - now).num_milliseconds().abs() < 1,
        "decay touches updated_at"
    );

    // A second pass finds nothing stale.
    let updated = store.apply_decay(1000, now).await.expect("decay");
    assert_eq!(updated, 0);
}

#[tokio::test]
async fn fresh_edges_are_left_alone() {
    let store = setup_store().await;
    let now = Utc::now();
    store
        .merge_ir(
            "u1",
            &ir(
                vec![IrEntity::user(), person("erya", "二丫")],
                vec![relation("user", "erya", RelationKind::FriendOf, 1.0)],
            ),
            None,
            now,
        )
        .await
        .expect("merge should succeed");

    let updated = store.apply_decay(1000, now).await.expect("decay");
    assert_eq!(updated, 0, "edges touched within a day must not decay");
}

#[test]
fn effective_weight_is_monotone_with_a_floor() {
    let updated_at = Utc::now();
    let w1 = effective_weight(1.0, 0.03, updated_at, updated_at + Duration::days(1));
    let w2 = effective_weight(1.0, 0.03, updated_at, updated_at + Duration::days(30));
    let w3 = effective_weight(1.0, 0.03, updated_at, updated_at + Duration::days(3650));

    assert!(w1 > w2, "older reads must never score higher");
    assert!(w2 > w3);
    assert!((w3 - MIN_WEIGHT_FLOOR).abs() < 1e-9, "floor holds forever");

    // No decay into the past.
    let w0 = effective_weight(0.8, 0.03, updated_at, updated_at - Duration::days(1));
    assert!((w0 - 0.8).abs() < 1e-9);
}
