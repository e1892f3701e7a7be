//! Tests for `src/store/vector.rs` — idempotent upsert and cosine
//! ranking.

use chrono::Utc;
use uuid::Uuid;

use kindred::store::open_pool;
use kindred::store::vector::{cosine, VectorStore};
use kindred::store::StoreError;

const DIM: usize = 4;

async fn setup_store() -> VectorStore {
    let pool = open_pool(":memory:", 1).await.expect("pool should open");
    VectorStore::new(pool, DIM)
}

#[tokio::test]
async fn upsert_twice_keeps_a_single_row() {
    let store = setup_store().await;
    let id = Uuid::new_v4();
    let v = [1.0, 0.0, 0.0, 0.0];

    store
        .upsert(id, "u1", &v, "hello", None, Utc::now())
        .await
        .expect("upsert should succeed");
    store
        .upsert(id, "u1", &v, "hello", None, Utc::now())
        .await
        .expect("repeat upsert should succeed");

    assert_eq!(store.count("u1").await.expect("count"), 1);

    let hits = store.search("u1", &v, 10).await.expect("search");
    assert_eq!(hits.len(), 1, "search must return the id exactly once");
    assert_eq!(hits[0].memory_id, id);
}

#[tokio::test]
async fn search_orders_by_cosine_similarity() {
    let store = setup_store().await;
    let close = Uuid::new_v4();
    let far = Uuid::new_v4();

    store
        .upsert(close, "u1", &[1.0, 0.1, 0.0, 0.0], "close", None, Utc::now())
        .await
        .expect("upsert should succeed");
    store
        .upsert(far, "u1", &[0.0, 0.0, 1.0, 0.0], "far", None, Utc::now())
        .await
        .expect("upsert should succeed");

    let hits = store
        .search("u1", &[1.0, 0.0, 0.0, 0.0], 10)
        .await
        .expect("search");
    assert_eq!(hits[0].memory_id, close);
    assert!(hits[0].cosine > hits[1].cosine);
}

#[tokio::test]
async fn search_is_scoped_by_user() {
    let store = setup_store().await;
    let v = [0.5, 0.5, 0.0, 0.0];
    store
        .upsert(Uuid::new_v4(), "u1", &v, "mine", None, Utc::now())
        .await
        .expect("upsert should succeed");
    store
        .upsert(Uuid::new_v4(), "u2", &v, "theirs", None, Utc::now())
        .await
        .expect("upsert should succeed");

    let hits = store.search("u1", &v, 10).await.expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].content, "mine");
}

#[tokio::test]
async fn wrong_dimension_is_rejected() {
    let store = setup_store().await;
    let err = store
        .upsert(Uuid::new_v4(), "u1", &[1.0, 0.0], "short", None, Utc::now())
        .await
        .expect_err("short vector must be rejected");
    assert!(matches!(err, StoreError::DimensionMismatch { got: 2, expected: DIM }));
}

#[test]
fn cosine_handles_zero_vectors() {
    assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
    assert!((cosine(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
}
