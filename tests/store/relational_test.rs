//! Tests for `src/store/relational.rs` — turns, memories, the outbox
//! claim protocol, idempotency keys, and affinity history.

use chrono::{Duration, Utc};
use uuid::Uuid;

use kindred::store::relational::{
    MemoryRecord, MemoryStatus, OutboxEventRecord, OutboxStatus, RelationalStore, TurnRecord,
    TurnRole,
};
use kindred::store::open_pool;

async fn setup_store() -> RelationalStore {
    let pool = open_pool(":memory:", 1).await.expect("pool should open");
    RelationalStore::new(pool)
}

fn test_memory(user_id: &str, content: &str) -> MemoryRecord {
    MemoryRecord {
        id: Uuid::new_v4(),
        user_id: user_id.to_owned(),
        content: content.to_owned(),
        valence: Some(0.2),
        status: MemoryStatus::Pending,
        conversation_id: None,
        created_at: Utc::now(),
        committed_at: None,
        metadata: serde_json::json!({}),
    }
}

fn test_event(memory_id: Uuid) -> OutboxEventRecord {
    let now = Utc::now();
    OutboxEventRecord {
        id: Uuid::new_v4(),
        event_id: format!("memory_created:{memory_id}"),
        memory_id: Some(memory_id),
        payload: serde_json::json!({
            "memory_id": memory_id,
            "user_id": "u1",
            "content": "hello",
        }),
        status: OutboxStatus::Pending,
        retry_count: 0,
        idempotency_key: None,
        created_at: now,
        next_attempt_at: now,
        processing_started_at: None,
        vector_written_at: None,
        graph_written_at: None,
        processed_at: None,
        error_message: None,
    }
}

#[tokio::test]
async fn turn_memory_and_event_commit_atomically() {
    let store = setup_store().await;
    let now = Utc::now();
    let session_id = Uuid::new_v4();
    let memory = test_memory("u1", "我喜欢茶");
    let event = test_event(memory.id);

    let mut tx = store.begin().await.expect("begin should succeed");
    store
        .ensure_session(&mut *tx, session_id, "u1", now)
        .await
        .expect("session insert should succeed");
    store
        .insert_turn(
            &mut *tx,
            &TurnRecord {
                id: Uuid::new_v4(),
                session_id,
                user_id: "u1".to_owned(),
                role: TurnRole::User,
                content: "我喜欢茶".to_owned(),
                emotion_tag: None,
                created_at: now,
            },
        )
        .await
        .expect("turn insert should succeed");
    store
        .insert_memory(&mut *tx, &memory)
        .await
        .expect("memory insert should succeed");
    store
        .insert_outbox(&mut *tx, &event)
        .await
        .expect("outbox insert should succeed");
    tx.commit().await.expect("commit should succeed");

    assert_eq!(store.count_turns("u1").await.expect("count"), 1);
    let loaded = store
        .get_memory(memory.id)
        .await
        .expect("get should succeed")
        .expect("memory should exist");
    assert_eq!(loaded.status, MemoryStatus::Pending);
    let loaded_event = store
        .get_outbox_event(&event.event_id)
        .await
        .expect("get should succeed")
        .expect("event should exist");
    assert_eq!(loaded_event.status, OutboxStatus::Pending);
}

#[tokio::test]
async fn aborted_transaction_leaves_no_rows() {
    let store = setup_store().await;
    let memory = test_memory("u1", "content");

    let mut tx = store.begin().await.expect("begin should succeed");
    store
        .insert_memory(&mut *tx, &memory)
        .await
        .expect("insert should succeed");
    drop(tx); // rollback

    assert!(store
        .get_memory(memory.id)
        .await
        .expect("get should succeed")
        .is_none());
}

#[tokio::test]
async fn claim_outbox_admits_exactly_one_claimer() {
    let store = setup_store().await;
    let memory = test_memory("u1", "content");
    let event = test_event(memory.id);
    store
        .insert_outbox(store.pool(), &event)
        .await
        .expect("insert should succeed");

    let now = Utc::now();
    let first = store.claim_outbox(10, now).await.expect("claim");
    let second = store.claim_outbox(10, now).await.expect("claim");

    assert_eq!(first.len(), 1);
    assert_eq!(first[0].status, OutboxStatus::Processing);
    assert!(second.is_empty(), "claimed event must not be claimable again");
}

#[tokio::test]
async fn claim_outbox_respects_backoff_schedule() {
    let store = setup_store().await;
    let memory = test_memory("u1", "content");
    let mut event = test_event(memory.id);
    event.next_attempt_at = Utc::now() + Duration::minutes(5);
    store
        .insert_outbox(store.pool(), &event)
        .await
        .expect("insert should succeed");

    let claimed = store.claim_outbox(10, Utc::now()).await.expect("claim");
    assert!(claimed.is_empty(), "future-scheduled event must wait");

    let later = Utc::now() + Duration::minutes(6);
    let claimed = store.claim_outbox(10, later).await.expect("claim");
    assert_eq!(claimed.len(), 1);
}

#[tokio::test]
async fn reschedule_returns_event_to_pending_with_backoff() {
    let store = setup_store().await;
    let memory = test_memory("u1", "content");
    let event = test_event(memory.id);
    store
        .insert_outbox(store.pool(), &event)
        .await
        .expect("insert should succeed");

    let now = Utc::now();
    store.claim_outbox(10, now).await.expect("claim");
    store
        .reschedule_outbox(&event.event_id, 1, now + Duration::seconds(30), "oracle down")
        .await
        .expect("reschedule should succeed");

    let loaded = store
        .get_outbox_event(&event.event_id)
        .await
        .expect("get")
        .expect("event should exist");
    assert_eq!(loaded.status, OutboxStatus::Pending);
    assert_eq!(loaded.retry_count, 1);
    assert_eq!(loaded.error_message.as_deref(), Some("oracle down"));
    assert!(loaded.processing_started_at.is_none());
}

#[tokio::test]
async fn requeue_stuck_resets_old_processing_rows() {
    let store = setup_store().await;
    let memory = test_memory("u1", "content");
    let event = test_event(memory.id);
    store
        .insert_outbox(store.pool(), &event)
        .await
        .expect("insert should succeed");

    let claimed_at = Utc::now() - Duration::minutes(30);
    store.claim_outbox(10, claimed_at).await.expect("claim");

    let requeued = store
        .requeue_stuck(Duration::minutes(10), Utc::now())
        .await
        .expect("requeue should succeed");
    assert_eq!(requeued, 1);

    let loaded = store
        .get_outbox_event(&event.event_id)
        .await
        .expect("get")
        .expect("event should exist");
    assert_eq!(loaded.status, OutboxStatus::Pending);
}

#[tokio::test]
async fn commit_fanout_flips_both_rows() {
    let store = setup_store().await;
    let memory = test_memory("u1", "content");
    store
        .insert_memory(store.pool(), &memory)
        .await
        .expect("insert should succeed");
    let event = test_event(memory.id);
    store
        .insert_outbox(store.pool(), &event)
        .await
        .expect("insert should succeed");

    store
        .commit_fanout(&event.event_id, memory.id, Utc::now())
        .await
        .expect("commit should succeed");

    let loaded = store
        .get_memory(memory.id)
        .await
        .expect("get")
        .expect("memory should exist");
    assert_eq!(loaded.status, MemoryStatus::Committed);
    assert!(loaded.committed_at.is_some());

    let loaded_event = store
        .get_outbox_event(&event.event_id)
        .await
        .expect("get")
        .expect("event should exist");
    assert_eq!(loaded_event.status, OutboxStatus::Done);
    assert!(loaded_event.processed_at.is_some());
}

#[tokio::test]
async fn idempotency_first_write_wins_and_expires() {
    let store = setup_store().await;
    let now = Utc::now();
    let first = serde_json::json!({"reply": "first"});
    let second = serde_json::json!({"reply": "second"});

    store
        .insert_idempotency(store.pool(), "u1", "k1", None, &first, now, Duration::hours(1))
        .await
        .expect("insert should succeed");
    store
        .insert_idempotency(store.pool(), "u1", "k1", None, &second, now, Duration::hours(1))
        .await
        .expect("duplicate insert should be ignored");

    let hit = store
        .get_idempotency("u1", "k1", now)
        .await
        .expect("get")
        .expect("key should exist");
    assert_eq!(hit.response, first, "first successful write wins");

    let after_expiry = now + Duration::hours(2);
    assert!(store
        .get_idempotency("u1", "k1", after_expiry)
        .await
        .expect("get")
        .is_none());

    let removed = store
        .cleanup_idempotency(after_expiry)
        .await
        .expect("cleanup should succeed");
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn affinity_history_returns_latest_row() {
    let store = setup_store().await;
    let now = Utc::now();
    let signals = serde_json::json!({});

    assert!(store
        .get_last_affinity("u1")
        .await
        .expect("get")
        .is_none());

    store
        .insert_affinity_row(store.pool(), "u1", 0.5, 0.55, 0.05, "conversation", &signals, now)
        .await
        .expect("insert should succeed");
    store
        .insert_affinity_row(store.pool(), "u1", 0.55, 0.6, 0.05, "conversation", &signals, now)
        .await
        .expect("insert should succeed");

    let reading = store
        .get_last_affinity("u1")
        .await
        .expect("get")
        .expect("reading should exist");
    assert!((reading.score - 0.6).abs() < 1e-9);
    assert!((reading.delta - 0.05).abs() < 1e-9);
}

#[tokio::test]
async fn recent_turns_come_back_oldest_first() {
    let store = setup_store().await;
    let session_id = Uuid::new_v4();
    let base = Utc::now();
    for (i, content) in ["one", "two", "three"].iter().enumerate() {
        let turn = TurnRecord {
            id: Uuid::new_v4(),
            session_id,
            user_id: "u1".to_owned(),
            role: TurnRole::User,
            content: (*content).to_owned(),
            emotion_tag: None,
            created_at: base + Duration::seconds(i64::try_from(i).expect("small index")),
        };
        store
            .insert_turn(store.pool(), &turn)
            .await
            .expect("insert should succeed");
    }

    let turns = store.recent_turns(session_id, 2).await.expect("query");
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].content, "two");
    assert_eq!(turns[1].content, "three");
}
