//! Outbox drainer: asynchronous fan-out of memories to the vector and
//! graph stores.
//!
//! The [`Processor`] owns the per-event pipeline (embed → extract →
//! vector upsert → graph merge → commit) and finalizes every terminal
//! state itself; the [`Drainer`] owns claiming, retries with
//! exponential backoff, and the dead-letter path. Failures partition
//! into [`ProcessError::Transient`] (reschedule) and
//! [`ProcessError::Permanent`] (straight to DLQ).
//!
//! At-most-once user-visible effect holds because the vector upsert is
//! idempotent by primary key, the graph merge is idempotent by
//! `(user, source, target, kind)`, and the relational status flip
//! commits only after both stores accepted their writes.

pub mod reconcile;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OutboxConfig;
use crate::conflict::{self, Resolution};
use crate::extract::rules::is_question;
use crate::extract::Extractor;
use crate::oracle::Embedder;
use crate::store::graph::GraphStore;
use crate::store::relational::{
    ConflictRecord, ConflictResolution, MemoryRecord, MemoryStatus, OutboxEventRecord,
    RelationalStore,
};
use crate::store::vector::VectorStore;
use crate::store::StoreError;

/// Conflict-detection confidence threshold for the post-commit pass.
const CONFLICT_THRESHOLD: f64 = 0.8;

/// Recent committed memories scanned for conflicts after each commit.
const CONFLICT_SCAN_LIMIT: usize = 50;

/// Typed form of the outbox event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxPayload {
    /// Memory to fan out.
    pub memory_id: Uuid,
    /// Owning user.
    pub user_id: String,
    /// Memory content at enqueue time.
    pub content: String,
    /// Originating session.
    #[serde(default)]
    pub session_id: Option<Uuid>,
    /// When the fact was observed (anchors temporal extraction).
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
    /// Eval harness marker, passed through untouched.
    #[serde(default)]
    pub eval_mode: bool,
}

/// The canonical event id for a memory fan-out.
pub fn event_id_for(memory_id: Uuid) -> String {
    format!("memory_created:{memory_id}")
}

/// Failure classification for the drainer.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Worth retrying: network, availability, deadlines.
    #[error("transient: {0}")]
    Transient(String),
    /// Never retried: malformed payload, critic rejected everything.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl From<StoreError> for ProcessError {
    fn from(err: StoreError) -> Self {
        Self::Transient(err.to_string())
    }
}

/// Terminal state reached by one processing attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Fan-out completed; memory is committed.
    Committed {
        /// The committed memory.
        memory_id: Uuid,
        /// Conflicts needing user clarification (already recorded).
        clarifications: Vec<String>,
    },
    /// Low extraction confidence; both rows held for review.
    Quarantined {
        /// The held memory.
        memory_id: Uuid,
    },
    /// Nothing to do (memory missing or already terminal).
    Skipped {
        /// Why the event was skipped.
        reason: String,
    },
}

/// Per-event fan-out pipeline.
pub struct Processor {
    relational: RelationalStore,
    vector: VectorStore,
    graph: GraphStore,
    embedder: Arc<dyn Embedder>,
    extractor: Extractor,
    commit_threshold: f64,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("commit_threshold", &self.commit_threshold)
            .finish_non_exhaustive()
    }
}

impl Processor {
    /// Assemble a processor.
    pub fn new(
        relational: RelationalStore,
        vector: VectorStore,
        graph: GraphStore,
        embedder: Arc<dyn Embedder>,
        extractor: Extractor,
        commit_threshold: f64,
    ) -> Self {
        Self {
            relational,
            vector,
            graph,
            embedder,
            extractor,
            commit_threshold,
        }
    }

    /// Process one claimed event to a terminal state.
    ///
    /// On success every relational status flip has already been
    /// committed; the caller only handles the error arm.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Transient`] for retryable failures and
    /// [`ProcessError::Permanent`] for poison events.
    pub async fn process_event(
        &self,
        event: &OutboxEventRecord,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome, ProcessError> {
        let payload: OutboxPayload = serde_json::from_value(event.payload.clone())
            .map_err(|e| ProcessError::Permanent(format!("malformed payload: {e}")))?;

        let Some(memory) = self.relational.get_memory(payload.memory_id).await? else {
            self.relational
                .skip_outbox(&event.event_id, "memory missing", now)
                .await?;
            return Ok(ProcessOutcome::Skipped {
                reason: "memory missing".to_owned(),
            });
        };
        if memory.status == MemoryStatus::Committed {
            self.relational
                .skip_outbox(&event.event_id, "already committed", now)
                .await?;
            return Ok(ProcessOutcome::Skipped {
                reason: "already committed".to_owned(),
            });
        }

        // Embed first: a failing embedding oracle must leave no partial
        // state behind.
        let embedding = self
            .embedder
            .embed(&memory.content)
            .await
            .map_err(|e| ProcessError::Transient(format!("embedding failed: {e}")))?;

        // Questions bypass extraction: vector row only, graph skipped
        // with a sentinel. The conversation core already refuses to
        // enqueue questions; this is the second fence.
        if is_question(&memory.content) {
            self.write_vector(&event.event_id, &memory, &embedding, now)
                .await?;
            self.relational.mark_graph_written(&event.event_id, now).await?;
            self.relational
                .merge_memory_metadata(memory.id, &serde_json::json!({"graph_skipped": true}))
                .await?;
            self.relational
                .commit_fanout(&event.event_id, memory.id, now)
                .await?;
            return Ok(ProcessOutcome::Committed {
                memory_id: memory.id,
                clarifications: Vec::new(),
            });
        }

        let anchor = payload.observed_at.unwrap_or(memory.created_at);
        let extraction = self.extractor.extract(&memory.content, anchor).await;

        if extraction.ir.overall_confidence < self.commit_threshold {
            let reason = format!(
                "extraction confidence {:.2} below {:.2}",
                extraction.ir.overall_confidence, self.commit_threshold
            );
            self.relational
                .quarantine_fanout(&event.event_id, memory.id, &reason, now)
                .await?;
            info!(memory = %memory.id, reason, "memory quarantined");
            return Ok(ProcessOutcome::Quarantined {
                memory_id: memory.id,
            });
        }

        if extraction.stats.input_relations > 0 && extraction.stats.output_relations == 0 {
            return Err(ProcessError::Permanent(
                "critic rejected every extracted relation".to_owned(),
            ));
        }

        self.write_vector(&event.event_id, &memory, &embedding, now)
            .await?;

        if !extraction.ir.entities.is_empty() || !extraction.ir.relations.is_empty() {
            self.graph
                .merge_ir(&memory.user_id, &extraction.ir, Some(memory.id), now)
                .await?;
        }
        if !extraction.ir.is_sufficient() {
            // No edges carry this memory's provenance; record the skip
            // so the committed-memory invariant stays auditable.
            self.relational
                .merge_memory_metadata(memory.id, &serde_json::json!({"graph_skipped": true}))
                .await?;
        }
        self.relational.mark_graph_written(&event.event_id, now).await?;

        self.relational
            .commit_fanout(&event.event_id, memory.id, now)
            .await?;

        let clarifications = self.conflict_pass(&memory, now).await?;

        debug!(memory = %memory.id, "fan-out complete");
        Ok(ProcessOutcome::Committed {
            memory_id: memory.id,
            clarifications,
        })
    }

    async fn write_vector(
        &self,
        event_id: &str,
        memory: &MemoryRecord,
        embedding: &[f32],
        now: DateTime<Utc>,
    ) -> Result<(), ProcessError> {
        self.vector
            .upsert(
                memory.id,
                &memory.user_id,
                embedding,
                &memory.content,
                memory.valence,
                memory.created_at,
            )
            .await?;
        self.relational.mark_vector_written(event_id, now).await?;
        Ok(())
    }

    /// Detect and resolve conflicts between the freshly committed
    /// memory and the user's recent committed memories.
    async fn conflict_pass(
        &self,
        memory: &MemoryRecord,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, ProcessError> {
        let recent = self
            .relational
            .recent_memories(&memory.user_id, MemoryStatus::Committed, CONFLICT_SCAN_LIMIT)
            .await?;
        let conflicts = conflict::detect_against(memory, &recent, CONFLICT_THRESHOLD);

        let mut clarifications = Vec::new();
        for found in conflicts {
            let resolution = found.resolve();
            let record = ConflictRecord {
                id: Uuid::new_v4(),
                user_id: memory.user_id.clone(),
                memory_id_1: found.older.id,
                memory_id_2: found.newer.id,
                topic: found.common_topics.join(","),
                opposite_pair: found.opposite_pair.clone(),
                confidence: found.confidence,
                resolution: match resolution {
                    Resolution::SupersedeOlder => ConflictResolution::SupersededByNewer,
                    Resolution::AskToClarify => ConflictResolution::Unresolved,
                },
                superseded_by: matches!(resolution, Resolution::SupersedeOlder)
                    .then_some(found.newer.id),
                detected_at: now,
                resolved_at: matches!(resolution, Resolution::SupersedeOlder).then_some(now),
            };
            self.relational.insert_conflict(&record).await?;

            match resolution {
                Resolution::SupersedeOlder => {
                    self.relational
                        .update_memory_status(
                            self.relational.pool(),
                            found.older.id,
                            MemoryStatus::Deprecated,
                            now,
                        )
                        .await?;
                    info!(
                        older = %found.older.id,
                        newer = %found.newer.id,
                        "conflict resolved by supersession"
                    );
                }
                Resolution::AskToClarify => {
                    clarifications.push(found.clarification_text());
                }
            }
        }
        Ok(clarifications)
    }
}

/// Compute the retry backoff for attempt `n`:
/// `min(cap, base * 2^n + jitter)` with jitter uniform in `[0, base)`.
pub fn backoff(retry_count: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let shift = retry_count.min(16);
    let exponential = base_ms.saturating_mul(1_u64 << shift);
    let jitter = if base_ms > 0 {
        rand::thread_rng().gen_range(0..base_ms)
    } else {
        0
    };
    let total = exponential.saturating_add(jitter).min(cap_ms);
    Duration::milliseconds(i64::try_from(total).unwrap_or(i64::MAX))
}

/// The drainer: a pool of claim-and-process workers.
pub struct Drainer {
    relational: RelationalStore,
    processor: Arc<Processor>,
    config: OutboxConfig,
}

impl std::fmt::Debug for Drainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drainer")
            .field("workers", &self.config.workers)
            .finish_non_exhaustive()
    }
}

impl Drainer {
    /// Assemble a drainer.
    pub fn new(relational: RelationalStore, processor: Arc<Processor>, config: OutboxConfig) -> Self {
        Self {
            relational,
            processor,
            config,
        }
    }

    /// Run the worker pool until `shutdown` flips to `true`.
    ///
    /// Each worker claims a batch, processes it sequentially, and
    /// sleeps for the poll interval when the queue is empty.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(workers = self.config.workers, "outbox drainer starting");
        let mut handles = Vec::with_capacity(self.config.workers);
        for worker_id in 0..self.config.workers {
            let drainer = Arc::clone(&self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                drainer.worker_loop(worker_id, shutdown).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!("outbox drainer stopped");
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let drained = self.drain_once().await;
            if drained == 0 {
                tokio::time::sleep(self.config.poll_interval()).await;
            }
        }
        debug!(worker_id, "drainer worker exiting");
    }

    /// Claim and process one batch. Returns the number of events
    /// handled (including failures).
    pub async fn drain_once(&self) -> usize {
        let now = Utc::now();
        let events = match self.relational.claim_outbox(self.config.claim_batch, now).await {
            Ok(events) => events,
            Err(err) => {
                error!(error = %err, "outbox claim failed");
                return 0;
            }
        };

        let mut handled = 0_usize;
        for event in events {
            self.handle_event(&event).await;
            handled = handled.saturating_add(1);
        }
        handled
    }

    /// Process one claimed event and settle its row.
    ///
    /// Returns the outcome on success; failures are settled (reschedule
    /// or DLQ) and yield `None`.
    pub async fn handle_event(&self, event: &OutboxEventRecord) -> Option<ProcessOutcome> {
        let now = Utc::now();
        match self.processor.process_event(event, now).await {
            Ok(outcome) => {
                debug!(event_id = %event.event_id, ?outcome, "event settled");
                Some(outcome)
            }
            Err(ProcessError::Transient(reason)) => {
                let retry_count = event.retry_count.saturating_add(1);
                let max = i64::from(self.config.max_retries);
                if retry_count >= max {
                    warn!(event_id = %event.event_id, reason, "retries exhausted; dead-lettering");
                    if let Err(err) = self
                        .relational
                        .dead_letter_outbox(&event.event_id, &reason, now)
                        .await
                    {
                        error!(error = %err, "failed to dead-letter event");
                    }
                    return None;
                }
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                // bounded by max_retries, a small u32
                let attempt = retry_count as u32;
                let delay = backoff(attempt, self.config.backoff_base_ms, self.config.backoff_cap_ms);
                let next = now.checked_add_signed(delay).unwrap_or(now);
                warn!(
                    event_id = %event.event_id,
                    retry_count,
                    next_attempt = %next,
                    reason,
                    "transient failure; rescheduling"
                );
                if let Err(err) = self
                    .relational
                    .reschedule_outbox(&event.event_id, retry_count, next, &reason)
                    .await
                {
                    error!(error = %err, "failed to reschedule event");
                }
                None
            }
            Err(ProcessError::Permanent(reason)) => {
                warn!(event_id = %event.event_id, reason, "permanent failure; dead-lettering");
                if let Err(err) = self
                    .relational
                    .dead_letter_outbox(&event.event_id, &reason, now)
                    .await
                {
                    error!(error = %err, "failed to dead-letter event");
                }
                None
            }
        }
    }
}
