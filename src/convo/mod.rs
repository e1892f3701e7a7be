//! Conversation core: orchestrates one turn end to end.
//!
//! Fast path: intent gate → emotion tag → greeting short-circuit or
//! fork-join retrieval → reply generation → one relational transaction
//! (turns, pending memory, outbox event, idempotency key, affinity
//! row). Slow path: the outbox drainer fans the memory out
//! asynchronously; with inline draining enabled the engine settles the
//! event itself and can report `memory_committed` and `clarification`
//! deltas on the stream.

pub mod greeting;
pub mod prompt;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::affinity::{self, AffinityState, Signals};
use crate::config::ConversationConfig;
use crate::emotion::{self, EmotionTag};
use crate::error::{EngineError, ErrorCode};
use crate::extract::rules::is_question;
use crate::oracle::Generator;
use crate::outbox::{event_id_for, Drainer, OutboxPayload, ProcessOutcome};
use crate::retrieval::{RetrievalEngine, RetrievalResult};
use crate::store::relational::{
    MemoryRecord, MemoryStatus, OutboxEventRecord, OutboxStatus, RelationalStore, TurnRecord,
    TurnRole,
};

use self::greeting::GreetingCache;

/// Retrieval context budget selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    /// Graph facts only; the vector branch is skipped entirely.
    GraphOnly,
    /// Vector and graph fused by the unified rerank.
    #[default]
    Hybrid,
}

impl ConversationMode {
    /// Canonical string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GraphOnly => "graph_only",
            Self::Hybrid => "hybrid",
        }
    }
}

/// One turn request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    /// Owning user.
    pub user_id: String,
    /// Session to continue; a fresh session is created when absent.
    #[serde(default)]
    pub session_id: Option<Uuid>,
    /// The user's message.
    pub text: String,
    /// Client-supplied idempotency token.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Context budget.
    #[serde(default)]
    pub mode: ConversationMode,
    /// Only persist a memory; no reply generation.
    #[serde(default)]
    pub memorize_only: bool,
    /// Eval harness flag: forces inline draining.
    #[serde(default)]
    pub eval_mode: bool,
}

/// Affinity summary on the reply surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffinitySummary {
    /// Current score in `[0, 1]`.
    pub score: f64,
    /// Derived state name.
    pub state: String,
    /// Delta applied by this turn.
    pub delta: f64,
}

/// One memory cited in the reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsed {
    /// Memory id.
    pub id: Uuid,
    /// Memory content.
    pub content: String,
    /// Fused retrieval score.
    pub score: f64,
}

/// Where the reply context came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSource {
    /// History turns included in the prompt.
    pub history_turns_count: usize,
    /// Raw vector hits before filtering.
    pub vector_hits: usize,
    /// Graph facts surfaced.
    pub graph_facts: usize,
    /// True when this reply was served from the idempotency cache.
    pub cached: bool,
}

/// The reply for one processed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Generated or templated reply text.
    pub reply: String,
    /// Session the turn landed in.
    pub session_id: Uuid,
    /// The user turn's id.
    pub turn_id: Uuid,
    /// Emotion reading for the user turn.
    pub emotion: EmotionTag,
    /// Affinity after this turn.
    pub affinity: AffinitySummary,
    /// Memories that conditioned the reply.
    pub memories_used: Vec<MemoryUsed>,
    /// Tone the reply was asked to take.
    pub tone_type: String,
    /// Wall-clock processing time.
    pub response_time_ms: f64,
    /// `pending` until the drainer commits, then `committed`.
    pub memory_status: String,
    /// Mode the turn ran in.
    pub mode: String,
    /// Context provenance.
    pub context_source: Option<ContextSource>,
}

/// Streaming deltas, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDelta {
    /// Stream opened.
    Start {
        /// Session the turn landed in.
        session_id: Uuid,
    },
    /// A chunk of reply text.
    Text {
        /// Chunk content.
        content: String,
    },
    /// The turn's memory was written (status pending).
    MemoryPending {
        /// Memory id.
        memory_id: Uuid,
    },
    /// The inline drain committed the memory.
    MemoryCommitted {
        /// Memory id.
        memory_id: Uuid,
    },
    /// A contradiction needs the user's input.
    Clarification {
        /// Rendered clarification prompt.
        content: String,
    },
    /// Stream finished.
    Done,
    /// The turn failed; `content` is safe to show.
    Error {
        /// Error summary with trace id.
        content: String,
    },
}

/// Characters per streamed text chunk.
const STREAM_CHUNK_CHARS: usize = 48;

/// Internal result of the shared turn pipeline.
struct TurnArtifacts {
    reply: Reply,
    event: Option<OutboxEventRecord>,
}

/// The conversation engine.
pub struct ConversationEngine {
    relational: RelationalStore,
    retrieval: RetrievalEngine,
    generator: Arc<dyn Generator>,
    greetings: GreetingCache,
    drainer: Option<Arc<Drainer>>,
    config: ConversationConfig,
    session_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for ConversationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationEngine")
            .field("inline_drain", &self.config.inline_drain)
            .finish_non_exhaustive()
    }
}

impl ConversationEngine {
    /// Assemble the engine. `drainer` enables the inline-drain path;
    /// without it `memory_committed` deltas never fire.
    pub fn new(
        relational: RelationalStore,
        retrieval: RetrievalEngine,
        generator: Arc<dyn Generator>,
        drainer: Option<Arc<Drainer>>,
        config: ConversationConfig,
    ) -> Self {
        let greetings = GreetingCache::new(std::time::Duration::from_secs(
            config.greeting_ttl_secs,
        ));
        Self {
            relational,
            retrieval,
            generator,
            greetings,
            drainer,
            config,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Process one turn synchronously.
    ///
    /// # Errors
    ///
    /// Returns a structured [`EngineError`]; on `CONVERSATION_FAILED`
    /// the caller may retry with the same idempotency key.
    pub async fn process_turn(&self, request: TurnRequest) -> Result<Reply, EngineError> {
        let artifacts = self.run_turn(&request).await?;
        let mut reply = artifacts.reply;

        if let Some(event) = artifacts.event {
            if self.should_inline_drain(&request) {
                match self.inline_drain(&event).await {
                    Some(ProcessOutcome::Committed { .. }) => {
                        reply.memory_status = "committed".to_owned();
                    }
                    Some(_) | None => {}
                }
            }
        }

        Ok(reply)
    }

    /// Process one turn as a lazy delta stream.
    ///
    /// One stream per call; deltas are ordered within the stream but
    /// carry no cross-stream guarantees. Work committed before a
    /// client disconnect stays committed.
    pub fn stream_turn(self: Arc<Self>, request: TurnRequest) -> ReceiverStream<TurnDelta> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let session_id = request.session_id.unwrap_or_else(Uuid::new_v4);
            let request = TurnRequest {
                session_id: Some(session_id),
                ..request
            };
            let _ = tx.send(TurnDelta::Start { session_id }).await;

            match self.run_turn(&request).await {
                Ok(artifacts) => {
                    for chunk in chunk_text(&artifacts.reply.reply) {
                        if tx.send(TurnDelta::Text { content: chunk }).await.is_err() {
                            return;
                        }
                    }
                    if let Some(event) = artifacts.event {
                        if let Some(memory_id) = event.memory_id {
                            let _ = tx.send(TurnDelta::MemoryPending { memory_id }).await;
                        }
                        if self.should_inline_drain(&request) {
                            match self.inline_drain(&event).await {
                                Some(ProcessOutcome::Committed {
                                    memory_id,
                                    clarifications,
                                }) => {
                                    let _ =
                                        tx.send(TurnDelta::MemoryCommitted { memory_id }).await;
                                    for content in clarifications {
                                        let _ =
                                            tx.send(TurnDelta::Clarification { content }).await;
                                    }
                                }
                                Some(_) | None => {}
                            }
                        }
                    }
                    let _ = tx.send(TurnDelta::Done).await;
                }
                Err(err) => {
                    let _ = tx
                        .send(TurnDelta::Error {
                            content: err.to_string(),
                        })
                        .await;
                }
            }
        });
        ReceiverStream::new(rx)
    }

    fn should_inline_drain(&self, request: &TurnRequest) -> bool {
        self.drainer.is_some() && (self.config.inline_drain || request.eval_mode)
    }

    async fn inline_drain(&self, event: &OutboxEventRecord) -> Option<ProcessOutcome> {
        let drainer = self.drainer.as_ref()?;
        let claimed = match self.relational.claim_event(&event.event_id, Utc::now()).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, "inline claim failed");
                return None;
            }
        };
        drainer.handle_event(&claimed).await
    }

    /// The shared turn pipeline: validate, short-circuit, retrieve,
    /// generate, persist.
    async fn run_turn(&self, request: &TurnRequest) -> Result<TurnArtifacts, EngineError> {
        let started = Instant::now();
        let text = request.text.trim();
        if text.is_empty() {
            return Err(EngineError::invalid_input("message must not be empty"));
        }

        let now = Utc::now();

        // Idempotency short-circuit: the stored reply is returned
        // byte-identical, with no new rows anywhere.
        if let Some(key) = &request.idempotency_key {
            if let Some(hit) = self
                .relational
                .get_idempotency(&request.user_id, key, now)
                .await?
            {
                if let Ok(reply) = serde_json::from_value::<Reply>(hit.response) {
                    info!(user = %request.user_id, "idempotency cache hit");
                    return Ok(TurnArtifacts {
                        reply,
                        event: None,
                    });
                }
            }
        }

        let session_id = request.session_id.unwrap_or_else(Uuid::new_v4);
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let question = is_question(text);
        let tag = emotion::tag(text);
        let last_affinity = self.relational.get_last_affinity(&request.user_id).await?;
        let current_score = last_affinity.map_or(affinity::DEFAULT_SCORE, |r| r.score);
        let current_state = AffinityState::from_score(current_score);

        let signals = self.build_signals(request, &tag, now).await?;
        let update = affinity::apply(current_score, &signals);
        if let Some(event) = update.lifecycle {
            info!(
                user = %request.user_id,
                from = event.from.as_str(),
                to = event.to.as_str(),
                "affinity state transition"
            );
        }

        // Greeting short-circuit: template reply, turns and affinity
        // recorded, no memory, no outbox event, no graph writes.
        if let Some(class) = greeting::classify(text) {
            let reply_text = self.greetings.reply(class, current_state);
            return self
                .persist_greeting_turn(
                    request, session_id, text, &tag, &update, &signals, reply_text, started, now,
                )
                .await;
        }

        // Fork-join retrieval; failures degrade to empty context.
        // Graph-only turns take the entity-fact path, which never
        // touches the embedding oracle or the vector store.
        let (retrieved, history) = if request.memorize_only {
            (RetrievalResult::default(), Vec::new())
        } else {
            let retrieved = match request.mode {
                ConversationMode::Hybrid => {
                    self.retrieval
                        .hybrid_retrieve(&request.user_id, text, update.new_score, now)
                        .await
                }
                ConversationMode::GraphOnly => {
                    let facts = self
                        .retrieval
                        .retrieve_entity_facts(&request.user_id, text, now)
                        .await;
                    RetrievalResult {
                        memories: Vec::new(),
                        facts,
                        vector_hits: 0,
                    }
                }
            };
            let history = self
                .relational
                .recent_turns(session_id, self.config.history_turns)
                .await
                .unwrap_or_default();
            (retrieved, history)
        };

        let reply_text = if request.memorize_only {
            prompt::memorize_ack()
        } else {
            let built = prompt::build(
                text,
                &retrieved.memories,
                &retrieved.facts,
                &history,
                update.new_score,
            );
            self.generator
                .generate(&built, self.config.reply_max_tokens)
                .await
                .map_err(|err| {
                    warn!(error = %err, "reply generation failed");
                    EngineError::new(ErrorCode::ConversationFailed, "reply generation failed")
                })?
        };

        self.persist_full_turn(
            request, session_id, text, question, &tag, &update, &signals, &retrieved, &history,
            reply_text, started, now,
        )
        .await
    }

    /// Persist the greeting fast path in one transaction.
    #[allow(clippy::too_many_arguments)]
    async fn persist_greeting_turn(
        &self,
        request: &TurnRequest,
        session_id: Uuid,
        text: &str,
        tag: &EmotionTag,
        update: &affinity::AffinityUpdate,
        signals: &Signals,
        reply_text: String,
        started: Instant,
        now: DateTime<Utc>,
    ) -> Result<TurnArtifacts, EngineError> {
        let user_turn_id = Uuid::new_v4();
        let reply = Reply {
            reply: reply_text.clone(),
            session_id,
            turn_id: user_turn_id,
            emotion: *tag,
            affinity: AffinitySummary {
                score: update.new_score,
                state: update.state.as_str().to_owned(),
                delta: update.delta,
            },
            memories_used: Vec::new(),
            tone_type: prompt::tone_type(update.state).to_owned(),
            response_time_ms: elapsed_ms(started),
            memory_status: "pending".to_owned(),
            mode: request.mode.as_str().to_owned(),
            context_source: Some(ContextSource {
                history_turns_count: 0,
                vector_hits: 0,
                graph_facts: 0,
                cached: true,
            }),
        };

        let mut tx = self.relational.begin().await?;
        self.relational
            .ensure_session(&mut *tx, session_id, &request.user_id, now)
            .await?;
        self.relational
            .insert_turn(
                &mut *tx,
                &user_turn(user_turn_id, session_id, request, text, tag, now),
            )
            .await?;
        self.relational
            .insert_turn(
                &mut *tx,
                &assistant_turn(session_id, &request.user_id, &reply_text, now),
            )
            .await?;
        self.relational
            .insert_affinity_row(
                &mut *tx,
                &request.user_id,
                update.old_score,
                update.new_score,
                update.delta,
                "greeting",
                &serde_json::to_value(signals).unwrap_or_default(),
                now,
            )
            .await?;
        if let Some(key) = &request.idempotency_key {
            let cached = serde_json::to_value(&reply).unwrap_or_default();
            self.relational
                .insert_idempotency(
                    &mut *tx,
                    &request.user_id,
                    key,
                    Some(user_turn_id),
                    &cached,
                    now,
                    self.config.idempotency_ttl(),
                )
                .await?;
        }
        tx.commit().await.map_err(crate::store::StoreError::from)?;

        Ok(TurnArtifacts {
            reply,
            event: None,
        })
    }

    /// Persist a full turn (and, for statements, its memory and outbox
    /// event) in one transaction.
    #[allow(clippy::too_many_arguments)]
    async fn persist_full_turn(
        &self,
        request: &TurnRequest,
        session_id: Uuid,
        text: &str,
        question: bool,
        tag: &EmotionTag,
        update: &affinity::AffinityUpdate,
        signals: &Signals,
        retrieved: &RetrievalResult,
        history: &[TurnRecord],
        reply_text: String,
        started: Instant,
        now: DateTime<Utc>,
    ) -> Result<TurnArtifacts, EngineError> {
        let user_turn_id = Uuid::new_v4();
        let memory_id = Uuid::new_v4();

        // Questions only read: no memory, no outbox event.
        let write_memory = !question;

        let reply = Reply {
            reply: reply_text.clone(),
            session_id,
            turn_id: user_turn_id,
            emotion: *tag,
            affinity: AffinitySummary {
                score: update.new_score,
                state: update.state.as_str().to_owned(),
                delta: update.delta,
            },
            memories_used: retrieved
                .memories
                .iter()
                .map(|m| MemoryUsed {
                    id: m.id,
                    content: m.content.clone(),
                    score: m.score,
                })
                .collect(),
            tone_type: prompt::tone_type(update.state).to_owned(),
            response_time_ms: elapsed_ms(started),
            memory_status: "pending".to_owned(),
            mode: request.mode.as_str().to_owned(),
            context_source: Some(ContextSource {
                history_turns_count: history.len(),
                vector_hits: retrieved.vector_hits,
                graph_facts: retrieved.facts.len(),
                cached: false,
            }),
        };

        let mut event_record = None;

        let mut tx = self.relational.begin().await?;
        self.relational
            .ensure_session(&mut *tx, session_id, &request.user_id, now)
            .await?;
        self.relational
            .insert_turn(
                &mut *tx,
                &user_turn(user_turn_id, session_id, request, text, tag, now),
            )
            .await?;
        if !request.memorize_only {
            self.relational
                .insert_turn(
                    &mut *tx,
                    &assistant_turn(session_id, &request.user_id, &reply_text, now),
                )
                .await?;
        }

        if write_memory {
            let memory = MemoryRecord {
                id: memory_id,
                user_id: request.user_id.clone(),
                content: text.to_owned(),
                valence: Some(tag.valence),
                status: MemoryStatus::Pending,
                conversation_id: Some(session_id),
                created_at: now,
                committed_at: None,
                metadata: serde_json::json!({}),
            };
            self.relational.insert_memory(&mut *tx, &memory).await?;

            let payload = OutboxPayload {
                memory_id,
                user_id: request.user_id.clone(),
                content: text.to_owned(),
                session_id: Some(session_id),
                observed_at: Some(now),
                eval_mode: request.eval_mode,
            };
            let event = OutboxEventRecord {
                id: Uuid::new_v4(),
                event_id: event_id_for(memory_id),
                memory_id: Some(memory_id),
                payload: serde_json::to_value(&payload).unwrap_or_default(),
                status: OutboxStatus::Pending,
                retry_count: 0,
                idempotency_key: request.idempotency_key.clone(),
                created_at: now,
                next_attempt_at: now,
                processing_started_at: None,
                vector_written_at: None,
                graph_written_at: None,
                processed_at: None,
                error_message: None,
            };
            self.relational.insert_outbox(&mut *tx, &event).await?;
            event_record = Some(event);
        }

        self.relational
            .insert_affinity_row(
                &mut *tx,
                &request.user_id,
                update.old_score,
                update.new_score,
                update.delta,
                "conversation",
                &serde_json::to_value(signals).unwrap_or_default(),
                now,
            )
            .await?;

        if let Some(key) = &request.idempotency_key {
            let cached = serde_json::to_value(&reply).unwrap_or_default();
            self.relational
                .insert_idempotency(
                    &mut *tx,
                    &request.user_id,
                    key,
                    Some(user_turn_id),
                    &cached,
                    now,
                    self.config.idempotency_ttl(),
                )
                .await?;
        }

        tx.commit().await.map_err(crate::store::StoreError::from)?;

        Ok(TurnArtifacts {
            reply,
            event: event_record,
        })
    }

    /// Assemble the affinity signal bundle for this turn.
    async fn build_signals(
        &self,
        request: &TurnRequest,
        tag: &EmotionTag,
        now: DateTime<Utc>,
    ) -> Result<Signals, EngineError> {
        let silence_days = match self.relational.last_turn_at(&request.user_id).await? {
            Some(last) => {
                let days = now.signed_duration_since(last).num_days();
                u32::try_from(days.max(0)).unwrap_or(u32::MAX)
            }
            None => 0,
        };
        let lower = request.text.to_lowercase();
        let correction = ["不对", "不是这样", "错了", "记错", "wrong", "incorrect"]
            .iter()
            .any(|w| lower.contains(w));
        let confirmation = !correction
            && ["没错", "对的", "是的", "exactly", "that's right"]
                .iter()
                .any(|w| lower.contains(w));

        Ok(Signals {
            user_initiated: true,
            emotion_valence: tag.valence,
            memory_confirmation: confirmation,
            correction,
            silence_days,
        })
    }

    fn session_lock(&self, session_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.session_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            locks
                .entry(session_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

fn user_turn(
    id: Uuid,
    session_id: Uuid,
    request: &TurnRequest,
    text: &str,
    tag: &EmotionTag,
    now: DateTime<Utc>,
) -> TurnRecord {
    TurnRecord {
        id,
        session_id,
        user_id: request.user_id.clone(),
        role: TurnRole::User,
        content: text.to_owned(),
        emotion_tag: Some(tag.primary.as_str().to_owned()),
        created_at: now,
    }
}

fn assistant_turn(
    session_id: Uuid,
    user_id: &str,
    reply_text: &str,
    now: DateTime<Utc>,
) -> TurnRecord {
    // Nudge the assistant turn one millisecond later so per-session
    // ordering by created_at stays strict.
    let created_at = now
        .checked_add_signed(chrono::Duration::milliseconds(1))
        .unwrap_or(now);
    TurnRecord {
        id: Uuid::new_v4(),
        session_id,
        user_id: user_id.to_owned(),
        role: TurnRole::Assistant,
        content: reply_text.to_owned(),
        emotion_tag: None,
        created_at,
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Split reply text into stream-sized chunks on char boundaries.
fn chunk_text(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    chars
        .chunks(STREAM_CHUNK_CHARS)
        .map(|c| c.iter().collect())
        .collect()
}
