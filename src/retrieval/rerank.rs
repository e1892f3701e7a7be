//! Unified re-ranking of vector hits and graph facts.
//!
//! One scoring function fuses cosine similarity, decayed edge weight
//! reached through provenance, recency, and an affinity bonus. The
//! most-recent boost implements the recency-first conflict rule; the
//! question intent gate suppresses it so a user's own question text
//! cannot outrank the facts that answer it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::store::vector::VectorHit;
use crate::types::GraphFact;

/// Flat boost for memories younger than seven days.
const MOST_RECENT_BOOST: f64 = 0.15;

/// Age window for the most-recent boost, in days.
const MOST_RECENT_WINDOW_DAYS: f64 = 7.0;

/// Recency half-life divisor in days.
const RECENCY_SCALE_DAYS: f64 = 30.0;

/// A memory after unified re-ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedMemory {
    /// Memory id.
    pub id: Uuid,
    /// Memory content.
    pub content: String,
    /// Fused score.
    pub score: f64,
    /// Raw cosine similarity component.
    pub cosine: f64,
    /// Stored valence.
    pub valence: Option<f64>,
    /// Memory creation time.
    pub created_at: DateTime<Utc>,
}

/// Fuse vector hits and graph facts into one ranked memory list.
pub fn rerank(
    hits: &[VectorHit],
    facts: &[GraphFact],
    affinity_score: f64,
    is_question: bool,
    now: DateTime<Utc>,
    config: &RetrievalConfig,
) -> Vec<RankedMemory> {
    // Sum of effective edge weights per evidencing memory.
    let mut edge_weight: HashMap<Uuid, f64> = HashMap::new();
    for fact in facts {
        for memory_id in &fact.provenance {
            let entry = edge_weight.entry(*memory_id).or_insert(0.0);
            *entry += fact.weight;
        }
    }

    let mut ranked: Vec<RankedMemory> = hits
        .iter()
        .map(|hit| {
            let age_days = age_in_days(hit.created_at, now);
            let recency = (-age_days / RECENCY_SCALE_DAYS).exp();
            let edges = edge_weight.get(&hit.memory_id).copied().unwrap_or(0.0).min(1.0);

            let mut score = config.w_cos * hit.cosine
                + config.w_edge * edges
                + config.w_rec * recency
                + config.w_aff * affinity_bonus(hit.valence, affinity_score);

            if !is_question && age_days <= MOST_RECENT_WINDOW_DAYS {
                score += MOST_RECENT_BOOST;
            }

            RankedMemory {
                id: hit.memory_id,
                content: hit.content.clone(),
                score,
                cosine: hit.cosine,
                valence: hit.valence,
                created_at: hit.created_at,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.created_at.cmp(&a.created_at))
    });
    ranked.truncate(config.top_k);
    ranked
}

/// Positive-valence memories earn a bonus scaled by affinity; neutral
/// and negative valence earn none.
fn affinity_bonus(valence: Option<f64>, affinity_score: f64) -> f64 {
    match valence {
        Some(v) if v > 0.0 => v * affinity_score.clamp(0.0, 1.0),
        _ => 0.0,
    }
}

fn age_in_days(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let elapsed = now.signed_duration_since(created_at);
    #[allow(clippy::cast_precision_loss)] // millisecond counts fit f64
    let days = elapsed.num_milliseconds() as f64 / 86_400_000.0;
    days.max(0.0)
}
