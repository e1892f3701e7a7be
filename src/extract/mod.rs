//! Extraction pipeline: raw text → Intermediate Representation.
//!
//! Stages, in order:
//!
//! 1. [`rules`] — deterministic locale-aware patterns (low confidence).
//! 2. [`oracle`] — bounded generation-oracle call returning JSON.
//! 3. Merge — union entities by id, union relations by
//!    `(source, target, kind)` taking max confidence.
//! 4. [`facts`] — structured-fact augmentation (canonical temporal,
//!    duration, and quantity entities).
//! 5. [`critic`] — the only place open candidates become the closed
//!    IR ADT; everything invalid is dropped and counted.
//!
//! Questions bypass the pipeline entirely: asking never writes.

pub mod critic;
pub mod facts;
pub mod oracle;
pub mod quantity;
pub mod rules;
pub mod temporal;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::oracle::Generator;
use crate::types::{EntityKind, Ir, IrSource};

use self::critic::CriticStats;

/// An entity candidate before critic validation. The `kind` is an open
/// string; only the critic turns it into [`EntityKind`].
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateEntity {
    /// Proposed entity id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Open kind string.
    pub kind: String,
    /// Extractor confidence.
    pub confidence: f64,
    /// Whether this is the user node.
    pub is_user: bool,
    /// Type-specific attributes.
    pub attrs: serde_json::Map<String, serde_json::Value>,
}

impl CandidateEntity {
    /// Construct a candidate with a closed kind and no attributes.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: EntityKind,
        confidence: f64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: kind.as_str().to_owned(),
            confidence,
            is_user: false,
            attrs: serde_json::Map::new(),
        }
    }
}

/// A relation candidate before critic validation.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRelation {
    /// Source entity id.
    pub source_id: String,
    /// Target entity id.
    pub target_id: String,
    /// Open kind string (upper-snake by convention).
    pub kind: String,
    /// Extractor confidence.
    pub confidence: f64,
    /// Proposed initial weight.
    pub weight: Option<f64>,
    /// Short evidence description.
    pub desc: Option<String>,
}

/// The un-vetted output of one or more extractors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidates {
    /// Entity candidates.
    pub entities: Vec<CandidateEntity>,
    /// Relation candidates.
    pub relations: Vec<CandidateRelation>,
}

impl Candidates {
    /// Union another candidate set into this one: entities by id
    /// (first occurrence wins, confidence takes the max), relations by
    /// `(source, target, kind)` likewise.
    pub fn merge(&mut self, other: Candidates) {
        for entity in other.entities {
            match self.entities.iter_mut().find(|e| e.id == entity.id) {
                Some(existing) => {
                    existing.confidence = existing.confidence.max(entity.confidence);
                    for (k, v) in entity.attrs {
                        existing.attrs.entry(k).or_insert(v);
                    }
                }
                None => self.entities.push(entity),
            }
        }
        for relation in other.relations {
            match self.relations.iter_mut().find(|r| {
                r.source_id == relation.source_id
                    && r.target_id == relation.target_id
                    && r.kind == relation.kind
            }) {
                Some(existing) => {
                    existing.confidence = existing.confidence.max(relation.confidence);
                }
                None => self.relations.push(relation),
            }
        }
    }
}

/// Slugify a canonical name into a deterministic entity id:
/// lowercase, punctuation stripped, whitespace runs collapsed to `_`.
/// CJK characters pass through unchanged.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = true;
    for ch in name.trim().to_lowercase().chars() {
        if ch.is_alphanumeric() || ('\u{4e00}'..='\u{9fff}').contains(&ch) {
            out.push(ch);
            last_sep = false;
        } else if !last_sep {
            out.push('_');
            last_sep = true;
        }
    }
    let trimmed = out.trim_matches('_').to_owned();
    if trimmed.is_empty() {
        "unknown".to_owned()
    } else {
        trimmed
    }
}

/// Stable hashed id for synthesized entities: a type prefix plus the
/// truncated digest of the canonical name.
pub fn stable_entity_id(kind: EntityKind, name: &str) -> String {
    let digest = Sha256::digest(name.trim().as_bytes());
    let mut hex = String::with_capacity(12);
    for byte in digest.iter().take(6) {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("{}_{hex}", kind.prefix())
}

/// Result of running the full extraction pipeline on one text.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionOutcome {
    /// The vetted IR.
    pub ir: Ir,
    /// Per-reason filter counts from the critic.
    pub stats: CriticStats,
}

/// The full extraction pipeline.
pub struct Extractor {
    generator: Option<Arc<dyn Generator>>,
    oracle_timeout: std::time::Duration,
    strict: bool,
}

impl std::fmt::Debug for Extractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extractor")
            .field("oracle", &self.generator.is_some())
            .field("strict", &self.strict)
            .finish()
    }
}

impl Extractor {
    /// Create a pipeline. Without a generator only the deterministic
    /// stages run.
    pub fn new(
        generator: Option<Arc<dyn Generator>>,
        oracle_timeout: std::time::Duration,
        strict: bool,
    ) -> Self {
        Self {
            generator,
            oracle_timeout,
            strict,
        }
    }

    /// Run the pipeline on one text.
    ///
    /// `anchor` resolves relative temporal expressions ("yesterday").
    /// Questions yield an empty IR: detection happens here as well as
    /// in the conversation core, so a question that reaches the
    /// drainer still writes nothing to the graph.
    pub async fn extract(&self, text: &str, anchor: DateTime<Utc>) -> ExtractionOutcome {
        if rules::is_question(text) || text.trim().is_empty() {
            return ExtractionOutcome {
                ir: Ir::empty(IrSource::Rules),
                stats: CriticStats::default(),
            };
        }

        let (mut candidates, rule_confidence) = rules::extract(text);

        let mut oracle_confidence = 0.0;
        if let Some(generator) = &self.generator {
            match oracle::extract(generator.as_ref(), text, self.oracle_timeout).await {
                Ok((oracle_candidates, confidence)) => {
                    oracle_confidence = confidence;
                    candidates.merge(oracle_candidates);
                }
                Err(err) => {
                    warn!(error = %err, "oracle extraction failed; continuing with rules only");
                }
            }
        }

        // Structured facts refine an extraction; they never invent one.
        // An utterance neither extractor understood stays empty rather
        // than growing time/quantity edges anchored at nothing.
        if !candidates.entities.is_empty() || !candidates.relations.is_empty() {
            facts::augment(&mut candidates, text, anchor);
        }

        let (ir, stats) = critic::critique(candidates, self.strict);
        let overall = rule_confidence.max(oracle_confidence).max(0.0);
        let ir = Ir {
            overall_confidence: overall,
            source: IrSource::Merged,
            ..ir
        };

        debug!(
            entities = ir.entities.len(),
            relations = ir.relations.len(),
            confidence = overall,
            "extraction complete"
        );
        ExtractionOutcome { ir, stats }
    }
}
