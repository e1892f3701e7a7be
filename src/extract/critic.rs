//! IR critic: the total function from open extraction candidates into
//! the closed IR ADT.
//!
//! The critic is a filter, never an enhancer: better to miss a fact
//! than to write a wrong one. Every drop is counted by reason so the
//! extraction pipeline stays observable.

use std::collections::HashSet;

use tracing::debug;

use crate::types::{EntityKind, Ir, IrEntity, IrRelation, IrSource, RelationKind, USER_ENTITY_ID};

use super::{CandidateRelation, Candidates};

/// Confidence threshold below which entries are dropped.
pub const CONFIDENCE_THRESHOLD: f64 = 0.5;

/// Stricter threshold used when the caller requests strict mode.
pub const STRICT_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Per-reason drop counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CriticStats {
    /// Entities before filtering.
    pub input_entities: usize,
    /// Relations before filtering.
    pub input_relations: usize,
    /// Entities dropped for low confidence.
    pub low_confidence_entities: usize,
    /// Entities dropped for an unknown kind.
    pub invalid_kind_entities: usize,
    /// Entities dropped as duplicate ids.
    pub duplicate_entities: usize,
    /// Entities dropped for an empty name.
    pub empty_name_entities: usize,
    /// Relations dropped as self-loops.
    pub self_loop_relations: usize,
    /// Relations dropped for low confidence.
    pub low_confidence_relations: usize,
    /// Relations dropped for an unknown kind.
    pub invalid_kind_relations: usize,
    /// Relations dropped because an endpoint did not survive.
    pub dangling_relations: usize,
    /// Relations dropped as duplicates of a kept edge.
    pub duplicate_relations: usize,
    /// Entities kept.
    pub output_entities: usize,
    /// Relations kept.
    pub output_relations: usize,
}

impl CriticStats {
    /// Total entities dropped.
    pub fn filtered_entities(&self) -> usize {
        self.input_entities.saturating_sub(self.output_entities)
    }

    /// Total relations dropped.
    pub fn filtered_relations(&self) -> usize {
        self.input_relations.saturating_sub(self.output_relations)
    }
}

/// Validate candidates into a closed IR.
///
/// Order matters: entities are vetted first so relation endpoint
/// checks run against the surviving set. The user node is always
/// admitted, and is injected if a kept relation references it without
/// the extractors having emitted it.
pub fn critique(candidates: Candidates, strict: bool) -> (Ir, CriticStats) {
    let threshold = if strict {
        STRICT_CONFIDENCE_THRESHOLD
    } else {
        CONFIDENCE_THRESHOLD
    };

    let mut stats = CriticStats {
        input_entities: candidates.entities.len(),
        input_relations: candidates.relations.len(),
        ..CriticStats::default()
    };

    let mut entities: Vec<IrEntity> = Vec::new();
    let mut seen_ids: HashSet<String> = HashSet::new();

    for candidate in candidates.entities {
        // The user node is always kept, whatever its stated confidence.
        if candidate.is_user || candidate.id == USER_ENTITY_ID {
            if seen_ids.insert(USER_ENTITY_ID.to_owned()) {
                entities.push(IrEntity::user());
            }
            continue;
        }
        if candidate.confidence < threshold {
            stats.low_confidence_entities = stats.low_confidence_entities.saturating_add(1);
            continue;
        }
        let Some(kind) = EntityKind::parse(&candidate.kind) else {
            stats.invalid_kind_entities = stats.invalid_kind_entities.saturating_add(1);
            continue;
        };
        if seen_ids.contains(&candidate.id) {
            stats.duplicate_entities = stats.duplicate_entities.saturating_add(1);
            continue;
        }
        if candidate.name.trim().is_empty() {
            stats.empty_name_entities = stats.empty_name_entities.saturating_add(1);
            continue;
        }
        seen_ids.insert(candidate.id.clone());
        entities.push(IrEntity {
            id: candidate.id,
            name: candidate.name,
            kind,
            confidence: candidate.confidence,
            is_user: false,
            attrs: candidate.attrs,
        });
    }

    let mut relations: Vec<IrRelation> = Vec::new();
    let mut seen_edges: HashSet<(String, String, RelationKind)> = HashSet::new();
    let mut user_referenced = false;

    for candidate in candidates.relations {
        if candidate.source_id == candidate.target_id {
            stats.self_loop_relations = stats.self_loop_relations.saturating_add(1);
            continue;
        }
        if candidate.confidence < threshold {
            stats.low_confidence_relations = stats.low_confidence_relations.saturating_add(1);
            continue;
        }
        let Some(kind) = RelationKind::parse(&candidate.kind) else {
            stats.invalid_kind_relations = stats.invalid_kind_relations.saturating_add(1);
            continue;
        };
        if !endpoint_ok(&candidate, &seen_ids, true)
            || !endpoint_ok(&candidate, &seen_ids, false)
        {
            stats.dangling_relations = stats.dangling_relations.saturating_add(1);
            continue;
        }
        let key = (candidate.source_id.clone(), candidate.target_id.clone(), kind);
        if !seen_edges.insert(key) {
            stats.duplicate_relations = stats.duplicate_relations.saturating_add(1);
            continue;
        }
        user_referenced = user_referenced
            || candidate.source_id == USER_ENTITY_ID
            || candidate.target_id == USER_ENTITY_ID;
        relations.push(IrRelation {
            source_id: candidate.source_id,
            target_id: candidate.target_id,
            kind,
            confidence: candidate.confidence,
            weight: candidate.weight,
            desc: candidate.desc,
        });
    }

    if user_referenced && !seen_ids.contains(USER_ENTITY_ID) {
        entities.push(IrEntity::user());
    }

    stats.output_entities = entities.len();
    stats.output_relations = relations.len();

    debug!(
        entities_in = stats.input_entities,
        entities_out = stats.output_entities,
        relations_in = stats.input_relations,
        relations_out = stats.output_relations,
        "critic pass complete"
    );

    (
        Ir {
            entities,
            relations,
            source: IrSource::Merged,
            overall_confidence: 0.0,
        },
        stats,
    )
}

/// Endpoint existence check; the user id is always acceptable.
fn endpoint_ok(relation: &CandidateRelation, kept: &HashSet<String>, source: bool) -> bool {
    let id = if source {
        &relation.source_id
    } else {
        &relation.target_id
    };
    id == USER_ENTITY_ID || kept.contains(id)
}
