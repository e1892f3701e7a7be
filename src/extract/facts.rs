//! Structured-fact augmentation: canonical temporal, duration,
//! quantity, and subject-verb-object facts synthesized on top of the
//! extractor output.
//!
//! Everything added here is canonical (ISO 8601 dates, whole seconds,
//! fixed units) so repeated mentions merge onto the same graph nodes.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::types::{EntityKind, RelationKind, USER_ENTITY_ID};

use super::temporal::{extract_constraints, parse_duration_seconds};
use super::{quantity, stable_entity_id, CandidateEntity, CandidateRelation, Candidates};

struct SvoPatterns {
    is_a: Regex,
    likes: Regex,
    researched: Regex,
    plans_to: Regex,
    pair_commonality: Regex,
}

fn patterns() -> &'static SvoPatterns {
    static PATTERNS: OnceLock<SvoPatterns> = OnceLock::new();
    PATTERNS.get_or_init(compile_patterns)
}

#[allow(clippy::unwrap_used)] // pattern literals are compile-time constants
fn compile_patterns() -> SvoPatterns {
    SvoPatterns {
        is_a: Regex::new(r"(?i)\b(?:i am|i'm|i was)\s+(?:a |an |the )?\s*([^.,;!?\n]+)").unwrap(),
        likes: Regex::new(r"(?i)\b(?:i like|i love|i enjoy)\s+([^.,;!?\n]+)").unwrap(),
        researched: Regex::new(
            r"(?i)\b(?:i researched|i research|i looked up|i was researching)\s+([^.,;!?\n]+)",
        )
        .unwrap(),
        plans_to: Regex::new(
            r"(?i)\b(?:i decided to|i plan to|i'm going to|i am going to|i want to)\s+([^.,;!?\n]+)",
        )
        .unwrap(),
        pair_commonality: Regex::new(
            r"\b([A-Z][a-z]{1,20})\s+and\s+([A-Z][a-z]{1,20})\b.{0,120}\b(?:both|each)\b\s*(.{0,120})",
        )
        .unwrap(),
    }
}

/// Augment candidates with canonical structured facts from the text.
///
/// Temporal constraints attach to the first event entity when one
/// exists, else to the user node. Quantities in CNY become `COST`
/// edges; all other units become `RELATED_TO`.
pub fn augment(out: &mut Candidates, text: &str, anchor: DateTime<Utc>) {
    let event_id = out
        .entities
        .iter()
        .find(|e| e.kind == EntityKind::Event.as_str() && e.id != USER_ENTITY_ID)
        .map(|e| e.id.clone());
    let anchor_id = event_id
        .clone()
        .unwrap_or_else(|| USER_ENTITY_ID.to_owned());

    for constraint in extract_constraints(text, anchor) {
        let start = constraint.start.clone();
        match constraint.end {
            Some(end) if end != start => {
                let rid = format!(
                    "timerange_{}_{}",
                    start.replace('-', ""),
                    end.replace('-', "")
                );
                add_entity_once(out, || {
                    let mut e = CandidateEntity::new(
                        rid.clone(),
                        format!("{start}..{end}"),
                        EntityKind::TimeRange,
                        1.0,
                    );
                    e.attrs.insert("start".into(), start.clone().into());
                    e.attrs.insert("end".into(), end.clone().into());
                    e.attrs
                        .insert("precision".into(), constraint.precision.as_str().into());
                    e
                });
                out.relations.push(CandidateRelation {
                    source_id: anchor_id.clone(),
                    target_id: rid,
                    kind: RelationKind::HappenedBetween.as_str().to_owned(),
                    confidence: 0.9,
                    weight: Some(0.75),
                    desc: Some(format!("{anchor_id} happened between {start} and {end}")),
                });
                if let Some(event_id) = &event_id {
                    set_event_attr(out, event_id, "start_date", start.clone());
                    set_event_attr(out, event_id, "end_date", end.clone());
                }
            }
            _ => {
                let tid = format!("time_{}", start.replace('-', ""));
                add_entity_once(out, || {
                    let mut e =
                        CandidateEntity::new(tid.clone(), start.clone(), EntityKind::TimeExpression, 1.0);
                    e.attrs.insert("value".into(), start.clone().into());
                    e.attrs
                        .insert("precision".into(), constraint.precision.as_str().into());
                    e
                });
                out.relations.push(CandidateRelation {
                    source_id: anchor_id.clone(),
                    target_id: tid,
                    kind: RelationKind::HappenedAt.as_str().to_owned(),
                    confidence: 0.9,
                    weight: Some(0.8),
                    desc: Some(format!("{anchor_id} happened at {start}")),
                });
                if let Some(event_id) = &event_id {
                    set_event_attr(out, event_id, "start_date", start.clone());
                    set_event_attr(out, event_id, "end_date", start.clone());
                }
            }
        }
    }

    if let Some(seconds) = parse_duration_seconds(text) {
        let did = format!("duration_{seconds}");
        add_entity_once(out, || {
            let mut e =
                CandidateEntity::new(did.clone(), format!("{seconds}s"), EntityKind::Duration, 1.0);
            e.attrs.insert("seconds".into(), seconds.into());
            e
        });
        out.relations.push(CandidateRelation {
            source_id: anchor_id.clone(),
            target_id: did,
            kind: RelationKind::Lasted.as_str().to_owned(),
            confidence: 0.9,
            weight: Some(0.8),
            desc: Some(format!("{anchor_id} lasted {seconds}s")),
        });
        if let Some(event_id) = &event_id {
            set_event_attr(out, event_id, "duration_seconds", seconds);
        }
    }

    let mut cost_written = false;
    for q in quantity::extract(text) {
        #[allow(clippy::cast_possible_truncation)] // cents for id formatting only
        let cents = (q.value * 100.0).round() as i64;
        let qid = format!("qty_{}_{cents}", slug_unit(q.unit));
        add_entity_once(out, || {
            let mut e = CandidateEntity::new(
                qid.clone(),
                format!("{}{}", q.value, q.unit),
                EntityKind::Quantity,
                1.0,
            );
            e.attrs.insert("value".into(), q.value.into());
            e.attrs.insert("unit".into(), q.unit.into());
            e
        });
        let kind = if q.unit == "CNY" {
            RelationKind::Cost
        } else {
            RelationKind::RelatedTo
        };
        out.relations.push(CandidateRelation {
            source_id: anchor_id.clone(),
            target_id: qid,
            kind: kind.as_str().to_owned(),
            confidence: 0.9,
            weight: Some(0.7),
            desc: Some(format!("{anchor_id} {} {}{}", kind.as_str(), q.value, q.unit)),
        });
        if let Some(event_id) = &event_id {
            if q.unit == "CNY" && !cost_written {
                set_event_attr(out, event_id, "cost_value", q.value);
                set_event_attr(out, event_id, "cost_unit", "CNY");
                cost_written = true;
            }
        }
    }

    augment_svo(out, text);
}

/// Canonical SVO facts: identity, preference, research, and plan
/// statements, plus pair-commonality (`X and Y both …`).
///
/// A `Name: body` prefix names the subject; otherwise first-person
/// statements attach to the user node.
fn augment_svo(out: &mut Candidates, text: &str) {
    let p = patterns();
    let (speaker, body) = split_speaker(text);

    let subject_id = |out: &mut Candidates| -> String {
        match &speaker {
            Some(name) => {
                let id = stable_entity_id(EntityKind::Person, name);
                add_entity_once(out, || {
                    CandidateEntity::new(id.clone(), name.clone(), EntityKind::Person, 0.7)
                });
                id
            }
            None => USER_ENTITY_ID.to_owned(),
        }
    };

    let cases: [(&Regex, RelationKind, EntityKind, f64); 4] = [
        (&p.is_a, RelationKind::Is, EntityKind::Other, 0.75),
        (&p.likes, RelationKind::Likes, EntityKind::Preference, 0.7),
        (&p.researched, RelationKind::Researched, EntityKind::Other, 0.7),
        (&p.plans_to, RelationKind::PlansTo, EntityKind::Other, 0.65),
    ];
    for (regex, relation, object_kind, certainty) in cases {
        if let Some(c) = regex.captures(body) {
            let object = c[1].trim().to_owned();
            if object.is_empty() {
                continue;
            }
            let sid = subject_id(out);
            let oid = stable_entity_id(object_kind, &object);
            add_entity_once(out, || {
                CandidateEntity::new(oid.clone(), object.clone(), object_kind, certainty)
            });
            out.relations.push(CandidateRelation {
                source_id: sid,
                target_id: oid,
                kind: relation.as_str().to_owned(),
                confidence: certainty,
                weight: Some(0.7),
                desc: Some(truncate(text, 300)),
            });
        }
    }

    if let Some(c) = p.pair_commonality.captures(body) {
        let a = c[1].trim().to_owned();
        let b = c[2].trim().to_owned();
        let trait_text = c[3].trim().trim_matches(['.', ',', ':', ';', '!', '-']).to_owned();
        if !trait_text.is_empty() {
            let tid = stable_entity_id(EntityKind::Other, &trait_text);
            add_entity_once(out, || {
                CandidateEntity::new(tid.clone(), trait_text.clone(), EntityKind::Other, 0.6)
            });
            for name in [a, b] {
                let pid = stable_entity_id(EntityKind::Person, &name);
                add_entity_once(out, || {
                    CandidateEntity::new(pid.clone(), name.clone(), EntityKind::Person, 0.6)
                });
                out.relations.push(CandidateRelation {
                    source_id: pid,
                    target_id: tid.clone(),
                    kind: RelationKind::Shares.as_str().to_owned(),
                    confidence: 0.6,
                    weight: Some(0.6),
                    desc: Some(truncate(body, 120)),
                });
            }
        }
    }
}

/// Split a leading `Name:` speaker prefix off the text.
fn split_speaker(text: &str) -> (Option<String>, &str) {
    let t = text.trim();
    if let Some((left, right)) = t.split_once(':') {
        let name = left.trim();
        let count = name.chars().count();
        if (1..=32).contains(&count) && !name.contains('\n') {
            return (Some(name.to_owned()), right.trim());
        }
    }
    (None, t)
}

fn add_entity_once(out: &mut Candidates, make: impl FnOnce() -> CandidateEntity) {
    let entity = make();
    if !out.entities.iter().any(|e| e.id == entity.id) {
        out.entities.push(entity);
    }
}

fn set_event_attr(
    out: &mut Candidates,
    event_id: &str,
    key: &str,
    value: impl Into<serde_json::Value>,
) {
    if let Some(event) = out.entities.iter_mut().find(|e| e.id == event_id) {
        event.attrs.insert(key.to_owned(), value.into());
    }
}

fn slug_unit(unit: &str) -> String {
    match unit {
        "%" => "pct".to_owned(),
        "°C" => "celsius".to_owned(),
        other => other.to_lowercase(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
