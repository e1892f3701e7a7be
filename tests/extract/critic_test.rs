//! Tests for `src/extract/critic.rs` — the filter from open
//! candidates into the closed IR.

use kindred::extract::critic::critique;
use kindred::extract::{CandidateEntity, CandidateRelation, Candidates};
use kindred::types::{EntityKind, RelationKind};

fn entity(id: &str, kind: &str, confidence: f64) -> CandidateEntity {
    CandidateEntity {
        id: id.to_owned(),
        name: id.to_owned(),
        kind: kind.to_owned(),
        confidence,
        is_user: false,
        attrs: serde_json::Map::new(),
    }
}

fn relation(source: &str, target: &str, kind: &str, confidence: f64) -> CandidateRelation {
    CandidateRelation {
        source_id: source.to_owned(),
        target_id: target.to_owned(),
        kind: kind.to_owned(),
        confidence,
        weight: None,
        desc: None,
    }
}

#[test]
fn low_confidence_entries_are_dropped() {
    let candidates = Candidates {
        entities: vec![entity("tea", "Preference", 0.3), entity("erya", "Person", 0.9)],
        relations: vec![relation("user", "erya", "FRIEND_OF", 0.2)],
    };
    let (ir, stats) = critique(candidates, false);

    assert_eq!(ir.entities.iter().filter(|e| !e.is_user).count(), 1);
    assert_eq!(stats.low_confidence_entities, 1);
    assert!(ir.relations.is_empty());
    assert_eq!(stats.low_confidence_relations, 1);
}

#[test]
fn strict_mode_raises_the_bar() {
    let candidates = Candidates {
        entities: vec![entity("tea", "Preference", 0.6)],
        relations: vec![],
    };
    let (ir, _) = critique(candidates.clone(), false);
    assert_eq!(ir.entities.len(), 1);

    let (ir, stats) = critique(candidates, true);
    assert!(ir.entities.is_empty());
    assert_eq!(stats.low_confidence_entities, 1);
}

#[test]
fn unknown_kinds_are_dropped() {
    let candidates = Candidates {
        entities: vec![entity("x", "Planet", 0.9), entity("erya", "Person", 0.9)],
        relations: vec![
            relation("user", "erya", "SOULMATE_OF", 0.9),
            relation("user", "erya", "FRIEND_OF", 0.9),
        ],
    };
    let (ir, stats) = critique(candidates, false);

    assert_eq!(stats.invalid_kind_entities, 1);
    assert_eq!(stats.invalid_kind_relations, 1);
    assert_eq!(ir.relations.len(), 1);
    assert_eq!(ir.relations[0].kind, RelationKind::FriendOf);
}

#[test]
fn relation_kind_parsing_is_case_insensitive() {
    let candidates = Candidates {
        entities: vec![entity("erya", "Person", 0.9)],
        relations: vec![relation("user", "erya", "friend_of", 0.9)],
    };
    let (ir, _) = critique(candidates, false);
    assert_eq!(ir.relations.len(), 1);
    assert_eq!(ir.relations[0].kind, RelationKind::FriendOf);
}

#[test]
fn self_loops_and_dangling_endpoints_are_dropped() {
    let candidates = Candidates {
        entities: vec![entity("erya", "Person", 0.9)],
        relations: vec![
            relation("erya", "erya", "FRIEND_OF", 0.9),
            relation("erya", "ghost", "FRIEND_OF", 0.9),
            relation("ghost", "erya", "FRIEND_OF", 0.9),
        ],
    };
    let (ir, stats) = critique(candidates, false);

    assert!(ir.relations.is_empty());
    assert_eq!(stats.self_loop_relations, 1);
    assert_eq!(stats.dangling_relations, 2);
}

#[test]
fn duplicates_keep_the_first_entry() {
    let candidates = Candidates {
        entities: vec![
            entity("erya", "Person", 0.9),
            entity("erya", "Location", 0.8),
        ],
        relations: vec![
            relation("user", "erya", "FRIEND_OF", 0.9),
            relation("user", "erya", "FRIEND_OF", 0.7),
        ],
    };
    let (ir, stats) = critique(candidates, false);

    let kept: Vec<_> = ir.entities.iter().filter(|e| !e.is_user).collect();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].kind, EntityKind::Person);
    assert_eq!(stats.duplicate_entities, 1);
    assert_eq!(ir.relations.len(), 1);
    assert_eq!(stats.duplicate_relations, 1);
}

#[test]
fn empty_names_are_dropped() {
    let candidates = Candidates {
        entities: vec![CandidateEntity {
            id: "blank".to_owned(),
            name: "   ".to_owned(),
            kind: "Person".to_owned(),
            confidence: 0.9,
            is_user: false,
            attrs: serde_json::Map::new(),
        }],
        relations: vec![],
    };
    let (ir, stats) = critique(candidates, false);
    assert!(ir.entities.is_empty());
    assert_eq!(stats.empty_name_entities, 1);
}

#[test]
fn the_user_node_is_always_admitted() {
    let mut low_confidence_user = entity("user", "Person", 0.0);
    low_confidence_user.is_user = true;
    let candidates = Candidates {
        entities: vec![low_confidence_user, entity("erya", "Person", 0.9)],
        relations: vec![relation("user", "erya", "FRIEND_OF", 0.9)],
    };
    let (ir, _) = critique(candidates, false);

    assert!(ir.entities.iter().any(|e| e.is_user));
    assert_eq!(ir.relations.len(), 1);
}

#[test]
fn the_user_node_is_injected_when_an_edge_needs_it() {
    let candidates = Candidates {
        entities: vec![entity("erya", "Person", 0.9)],
        relations: vec![relation("user", "erya", "FRIEND_OF", 0.9)],
    };
    let (ir, _) = critique(candidates, false);
    assert!(
        ir.entities.iter().any(|e| e.is_user),
        "a kept edge referencing the user implies the user node"
    );
}

#[test]
fn stats_totals_reconcile() {
    let candidates = Candidates {
        entities: vec![
            entity("a", "Person", 0.9),
            entity("b", "Planet", 0.9),
            entity("c", "Person", 0.1),
        ],
        relations: vec![relation("a", "a", "FRIEND_OF", 0.9)],
    };
    let (ir, stats) = critique(candidates, false);

    assert_eq!(stats.input_entities, 3);
    assert_eq!(stats.output_entities, ir.entities.len());
    assert_eq!(stats.filtered_entities(), 2);
    assert_eq!(stats.filtered_relations(), 1);
}
