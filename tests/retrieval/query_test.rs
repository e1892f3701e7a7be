//! Tests for `src/retrieval/query.rs` — query anchors and the
//! coastal gazetteer.

use kindred::retrieval::query::{extract_entities, semantic_expansions};

#[test]
fn capitalized_english_tokens_become_anchors() {
    let anchors = extract_entities("Does Melanie still live in Boston");
    assert!(anchors.contains(&"Melanie".to_owned()));
    assert!(anchors.contains(&"Boston".to_owned()));
}

#[test]
fn wh_words_are_not_anchors() {
    let anchors = extract_entities("Where did I go last week");
    assert!(!anchors.iter().any(|a| a == "Where"));
}

#[test]
fn cjk_runs_become_anchors() {
    let anchors = extract_entities("谁去沈阳旅游过");
    assert!(anchors.iter().any(|a| a == "沈阳" || a.contains("沈阳")));
}

#[test]
fn quoted_spans_win_first() {
    let anchors = extract_entities("你还记得\"那家小店\"吗");
    assert_eq!(anchors.first().map(String::as_str), Some("那家小店"));
}

#[test]
fn anchors_are_capped_at_three() {
    let anchors = extract_entities("Alice Bob Carol Dave Erin");
    assert_eq!(anchors.len(), 3);
}

#[test]
fn seaside_queries_expand_to_coastal_cities() {
    let expansions = semantic_expansions("我认识的人谁住在海边");
    assert!(expansions.iter().any(|c| c == "大连"));

    let expansions = semantic_expansions("who lives by the seaside");
    assert!(expansions.iter().any(|c| c == "Dalian"));

    assert!(semantic_expansions("我喜欢茶").is_empty());
}
