//! Tests for `src/extract/rules.rs` — question detection and the
//! deterministic pattern extractor.

use kindred::extract::rules::{extract, is_question};

#[test]
fn question_detection_covers_both_locales() {
    assert!(is_question("谁去沈阳旅游过"));
    assert!(is_question("你还记得我喜欢什么吗"));
    assert!(is_question("Where does Erya live?"));
    assert!(is_question("what did I tell you yesterday"));

    assert!(!is_question("我喜欢茶"));
    assert!(!is_question("Erya lives in Dalian."));
    assert!(!is_question("line one\nline two?"));
}

#[test]
fn questions_yield_no_candidates() {
    let (candidates, confidence) = extract("谁去沈阳旅游过");
    assert!(candidates.entities.is_empty());
    assert!(candidates.relations.is_empty());
    assert_eq!(confidence, 0.0);
}

#[test]
fn chinese_preference_patterns() {
    let (candidates, confidence) = extract("我喜欢茶");
    assert!(confidence > 0.0);
    assert!(
        candidates
            .relations
            .iter()
            .any(|r| r.kind == "LIKES" && r.source_id == "user"),
        "我 should resolve to the user node"
    );

    let (candidates, _) = extract("我不喜欢咖啡");
    assert!(candidates.relations.iter().any(|r| r.kind == "DISLIKES"));
    assert!(
        !candidates.relations.iter().any(|r| r.kind == "LIKES"),
        "不喜欢 must not also fire the 喜欢 pattern"
    );
}

#[test]
fn chinese_location_and_family_patterns() {
    let (candidates, _) = extract("昊哥住在大连");
    assert!(candidates
        .relations
        .iter()
        .any(|r| r.kind == "LIVES_IN" && r.target_id == "大连"));
    assert!(candidates
        .entities
        .iter()
        .any(|e| e.name == "大连" && e.kind == "Location"));

    let (candidates, _) = extract("小明的妈妈很温柔");
    assert!(candidates
        .relations
        .iter()
        .any(|r| r.kind == "PARENT_OF" && r.target_id == "小明"));
}

#[test]
fn travel_companion_pattern_links_user_to_both() {
    let (candidates, _) = extract("我和二丫去过沈阳旅游");
    assert!(candidates
        .relations
        .iter()
        .any(|r| r.kind == "FRIEND_OF" && r.source_id == "user" && r.target_id == "二丫"));
    assert!(candidates
        .relations
        .iter()
        .any(|r| r.kind == "RELATED_TO" && r.source_id == "user" && r.target_id == "沈阳"));
    assert!(candidates
        .entities
        .iter()
        .any(|e| e.id == "沈阳" && e.kind == "Location"));
}

#[test]
fn english_patterns_with_speaker_resolution() {
    let (candidates, _) = extract("Melanie lives in Boston");
    assert!(candidates
        .relations
        .iter()
        .any(|r| r.kind == "LIVES_IN" && r.target_id == "boston"));

    let (candidates, _) = extract("Caroline: I went to the farmers market yesterday");
    assert!(
        candidates
            .entities
            .iter()
            .any(|e| e.name == "farmers market" && e.kind == "Event"),
        "trailing temporal words must be stripped from the event name"
    );
    assert!(candidates
        .relations
        .iter()
        .any(|r| r.kind == "RELATED_TO" && r.source_id == "caroline"));
}

#[test]
fn coworker_phrasing_maps_to_colleague_of() {
    let (candidates, _) = extract("张sir是我同事");
    assert!(candidates
        .relations
        .iter()
        .any(|r| r.kind == "COLLEAGUE_OF" && r.source_id == "user"));
}

#[test]
fn rule_entries_carry_low_confidence() {
    let (candidates, confidence) = extract("我喜欢茶");
    assert!((confidence - 0.55).abs() < 1e-9);
    for relation in &candidates.relations {
        assert!((relation.confidence - 0.55).abs() < 1e-9);
    }
}
