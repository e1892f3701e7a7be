//! Deterministic rule extractor and question detection.
//!
//! Locale-aware patterns for the statements users actually make to a
//! companion: where someone lives, where they are from, what they like
//! or dislike, family and coworker mentions, and simple
//! subject-verb-object event sentences. Everything emitted here is
//! low-confidence (0.55); the oracle path refines or confirms it.

use std::sync::OnceLock;

use regex::Regex;

use crate::types::{EntityKind, RelationKind, USER_ENTITY_ID};

use super::{slugify, CandidateEntity, CandidateRelation, Candidates};

/// Confidence assigned to every rule-extracted entry.
const RULE_CONFIDENCE: f64 = 0.55;

/// Texts at or above this length are never classified as questions.
const QUESTION_MAX_LEN: usize = 160;

fn regexes() -> &'static RulePatterns {
    static PATTERNS: OnceLock<RulePatterns> = OnceLock::new();
    PATTERNS.get_or_init(RulePatterns::compile)
}

struct RulePatterns {
    speaker_meta: Regex,
    speaker: Regex,
    zh_lives_in: Regex,
    zh_from: Regex,
    zh_dislikes: Regex,
    zh_hates: Regex,
    zh_likes: Regex,
    zh_parent: Regex,
    zh_colleague: Regex,
    zh_went_with: Regex,
    en_lives_in: Regex,
    en_from: Regex,
    en_dislikes: Regex,
    en_likes: Regex,
    en_colleague: Regex,
    en_went_to: Regex,
    en_ran: Regex,
    en_painted: Regex,
    trailing_time: Vec<Regex>,
}

impl RulePatterns {
    #[allow(clippy::unwrap_used)] // pattern literals are compile-time constants
    fn compile() -> Self {
        let name = r"[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*";
        Self {
            speaker_meta: Regex::new(r"^\[(?P<meta>.*?)\]\s*(?P<speaker>[^:]{1,40})\s*:\s*(?P<body>.*)$").unwrap(),
            speaker: Regex::new(r"^(?P<speaker>[^:]{1,40})\s*:\s*(?P<body>.*)$").unwrap(),
            zh_lives_in: Regex::new(r"([^\s:：]{1,20})\s*住在了?\s*([^\s，。,.\n]{1,20})").unwrap(),
            zh_from: Regex::new(r"([^\s:：]{1,20})\s*(?:来自|从)\s*([^\s，。,.\n]{1,20})").unwrap(),
            zh_dislikes: Regex::new(r"([^\s:：]{1,20})\s*不喜欢\s*([^\s，。,.\n]{1,30})").unwrap(),
            zh_hates: Regex::new(r"([^\s:：]{1,20})\s*讨厌\s*([^\s，。,.\n]{1,30})").unwrap(),
            zh_likes: Regex::new(r"([^\s:：]{1,20})\s*喜欢\s*([^\s，。,.\n]{1,30})").unwrap(),
            zh_parent: Regex::new(r"([^\s:：]{1,20})的(妈妈|母亲|爸爸|父亲)").unwrap(),
            zh_colleague: Regex::new(r"([^\s:：]{1,20})\s*是我(?:的)?同事").unwrap(),
            zh_went_with: Regex::new(
                r"我和([\u{4e00}-\u{9fff}A-Za-z0-9]{1,10})(?:一起)?去过?([\u{4e00}-\u{9fff}]{1,10}?)(?:旅游|旅行|玩|溜达)",
            )
            .unwrap(),
            en_lives_in: Regex::new(&format!(r"\b({name})\s+lives\s+in\s+({name})\b")).unwrap(),
            en_from: Regex::new(&format!(r"\b({name})\s+is\s+from\s+({name})\b")).unwrap(),
            en_dislikes: Regex::new(&format!(
                r"\b({name})\s+does\s+not\s+like\s+([A-Za-z0-9][^,.\n]{{1,40}})"
            ))
            .unwrap(),
            en_likes: Regex::new(&format!(r"\b({name})\s+likes\s+([A-Za-z0-9][^,.\n]{{1,40}})"))
                .unwrap(),
            en_colleague: Regex::new(&format!(r"\b({name})\s+is\s+my\s+(?:coworker|colleague)\b"))
                .unwrap(),
            en_went_to: Regex::new(&format!(
                r"(?i)\b(i|{name})\s+went\s+to\s+(?:an?\s+|the\s+)?([^,.\n!?！？;；:：]{{3,100}})"
            ))
            .unwrap(),
            en_ran: Regex::new(&format!(
                r"(?i)\b(i|{name})\s+ran\s+(?:an?\s+)?([^,.\n!?！？;；:：]{{3,100}})"
            ))
            .unwrap(),
            en_painted: Regex::new(&format!(
                r"(?i)\b(i|{name})\s+painted\s+([^,.\n!?！？;；:：]{{3,140}})"
            ))
            .unwrap(),
            trailing_time: vec![
                Regex::new(r"(?i)\s+(?:yesterday|today|tomorrow)\s*$").unwrap(),
                Regex::new(r"(?i)\s+last\s+(?:year|month|week)\s*$").unwrap(),
                Regex::new(r"(?i)\s+next\s+(?:year|month)\s*$").unwrap(),
                Regex::new(r"(?i)\s+(?:few|\d+)\s+weeks?\s+ago\s*$").unwrap(),
                Regex::new(
                    r"(?i)\s+last\s+(?:monday|tuesday|wednesday|thursday|friday|saturday|sunday)\s*$",
                )
                .unwrap(),
                Regex::new(r"\s*(?:昨天|今天|明天|去年|明年|上个月|下个月|上上周|上周[一二三四五六日天]?|前几周|几周前)\s*$").unwrap(),
            ],
        }
    }
}

/// Classify a text as a question.
///
/// Single-line texts ending in `?`/`？`, or short texts containing a
/// wh-word (en) or a question particle (zh).
pub fn is_question(text: &str) -> bool {
    let t = text.trim();
    if t.is_empty() || t.contains('\n') {
        return false;
    }
    if t.contains('?') || t.contains('？') {
        return t.ends_with('?') || t.ends_with('？');
    }
    let low = t.to_lowercase();
    const WH: [&str; 6] = ["who", "what", "when", "where", "why", "how"];
    if WH.iter().any(|w| low.contains(w)) {
        return t.chars().count() < QUESTION_MAX_LEN;
    }
    const ZH: [&str; 10] = [
        "吗", "呢", "是否", "是不是", "谁", "什么", "哪里", "怎么", "为什么", "多少",
    ];
    if ZH.iter().any(|w| t.contains(w)) {
        return t.chars().count() < QUESTION_MAX_LEN;
    }
    false
}

/// Run the rule extractor over one text.
///
/// Returns the candidates and the rule confidence: 0.55 when at least
/// one relation was found, 0.0 otherwise. Questions yield nothing.
pub fn extract(text: &str) -> (Candidates, f64) {
    let mut out = Candidates::default();
    if is_question(text) {
        return (out, 0.0);
    }
    let t = text.trim();
    if t.is_empty() {
        return (out, 0.0);
    }

    let patterns = regexes();
    for line in t.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(caps) = patterns.speaker_meta.captures(line) {
            let speaker = caps.name("speaker").map_or("", |m| m.as_str()).trim();
            let body = caps.name("body").map_or("", |m| m.as_str()).trim();
            let meta = caps.name("meta").map_or("", |m| m.as_str()).trim();
            if !meta.is_empty() && !body.is_empty() {
                handle_sentence(&mut out, &format!("{body} ({meta})"), speaker);
            } else {
                handle_sentence(&mut out, body, speaker);
            }
            continue;
        }
        if let Some(caps) = patterns.speaker.captures(line) {
            let speaker = caps.name("speaker").map_or("", |m| m.as_str()).trim();
            let body = caps.name("body").map_or("", |m| m.as_str()).trim();
            handle_sentence(&mut out, body, speaker);
            continue;
        }
        handle_sentence(&mut out, line, "");
    }

    let confidence = if out.relations.is_empty() {
        0.0
    } else {
        RULE_CONFIDENCE
    };
    (out, confidence)
}

fn handle_sentence(out: &mut Candidates, sentence: &str, speaker: &str) {
    let s = sentence.trim();
    if s.is_empty() || is_question(s) {
        return;
    }
    let patterns = regexes();

    let resolve = |name: &str| -> String {
        let n = name.trim();
        if n.eq_ignore_ascii_case("i") || n == "我" {
            if speaker.is_empty() {
                return USER_ENTITY_ID.to_owned();
            }
            return speaker.to_owned();
        }
        n.to_owned()
    };

    if let Some(c) = patterns.zh_lives_in.captures(s) {
        let p = resolve(&c[1]);
        let loc = c[2].to_owned();
        link(out, &p, EntityKind::Person, &loc, EntityKind::Location, RelationKind::LivesIn, &format!("{p}住在{loc}"));
    }
    if let Some(c) = patterns.zh_from.captures(s) {
        let p = resolve(&c[1]);
        let loc = c[2].to_owned();
        link(out, &p, EntityKind::Person, &loc, EntityKind::Location, RelationKind::From, &format!("{p}来自{loc}"));
    }
    if let Some(c) = patterns.zh_dislikes.captures(s) {
        let p = resolve(&c[1]);
        let thing = c[2].to_owned();
        link(out, &p, EntityKind::Person, &thing, EntityKind::Preference, RelationKind::Dislikes, &format!("{p}不喜欢{thing}"));
    }
    if let Some(c) = patterns.zh_hates.captures(s) {
        let p = resolve(&c[1]);
        let thing = c[2].to_owned();
        link(out, &p, EntityKind::Person, &thing, EntityKind::Preference, RelationKind::Dislikes, &format!("{p}讨厌{thing}"));
    }
    if !s.contains("不喜欢") {
        if let Some(c) = patterns.zh_likes.captures(s) {
            let p = resolve(&c[1]);
            let thing = c[2].to_owned();
            link(out, &p, EntityKind::Person, &thing, EntityKind::Preference, RelationKind::Likes, &format!("{p}喜欢{thing}"));
        }
    }
    if let Some(c) = patterns.zh_parent.captures(s) {
        let child = c[1].to_owned();
        let parent_name = format!("{}的{}", child, &c[2]);
        link(out, &parent_name, EntityKind::Person, &child, EntityKind::Person, RelationKind::ParentOf, &parent_name);
    }
    if let Some(c) = patterns.zh_colleague.captures(s) {
        let p = c[1].to_owned();
        link(out, USER_ENTITY_ID, EntityKind::Person, &p, EntityKind::Person, RelationKind::ColleagueOf, &format!("{p}是我同事"));
    }
    if let Some(c) = patterns.zh_went_with.captures(s) {
        let companion = c[1].to_owned();
        let place = c[2].to_owned();
        link(out, USER_ENTITY_ID, EntityKind::Person, &companion, EntityKind::Person, RelationKind::FriendOf, &format!("我和{companion}一起出行"));
        link(out, USER_ENTITY_ID, EntityKind::Person, &place, EntityKind::Location, RelationKind::RelatedTo, &format!("我去过{place}"));
    }

    if let Some(c) = patterns.en_lives_in.captures(s) {
        let p = c[1].to_owned();
        let loc = c[2].to_owned();
        link(out, &p, EntityKind::Person, &loc, EntityKind::Location, RelationKind::LivesIn, &format!("{p} lives in {loc}"));
    }
    if let Some(c) = patterns.en_from.captures(s) {
        let p = c[1].to_owned();
        let loc = c[2].to_owned();
        link(out, &p, EntityKind::Person, &loc, EntityKind::Location, RelationKind::From, &format!("{p} is from {loc}"));
    }
    if let Some(c) = patterns.en_dislikes.captures(s) {
        let p = c[1].to_owned();
        let thing = c[2].trim().to_owned();
        link(out, &p, EntityKind::Person, &thing, EntityKind::Preference, RelationKind::Dislikes, &format!("{p} does not like {thing}"));
    }
    if !s.to_lowercase().contains("does not like") {
        if let Some(c) = patterns.en_likes.captures(s) {
            let p = c[1].to_owned();
            let thing = c[2].trim().to_owned();
            link(out, &p, EntityKind::Person, &thing, EntityKind::Preference, RelationKind::Likes, &format!("{p} likes {thing}"));
        }
    }
    if let Some(c) = patterns.en_colleague.captures(s) {
        let p = c[1].to_owned();
        link(out, USER_ENTITY_ID, EntityKind::Person, &p, EntityKind::Person, RelationKind::ColleagueOf, &format!("{p} is my coworker"));
    }

    for (pattern, verb) in [
        (&patterns.en_went_to, "went to"),
        (&patterns.en_ran, "ran"),
        (&patterns.en_painted, "painted"),
    ] {
        if let Some(c) = pattern.captures(s) {
            let p = resolve(&c[1]);
            let event = clean_event_name(c[2].trim());
            link(out, &p, EntityKind::Person, &event, EntityKind::Event, RelationKind::RelatedTo, &format!("{p} {verb} {event}"));
        }
    }
}

/// Strip trailing temporal phrases from an event name so that
/// "the market yesterday" and "the market" canonicalize identically.
fn clean_event_name(name: &str) -> String {
    let mut n = name
        .trim()
        .trim_matches(|c: char| "\"'“”‘’ \t".contains(c))
        .trim_end_matches(['。', '！', '？', '!', '?', '，', ','])
        .to_owned();
    for pattern in &regexes().trailing_time {
        n = pattern.replace(&n, "").trim().to_owned();
    }
    if n.is_empty() {
        name.trim().to_owned()
    } else {
        n
    }
}

/// Add both endpoints and the relation in one step.
fn link(
    out: &mut Candidates,
    source_name: &str,
    source_kind: EntityKind,
    target_name: &str,
    target_kind: EntityKind,
    relation: RelationKind,
    desc: &str,
) {
    let source_id = add_entity(out, source_name, source_kind);
    let target_id = add_entity(out, target_name, target_kind);
    if source_id == target_id {
        return;
    }
    out.relations.push(CandidateRelation {
        source_id,
        target_id,
        kind: relation.as_str().to_owned(),
        confidence: RULE_CONFIDENCE,
        weight: Some(RULE_CONFIDENCE),
        desc: Some(desc.to_owned()),
    });
}

fn add_entity(out: &mut Candidates, name: &str, kind: EntityKind) -> String {
    if name == USER_ENTITY_ID {
        if !out.entities.iter().any(|e| e.id == USER_ENTITY_ID) {
            let mut user = CandidateEntity::new(USER_ENTITY_ID, USER_ENTITY_ID, EntityKind::Person, 1.0);
            user.is_user = true;
            out.entities.push(user);
        }
        return USER_ENTITY_ID.to_owned();
    }
    let id = slugify(name);
    if !out.entities.iter().any(|e| e.id == id) {
        out.entities
            .push(CandidateEntity::new(id.clone(), name, kind, RULE_CONFIDENCE));
    }
    id
}
