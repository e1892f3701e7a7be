//! Conflict detection between memories: opposite-polarity statements
//! about a shared topic.
//!
//! Detection is lexical: a small dictionary of opposite pairs plus
//! topic-set intersection. Resolution is recency-first: when the two
//! memories are at least a day apart the newer one wins and the older
//! is deprecated; same-day contradictions are surfaced for the user to
//! clarify instead of being guessed at.

use std::collections::HashSet;
use std::sync::OnceLock;

use chrono::Duration;
use regex::Regex;

use crate::store::relational::MemoryRecord;

/// Minimum age gap for silent supersession.
pub fn supersede_min_gap() -> Duration {
    Duration::days(1)
}

/// Opposite-polarity word pairs, Chinese and English.
const OPPOSITE_PAIRS: [(&str, &str); 11] = [
    ("喜欢", "讨厌"),
    ("喜欢", "不喜欢"),
    ("爱", "恨"),
    ("想要", "不想要"),
    ("需要", "不需要"),
    ("是", "不是"),
    ("有", "没有"),
    ("like", "dislike"),
    ("like", "hate"),
    ("love", "hate"),
    ("want", "don't want"),
];

const ZH_STOPWORDS: [&str; 27] = [
    "这个", "那个", "这些", "那些", "真的", "其实", "感觉", "可能", "应该", "今天", "昨天",
    "明天", "最近", "一直", "有点", "非常", "特别", "因为", "所以", "但是", "而且", "并且",
    "同时", "如果", "我们", "你们", "他们",
];

const EN_STOPWORDS: [&str; 16] = [
    "the", "and", "but", "with", "that", "this", "have", "has", "was", "are", "for", "not",
    "really", "very", "just", "don't",
];

/// A detected conflict between two memories.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// The earlier memory.
    pub older: MemoryRecord,
    /// The later memory.
    pub newer: MemoryRecord,
    /// Topics both memories mention.
    pub common_topics: Vec<String>,
    /// The opposite pair that fired, joined as `a/b`.
    pub opposite_pair: String,
    /// Detection confidence in `[0.5, 0.95]`.
    pub confidence: f64,
}

/// How a conflict should be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Deprecate the older memory, keep the newer.
    SupersedeOlder,
    /// Too close in time to guess; ask the user.
    AskToClarify,
}

impl Conflict {
    /// Pick a resolution policy by the age gap.
    pub fn resolve(&self) -> Resolution {
        let gap = self
            .newer
            .created_at
            .signed_duration_since(self.older.created_at);
        if gap >= supersede_min_gap() {
            Resolution::SupersedeOlder
        } else {
            Resolution::AskToClarify
        }
    }

    /// Render the clarification prompt shown to the user.
    pub fn clarification_text(&self) -> String {
        format!(
            "我记得你之前说过两件有点矛盾的事：\n1. {}\n2. {}\n能帮我确认一下现在哪个是对的吗？",
            self.older.content, self.newer.content
        )
    }
}

/// Check a new memory against a set of earlier ones.
///
/// Returns conflicts above the confidence threshold (default policy:
/// 0.8), newest-gap first.
pub fn detect_against(
    candidate: &MemoryRecord,
    earlier: &[MemoryRecord],
    threshold: f64,
) -> Vec<Conflict> {
    let mut out = Vec::new();
    for memory in earlier {
        if memory.id == candidate.id {
            continue;
        }
        if let Some(conflict) = check_pair(memory, candidate) {
            if conflict.confidence >= threshold {
                out.push(conflict);
            }
        }
    }
    out
}

/// Check one pair of memories for an opposite-polarity conflict.
pub fn check_pair(a: &MemoryRecord, b: &MemoryRecord) -> Option<Conflict> {
    let content_a = a.content.to_lowercase();
    let content_b = b.content.to_lowercase();

    let pair = OPPOSITE_PAIRS.iter().find(|(w1, w2)| {
        (contains_word(&content_a, w1) && contains_word(&content_b, w2))
            || (contains_word(&content_a, w2) && contains_word(&content_b, w1))
    })?;

    let topics_a = extract_topics(&content_a);
    let topics_b = extract_topics(&content_b);
    let mut common: Vec<String> = topics_a.intersection(&topics_b).cloned().collect();
    if common.is_empty() {
        return None;
    }
    common.sort();

    let (older, newer) = if a.created_at <= b.created_at {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    };

    Some(Conflict {
        older,
        newer,
        confidence: estimate_confidence(&topics_a, &topics_b),
        common_topics: common,
        opposite_pair: format!("{}/{}", pair.0, pair.1),
    })
}

/// Word containment: substring for CJK pairs, word-boundary-ish for
/// ASCII so "like" does not fire inside "dislike".
fn contains_word(text: &str, word: &str) -> bool {
    if word.is_ascii() {
        text.split(|c: char| !c.is_ascii_alphanumeric() && c != '\'')
            .any(|t| t == word)
            || (word.contains(' ') && text.contains(word))
    } else {
        text.contains(word)
    }
}

fn topic_regexes() -> &'static (Regex, Regex, Regex) {
    static REGEXES: OnceLock<(Regex, Regex, Regex)> = OnceLock::new();
    REGEXES.get_or_init(compile_topic_regexes)
}

#[allow(clippy::unwrap_used)] // pattern literals are compile-time constants
fn compile_topic_regexes() -> (Regex, Regex, Regex) {
    (
        Regex::new(
            r"(喜欢|不喜欢|讨厌|爱|恨|想要|不想要|需要|不需要|来自|住在|生活在|工作在|工作于|在)\s*([^\n，。！？!?;；,]{1,24})",
        )
        .unwrap(),
        Regex::new(r"[\u{4e00}-\u{9fff}]{2,8}").unwrap(),
        Regex::new(r"[A-Za-z][A-Za-z0-9_-]{2,24}").unwrap(),
    )
}

/// Extract the topic set of one memory text.
fn extract_topics(text: &str) -> HashSet<String> {
    let (trigger, cjk_runs, ascii_tokens) = topic_regexes();
    let mut topics = HashSet::new();

    for caps in trigger.captures_iter(text) {
        let mut object = caps[2].trim().to_owned();
        for prefix in ["吃", "喝", "玩", "看", "听", "做", "去", "学", "练", "跑", "打", "写"] {
            if let Some(rest) = object.strip_prefix(prefix) {
                object = rest.trim().to_owned();
                break;
            }
        }
        object.retain(|c| !"\"'“”‘’ ".contains(c));
        if !object.is_empty() && !ZH_STOPWORDS.contains(&object.as_str()) {
            topics.insert(object);
        }
    }

    for m in cjk_runs.find_iter(text) {
        let token = m.as_str();
        if !ZH_STOPWORDS.contains(&token) {
            topics.insert(token.to_owned());
        }
    }

    for m in ascii_tokens.find_iter(text) {
        let token = m.as_str().to_lowercase();
        if !EN_STOPWORDS.contains(&token.as_str())
            && !["like", "dislike", "love", "hate"].contains(&token.as_str())
        {
            topics.insert(token);
        }
    }

    topics
}

/// Confidence from the topic overlap ratio: `0.75 + overlap * 0.25`,
/// clamped to `[0.5, 0.95]`.
fn estimate_confidence(topics_a: &HashSet<String>, topics_b: &HashSet<String>) -> f64 {
    if topics_a.is_empty() || topics_b.is_empty() {
        return 0.6;
    }
    let common = topics_a.intersection(topics_b).count();
    let larger = topics_a.len().max(topics_b.len()).max(1);
    #[allow(clippy::cast_precision_loss)] // topic counts are tiny
    let overlap = common as f64 / larger as f64;
    (0.75 + overlap * 0.25).clamp(0.5, 0.95)
}
