//! Query entity extraction for graph retrieval.
//!
//! Deterministic first: quoted spans, capitalized English tokens, and
//! CJK runs, minus stop-words, capped at three anchors. The engine
//! falls back to a bounded oracle call only when nothing matches.
//! A small coastal gazetteer expands "seaside" queries to the cities
//! the graph actually stores.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::warn;

use crate::oracle::{Generator, OracleError};

/// Maximum anchors handed to the graph traversal.
const MAX_QUERY_ENTITIES: usize = 3;

const EN_STOPWORDS: [&str; 24] = [
    "the", "and", "but", "with", "that", "this", "what", "when", "where", "who", "why", "how",
    "did", "does", "have", "has", "was", "are", "you", "your", "about", "tell", "know", "remember",
];

const ZH_STOPWORDS: [&str; 22] = [
    "我们", "你们", "他们", "什么", "哪里", "怎么", "为什么", "多少", "知道", "记得", "告诉",
    "是不是", "是否", "还有", "没有", "有没有", "今天", "昨天", "明天", "最近", "可能", "大概",
];

/// Seaside cities for the semantic-expansion rule.
const COASTAL_GAZETTEER: [&str; 8] = [
    "大连", "青岛", "厦门", "三亚", "深圳", "Dalian", "Qingdao", "Xiamen",
];

struct QueryPatterns {
    quoted: Regex,
    capitalized: Regex,
    cjk_run: Regex,
}

fn patterns() -> &'static QueryPatterns {
    static PATTERNS: OnceLock<QueryPatterns> = OnceLock::new();
    PATTERNS.get_or_init(compile_patterns)
}

#[allow(clippy::unwrap_used)] // pattern literals are compile-time constants
fn compile_patterns() -> QueryPatterns {
    QueryPatterns {
        quoted: Regex::new(r#""([^"]{1,24})"|“([^”]{1,24})”|'([^']{1,24})'"#).unwrap(),
        capitalized: Regex::new(r"\b[A-Z][a-z]{1,20}\b").unwrap(),
        cjk_run: Regex::new(r"[\u{4e00}-\u{9fff}]{2,8}").unwrap(),
    }
}

/// Deterministically extract up to three query anchors.
pub fn extract_entities(query: &str) -> Vec<String> {
    let p = patterns();
    let mut out: Vec<String> = Vec::new();

    let mut push = |token: &str| {
        let t = token.trim();
        if t.is_empty() || out.iter().any(|existing| existing == t) {
            return;
        }
        out.push(t.to_owned());
    };

    for caps in p.quoted.captures_iter(query) {
        for i in 1..=3 {
            if let Some(m) = caps.get(i) {
                push(m.as_str());
            }
        }
    }

    for m in p.capitalized.find_iter(query) {
        let token = m.as_str();
        if !EN_STOPWORDS.contains(&token.to_lowercase().as_str()) {
            push(token);
        }
    }

    // CJK runs are whole clauses, not names; the graph seed match
    // checks containment in both directions, so a clause-sized anchor
    // still finds the entities named inside it.
    for m in p.cjk_run.find_iter(query) {
        let token = m.as_str();
        if !ZH_STOPWORDS.contains(&token) {
            push(token);
        }
    }

    out.truncate(MAX_QUERY_ENTITIES);
    out
}

/// Expand seaside wording into the coastal gazetteer.
pub fn semantic_expansions(query: &str) -> Vec<String> {
    let lower = query.to_lowercase();
    if query.contains("海边") || lower.contains("seaside") || lower.contains("coast") {
        COASTAL_GAZETTEER.iter().map(|s| (*s).to_owned()).collect()
    } else {
        Vec::new()
    }
}

/// Oracle fallback: ask the generator for a JSON array of entity
/// strings. Parse failures yield an empty list.
///
/// # Errors
///
/// Returns an error for transport failures or a blown deadline.
pub async fn extract_entities_oracle(
    generator: &dyn Generator,
    query: &str,
    timeout: Duration,
) -> Result<Vec<String>, OracleError> {
    let prompt = format!(
        "List the people, places, and things this message asks about as \
         a JSON array of short strings. Output ONLY the JSON array.\n\
         Message: {query}"
    );
    let response = tokio::time::timeout(timeout, generator.generate(&prompt, 128))
        .await
        .map_err(|_| OracleError::Timeout(timeout))??;

    let trimmed = response.trim();
    let json_text = match (trimmed.find('['), trimmed.rfind(']')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    };
    match serde_json::from_str::<Vec<String>>(json_text) {
        Ok(mut entities) => {
            entities.retain(|e| !e.trim().is_empty());
            entities.truncate(MAX_QUERY_ENTITIES);
            Ok(entities)
        }
        Err(err) => {
            warn!(error = %err, "failed to parse oracle entity list");
            Ok(Vec::new())
        }
    }
}
