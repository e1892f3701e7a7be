//! Reply prompt construction and tone selection.
//!
//! Retrieval output is rendered as natural language rather than
//! structured data: "二丫是你的朋友", not an edge triple. This keeps
//! the generation oracle grounded without sounding like it is reading
//! a database.

use std::collections::BTreeMap;

use crate::affinity::AffinityState;
use crate::retrieval::RankedMemory;
use crate::store::relational::{TurnRecord, TurnRole};
use crate::types::{GraphFact, RelationKind};

/// Memories included in the prompt's memory section.
const PROMPT_MEMORY_LIMIT: usize = 3;

/// History turns included in the prompt.
const PROMPT_HISTORY_LIMIT: usize = 6;

/// The reply tone derived from affinity state.
pub fn tone_type(state: AffinityState) -> &'static str {
    match state {
        AffinityState::Stranger => "polite",
        AffinityState::Acquaintance => "friendly",
        AffinityState::Friend => "warm",
        AffinityState::CloseFriend => "affectionate",
        AffinityState::BestFriend => "intimate",
    }
}

/// Tone guidance injected into the prompt.
fn tone_hint(score: f64) -> &'static str {
    if score >= 0.7 {
        "你们是很亲密的朋友，可以用轻松、亲切的语气，偶尔开开玩笑。"
    } else if score >= 0.4 {
        "你们是朋友，用友好、温暖的语气交流。"
    } else {
        "你们还不太熟，保持礼貌、友善的语气。"
    }
}

/// Build the reply prompt.
pub fn build(
    message: &str,
    memories: &[RankedMemory],
    facts: &[GraphFact],
    history: &[TurnRecord],
    affinity_score: f64,
) -> String {
    let memory_context = format_memories(memories, facts);
    let history_context = format_history(history);
    let hint = tone_hint(affinity_score);

    format!(
        "你是一个温暖、善解人意的 AI 陪伴助手。\n\n\
         ## 你对用户的了解\n\n{memory_context}\n\n\
         ## 最近的对话\n\n{history_context}\n\n\
         ## 当前对话\n\n用户: {message}\n\n\
         ## 回复指南\n\n{hint}\n\
         请自然、真诚地回复用户。如果不确定某些信息，可以坦诚说不记得，并询问用户。\n\n\
         现在请回复用户的消息："
    )
}

/// The fixed acknowledgement used when the caller asked to memorize
/// without a reply.
pub fn memorize_ack() -> String {
    "好的，我记住了。".to_owned()
}

/// Render graph facts and memories as natural-language knowledge.
fn format_memories(memories: &[RankedMemory], facts: &[GraphFact]) -> String {
    if memories.is_empty() && facts.is_empty() {
        return "（你还没有告诉我太多关于你的事情）".to_owned();
    }

    let mut parts: Vec<String> = Vec::new();

    // Group facts by their anchor entity so each person or place reads
    // as one line.
    let mut grouped: BTreeMap<&str, Vec<&GraphFact>> = BTreeMap::new();
    for fact in facts {
        grouped.entry(fact.entity_name.as_str()).or_default().push(fact);
    }
    for (entity, entity_facts) in grouped {
        let mut descriptions: Vec<String> = Vec::new();
        for fact in entity_facts {
            descriptions.push(describe_fact(fact));
        }
        if !descriptions.is_empty() {
            parts.push(format!("关于{entity}：{}", descriptions.join("、")));
        }
    }

    if !memories.is_empty() {
        parts.push("\n你之前还提到过：".to_owned());
        for memory in memories.iter().take(PROMPT_MEMORY_LIMIT) {
            parts.push(format!("- {}", memory.content));
        }
    }

    if parts.is_empty() {
        "（暂无相关记忆）".to_owned()
    } else {
        parts.join("\n")
    }
}

/// One fact as a natural-language phrase.
fn describe_fact(fact: &GraphFact) -> String {
    let subject = if fact.entity_id == "user" {
        "你".to_owned()
    } else {
        fact.entity_name.clone()
    };
    let target = &fact.target_name;
    match fact.relation {
        RelationKind::FriendOf => format!("{target}是{subject}的朋友"),
        RelationKind::CousinOf => format!("{target}是{subject}的表亲"),
        RelationKind::SiblingOf => format!("{target}是{subject}的兄弟姐妹"),
        RelationKind::ParentOf => format!("{subject}是{target}的家长"),
        RelationKind::ChildOf => format!("{subject}是{target}的孩子"),
        RelationKind::Family => format!("{subject}和{target}是一家人"),
        RelationKind::ColleagueOf => format!("{target}是{subject}的同事"),
        RelationKind::ClassmateOf => format!("{target}是{subject}的同学"),
        RelationKind::LivesIn => format!("{subject}住在{target}"),
        RelationKind::From => format!("{subject}来自{target}"),
        RelationKind::WorksAt => format!("{subject}在{target}工作"),
        RelationKind::Likes => format!("{subject}喜欢{target}"),
        RelationKind::Dislikes => format!("{subject}不喜欢{target}"),
        RelationKind::HappenedAt => format!("发生在{target}"),
        RelationKind::HappenedBetween => format!("发生在{target}期间"),
        RelationKind::Lasted => format!("持续了{target}"),
        RelationKind::Cost => format!("花费了{target}"),
        RelationKind::Is => format!("{subject}是{target}"),
        RelationKind::Researched => format!("{subject}研究过{target}"),
        RelationKind::Shares => format!("{subject}和别人共有{target}"),
        RelationKind::PlansTo => format!("{subject}打算{target}"),
        RelationKind::RelatedTo => format!("{subject}和{target}有关"),
    }
}

/// Render recent history as alternating speaker lines.
fn format_history(history: &[TurnRecord]) -> String {
    if history.is_empty() {
        return "（这是你们的第一次对话）".to_owned();
    }
    let start = history.len().saturating_sub(PROMPT_HISTORY_LIMIT);
    history[start..]
        .iter()
        .map(|turn| match turn.role {
            TurnRole::User => format!("用户: {}", turn.content),
            TurnRole::Assistant => format!("助手: {}", turn.content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
