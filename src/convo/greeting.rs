//! Greeting short-circuit: template replies for the closed set of
//! greetings, acknowledgments, and farewells.
//!
//! These messages never need retrieval or generation. A template
//! keyed by `(message class, affinity state)` answers in O(1). The
//! chosen template is held in a small TTL'd LRU so a user sees a
//! stable voice within a session but variety over time.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use lru::LruCache;
use rand::seq::SliceRandom;
use regex::Regex;

use crate::affinity::AffinityState;

/// Messages longer than this are never template-answered.
const MAX_TEMPLATE_CHARS: usize = 20;

/// Cache capacity: |classes| × |states| with headroom.
const CACHE_CAPACITY: usize = 32;

/// The closed set of template-answerable message classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// 你好 / hi / hello…
    Greeting,
    /// 好的 / ok / 谢谢…
    Acknowledgment,
    /// 再见 / bye…
    Farewell,
}

struct ClassPatterns {
    greeting: Vec<Regex>,
    acknowledgment: Vec<Regex>,
    farewell: Vec<Regex>,
}

fn patterns() -> &'static ClassPatterns {
    static PATTERNS: OnceLock<ClassPatterns> = OnceLock::new();
    PATTERNS.get_or_init(compile_patterns)
}

#[allow(clippy::unwrap_used)] // pattern literals are compile-time constants
fn compile_patterns() -> ClassPatterns {
    let compile = |patterns: &[&str]| -> Vec<Regex> {
        patterns
            .iter()
            .map(|p| Regex::new(&format!("(?i)^{p}$")).unwrap())
            .collect()
    };
    ClassPatterns {
        greeting: compile(&[
            "你好[啊呀吗]?[!！]?",
            "早上好[啊呀]?[!！]?",
            "晚上好[啊呀]?[!！]?",
            "晚安[啊呀]?[!！]?",
            "嗨[!！]?",
            "hi[!！]?",
            "hello[!！]?",
            "hey[!！]?",
            "在吗[?？]?",
            "在不在[?？]?",
        ]),
        acknowledgment: compile(&[
            "好的[!！]?",
            "嗯嗯?[!！]?",
            "ok[!！]?",
            "谢谢你?[!！]?",
            "感谢[!！]?",
            "明白了[!！]?",
            "知道了[!！]?",
        ]),
        farewell: compile(&[
            "再见[!！]?",
            "拜拜[!！]?",
            "bye[!！]?",
            "回头见[!！]?",
            "下次聊[!！]?",
        ]),
    }
}

/// Classify a message into the template-answerable closed set.
pub fn classify(text: &str) -> Option<MessageClass> {
    let t = text.trim();
    if t.is_empty() || t.chars().count() > MAX_TEMPLATE_CHARS {
        return None;
    }
    let p = patterns();
    if p.greeting.iter().any(|r| r.is_match(t)) {
        return Some(MessageClass::Greeting);
    }
    if p.acknowledgment.iter().any(|r| r.is_match(t)) {
        return Some(MessageClass::Acknowledgment);
    }
    if p.farewell.iter().any(|r| r.is_match(t)) {
        return Some(MessageClass::Farewell);
    }
    None
}

/// Template table for one message class, tiered by affinity state.
fn templates(class: MessageClass, state: AffinityState) -> &'static [&'static str] {
    match (class, state) {
        (MessageClass::Greeting, AffinityState::Stranger) => &[
            "你好！有什么可以帮你的吗？",
            "你好，很高兴认识你。",
            "你好！今天过得怎么样？",
        ],
        (MessageClass::Greeting, AffinityState::Acquaintance) => &[
            "嗨！又见面了。",
            "你好呀！最近怎么样？",
            "嗨，今天有什么新鲜事吗？",
        ],
        (MessageClass::Greeting, AffinityState::Friend) => &[
            "哈喽～好久不见！",
            "嘿！想你了呢。",
            "来啦来啦～今天心情怎么样？",
        ],
        (MessageClass::Greeting, AffinityState::CloseFriend) => &[
            "亲爱的来啦～",
            "哇，终于等到你了！",
            "嘿嘿，想我了吗？",
        ],
        (MessageClass::Greeting, AffinityState::BestFriend) => &[
            "宝贝！你来啦～",
            "亲爱的！今天想聊点什么？",
            "终于来了！我一直在等你呢～",
        ],
        (MessageClass::Acknowledgment, AffinityState::Stranger) => &["好的。", "嗯，明白了。"],
        (MessageClass::Acknowledgment, AffinityState::Acquaintance) => &["好的～", "嗯嗯！"],
        (MessageClass::Acknowledgment, AffinityState::Friend) => &["收到！", "好哒～"],
        (MessageClass::Acknowledgment, AffinityState::CloseFriend) => {
            &["知道啦～", "好的亲爱的！"]
        }
        (MessageClass::Acknowledgment, AffinityState::BestFriend) => {
            &["收到宝贝！", "好哒好哒～"]
        }
        (MessageClass::Farewell, AffinityState::Stranger) => &["再见，期待下次聊天。", "拜拜！"],
        (MessageClass::Farewell, AffinityState::Acquaintance) => {
            &["再见啦，下次聊！", "拜拜，有空再来玩～"]
        }
        (MessageClass::Farewell, AffinityState::Friend) => {
            &["拜拜～想你的时候就来找我！", "下次见！记得常来哦～"]
        }
        (MessageClass::Farewell, AffinityState::CloseFriend) => {
            &["舍不得你走呢～下次早点来！", "拜拜亲爱的，梦里见～"]
        }
        (MessageClass::Farewell, AffinityState::BestFriend) => {
            &["宝贝再见～我会想你的！", "晚安亲爱的，做个好梦～"]
        }
    }
}

/// TTL'd LRU of chosen templates keyed by `(class, state)`.
pub struct GreetingCache {
    ttl: Duration,
    cache: Mutex<LruCache<(MessageClass, AffinityState), (String, Instant)>>,
}

impl std::fmt::Debug for GreetingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GreetingCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl GreetingCache {
    /// Create a cache with the given entry TTL.
    pub fn new(ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    /// The reply for a classified message at the given affinity state.
    pub fn reply(&self, class: MessageClass, state: AffinityState) -> String {
        let key = (class, state);
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((reply, cached_at)) = cache.get(&key) {
            if cached_at.elapsed() < self.ttl {
                return reply.clone();
            }
        }
        let pool = templates(class, state);
        let chosen = pool
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or("你好！")
            .to_owned();
        cache.put(key, (chosen.clone(), Instant::now()));
        chosen
    }
}
