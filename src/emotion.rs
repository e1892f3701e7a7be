//! Cheap emotion tagging from keyword heuristics.
//!
//! No oracle call: a small bilingual lexicon yields a primary label
//! and a valence in `[-1, 1]` good enough to steer tone selection and
//! the affinity update. The tag is advisory; nothing downstream
//! depends on it being exactly right.

use serde::{Deserialize, Serialize};

/// Primary emotion labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmotionLabel {
    /// Contentment or joy.
    Happy,
    /// Sadness or loss.
    Sad,
    /// Anger or frustration.
    Angry,
    /// Worry or stress.
    Anxious,
    /// High-arousal excitement.
    Excited,
    /// Nothing detected.
    Neutral,
}

impl EmotionLabel {
    /// Canonical string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Happy => "happy",
            Self::Sad => "sad",
            Self::Angry => "angry",
            Self::Anxious => "anxious",
            Self::Excited => "excited",
            Self::Neutral => "neutral",
        }
    }
}

/// An emotion reading for one turn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionTag {
    /// Primary label.
    pub primary: EmotionLabel,
    /// Valence in `[-1, 1]`.
    pub valence: f64,
    /// Heuristic confidence.
    pub confidence: f64,
}

impl EmotionTag {
    /// A neutral reading.
    pub fn neutral() -> Self {
        Self {
            primary: EmotionLabel::Neutral,
            valence: 0.0,
            confidence: 0.5,
        }
    }
}

struct Lexicon {
    label: EmotionLabel,
    valence: f64,
    words: &'static [&'static str],
}

const LEXICONS: [Lexicon; 5] = [
    Lexicon {
        label: EmotionLabel::Happy,
        valence: 0.6,
        words: &[
            "开心", "高兴", "快乐", "喜欢", "幸福", "满足", "不错", "很好",
            "happy", "glad", "great", "wonderful", "enjoy", "love",
        ],
    },
    Lexicon {
        label: EmotionLabel::Excited,
        valence: 0.8,
        words: &[
            "激动", "兴奋", "太棒了", "期待", "迫不及待",
            "excited", "thrilled", "can't wait", "amazing", "awesome",
        ],
    },
    Lexicon {
        label: EmotionLabel::Sad,
        valence: -0.6,
        words: &[
            "难过", "伤心", "失落", "哭", "孤独", "想念", "郁闷",
            "sad", "unhappy", "depressed", "lonely", "miss", "cry",
        ],
    },
    Lexicon {
        label: EmotionLabel::Angry,
        valence: -0.7,
        words: &[
            "生气", "愤怒", "讨厌", "烦死", "气死",
            "angry", "furious", "hate", "annoyed", "mad at",
        ],
    },
    Lexicon {
        label: EmotionLabel::Anxious,
        valence: -0.4,
        words: &[
            "焦虑", "紧张", "担心", "害怕", "压力",
            "anxious", "nervous", "worried", "afraid", "stressed",
        ],
    },
];

/// Tag the emotion of one text.
///
/// The strongest-matching lexicon wins; valence scales with the match
/// count and is clamped to `[-1, 1]`.
pub fn tag(text: &str) -> EmotionTag {
    let lower = text.to_lowercase();

    let mut best: Option<(&Lexicon, usize)> = None;
    for lexicon in &LEXICONS {
        let hits = lexicon
            .words
            .iter()
            .filter(|w| lower.contains(*w))
            .count();
        if hits > 0 && best.is_none_or(|(_, n)| hits > n) {
            best = Some((lexicon, hits));
        }
    }

    match best {
        Some((lexicon, hits)) => {
            #[allow(clippy::cast_precision_loss)] // hit counts are tiny
            let scale = 1.0 + 0.2 * (hits.saturating_sub(1)) as f64;
            EmotionTag {
                primary: lexicon.label,
                valence: (lexicon.valence * scale).clamp(-1.0, 1.0),
                confidence: 0.8,
            }
        }
        None => EmotionTag::neutral(),
    }
}
