//! Affinity: a bounded scalar relationship score per user.
//!
//! The score lives in `[0, 1]` (0.5 for a brand-new user) and moves by
//! at most ±0.1 per turn from a small signal bundle. Derived states at
//! fixed cut-points drive tone selection and greeting templates; a
//! state transition is surfaced as a lifecycle event value that the
//! proactive subsystem (out of scope here) may consume.

use serde::{Deserialize, Serialize};

/// Default score for a user with no affinity history.
pub const DEFAULT_SCORE: f64 = 0.5;

/// Per-update delta clamp.
pub const MAX_DELTA: f64 = 0.1;

/// Signal weights: user-initiated, valence, confirmation, correction,
/// silence.
const ALPHA: [f64; 5] = [0.03, 0.05, 0.02, 0.05, 0.01];

/// The signal bundle for one update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Signals {
    /// The user started this exchange.
    pub user_initiated: bool,
    /// Emotion valence of the turn in `[-1, 1]`.
    pub emotion_valence: f64,
    /// The user confirmed a recalled memory.
    pub memory_confirmation: bool,
    /// The user corrected the assistant.
    pub correction: bool,
    /// Days of silence before this turn.
    pub silence_days: u32,
}

/// Derived relationship state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityState {
    /// Score below 0.2.
    Stranger,
    /// Score in `[0.2, 0.4)`.
    Acquaintance,
    /// Score in `[0.4, 0.6)`.
    Friend,
    /// Score in `[0.6, 0.8)`.
    CloseFriend,
    /// Score at or above 0.8.
    BestFriend,
}

impl AffinityState {
    /// Canonical string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stranger => "stranger",
            Self::Acquaintance => "acquaintance",
            Self::Friend => "friend",
            Self::CloseFriend => "close_friend",
            Self::BestFriend => "best_friend",
        }
    }

    /// Map a score onto a state by the fixed cut-points.
    pub fn from_score(score: f64) -> Self {
        if score < 0.2 {
            Self::Stranger
        } else if score < 0.4 {
            Self::Acquaintance
        } else if score < 0.6 {
            Self::Friend
        } else if score < 0.8 {
            Self::CloseFriend
        } else {
            Self::BestFriend
        }
    }
}

/// A state transition produced by an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// State before the update.
    pub from: AffinityState,
    /// State after the update.
    pub to: AffinityState,
}

/// Result of applying one signal bundle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffinityUpdate {
    /// Score before.
    pub old_score: f64,
    /// Score after.
    pub new_score: f64,
    /// Clamped delta actually applied.
    pub delta: f64,
    /// State after the update.
    pub state: AffinityState,
    /// Present when the update crossed a cut-point.
    pub lifecycle: Option<LifecycleEvent>,
}

/// Compute the clamped delta for one signal bundle.
pub fn compute_delta(signals: &Signals) -> f64 {
    let indicator = |flag: bool| if flag { 1.0 } else { 0.0 };
    let raw = ALPHA[0] * indicator(signals.user_initiated)
        + ALPHA[1] * signals.emotion_valence
        + ALPHA[2] * indicator(signals.memory_confirmation)
        - ALPHA[3] * indicator(signals.correction)
        - ALPHA[4] * f64::from(signals.silence_days) / 30.0;
    raw.clamp(-MAX_DELTA, MAX_DELTA)
}

/// Apply one signal bundle to the current score.
///
/// The new score is clipped to `[0, 1]`; the reported delta is the
/// movement that actually happened after clipping.
pub fn apply(old_score: f64, signals: &Signals) -> AffinityUpdate {
    let old_score = old_score.clamp(0.0, 1.0);
    let delta = compute_delta(signals);
    let new_score = (old_score + delta).clamp(0.0, 1.0);

    let old_state = AffinityState::from_score(old_score);
    let state = AffinityState::from_score(new_score);
    let lifecycle = (old_state != state).then_some(LifecycleEvent {
        from: old_state,
        to: state,
    });

    AffinityUpdate {
        old_score,
        new_score,
        delta: new_score - old_score,
        state,
        lifecycle,
    }
}
