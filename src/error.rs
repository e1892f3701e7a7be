//! Public error surface: short machine codes plus a trace id.
//!
//! Callers never see store-internal detail; they get a code they can
//! branch on and a trace id an operator can correlate with logs.

use uuid::Uuid;

use crate::oracle::OracleError;
use crate::store::StoreError;

/// Machine-readable error codes on the public surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The turn failed after validation; the client may retry with the
    /// same idempotency key.
    ConversationFailed,
    /// A persistent store was unreachable.
    StoreUnavailable,
    /// Extraction confidence was below the commit threshold; the
    /// memory is held for review.
    ExtractionLowConfidence,
    /// The client exceeded its request budget.
    RateLimited,
    /// The request was malformed (empty message, bad ids).
    InvalidInput,
}

impl ErrorCode {
    /// Canonical string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConversationFailed => "CONVERSATION_FAILED",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::ExtractionLowConfidence => "EXTRACTION_LOW_CONFIDENCE",
            Self::RateLimited => "RATE_LIMITED",
            Self::InvalidInput => "INVALID_INPUT",
        }
    }
}

/// A structured engine error.
#[derive(Debug, thiserror::Error)]
#[error("{} [{}]: {}", .code.as_str(), .trace_id, .message)]
pub struct EngineError {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Correlates the failure with server-side logs.
    pub trace_id: Uuid,
    /// Human-oriented summary; never includes store internals.
    pub message: String,
    /// Seconds the caller should wait before retrying (rate limits).
    pub retry_after: Option<u64>,
}

impl EngineError {
    /// Construct an error with a fresh trace id.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            trace_id: Uuid::new_v4(),
            message: message.into(),
            retry_after: None,
        }
    }

    /// An invalid-input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// A rate-limit error with a retry hint.
    pub fn rate_limited(retry_after: u64) -> Self {
        Self {
            code: ErrorCode::RateLimited,
            trace_id: Uuid::new_v4(),
            message: "too many requests".to_owned(),
            retry_after: Some(retry_after),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "store failure");
        Self::new(ErrorCode::StoreUnavailable, "store unavailable")
    }
}

impl From<OracleError> for EngineError {
    fn from(err: OracleError) -> Self {
        tracing::error!(error = %err, "oracle failure");
        Self::new(ErrorCode::ConversationFailed, "conversation failed")
    }
}
