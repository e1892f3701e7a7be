//! kindred — a long-term memory and companion-conversation engine.
//!
//! Users exchange messages with an assistant that extracts durable
//! facts from each utterance, fans them out to relational, vector, and
//! graph stores through a transactional outbox, and conditions every
//! reply on hybrid retrieval over months of accumulated history. A
//! time-decaying relational graph and a bounded affinity score shape
//! tone and recall.
//!
//! Component map:
//!
//! - [`store`] — the three narrow persistence adapters (R, V, G)
//! - [`oracle`] — embedding and generation model interfaces
//! - [`extract`] — rules + oracle extraction, structured facts, critic
//! - [`retrieval`] — hybrid vector/graph recall with unified rerank
//! - [`affinity`] / [`emotion`] — relationship score and turn valence
//! - [`conflict`] — opposite-polarity memory detection and supersession
//! - [`convo`] — the conversation core (`process_turn`, `stream_turn`)
//! - [`outbox`] — the drainer, backoff/DLQ, and the reconciler
//! - [`context`] — startup wiring; [`config`] — TOML configuration

pub mod affinity;
pub mod config;
pub mod conflict;
pub mod context;
pub mod convo;
pub mod emotion;
pub mod error;
pub mod extract;
pub mod logging;
pub mod oracle;
pub mod outbox;
pub mod ratelimit;
pub mod retrieval;
pub mod store;
pub mod types;
