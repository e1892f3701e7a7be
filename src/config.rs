//! Configuration loading and validation.
//!
//! One TOML file, sectioned by concern. Every field has a serde
//! default so a minimal deployment can run with an empty file; the
//! binary loads `kindred.toml` from the working directory or the path
//! in `KINDRED_CONFIG`.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Config {
    /// Store paths and pool sizing.
    #[serde(default)]
    pub stores: StoresConfig,

    /// Oracle endpoints, models, and timeouts.
    #[serde(default)]
    pub oracles: OraclesConfig,

    /// Retrieval budgets and rerank weights.
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Extraction thresholds.
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Outbox drainer tuning.
    #[serde(default)]
    pub outbox: OutboxConfig,

    /// Conversation-core tuning.
    #[serde(default)]
    pub conversation: ConversationConfig,

    /// Rate limiter bounds.
    #[serde(default)]
    pub ratelimit: RateLimitConfig,
}

/// Store paths and pool sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct StoresConfig {
    /// SQLite database path (`:memory:` for ephemeral runs).
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Pool connection cap.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Embedding dimension; must match the embedder's output.
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            max_connections: default_max_connections(),
            embedding_dim: default_embedding_dim(),
        }
    }
}

/// Oracle endpoints, models, and timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct OraclesConfig {
    /// Base URL of the Ollama-compatible endpoint.
    #[serde(default = "default_oracle_base_url")]
    pub base_url: String,

    /// Embedding model name.
    #[serde(default = "default_embed_model")]
    pub embed_model: String,

    /// Generation model name.
    #[serde(default = "default_generate_model")]
    pub generate_model: String,

    /// Embedding call deadline in seconds.
    #[serde(default = "default_embed_timeout_secs")]
    pub embed_timeout_secs: u64,

    /// Generation call deadline in seconds.
    #[serde(default = "default_generate_timeout_secs")]
    pub generate_timeout_secs: u64,

    /// Fast extraction call deadline in milliseconds.
    #[serde(default = "default_extract_timeout_ms")]
    pub extract_timeout_ms: u64,
}

impl Default for OraclesConfig {
    fn default() -> Self {
        Self {
            base_url: default_oracle_base_url(),
            embed_model: default_embed_model(),
            generate_model: default_generate_model(),
            embed_timeout_secs: default_embed_timeout_secs(),
            generate_timeout_secs: default_generate_timeout_secs(),
            extract_timeout_ms: default_extract_timeout_ms(),
        }
    }
}

impl OraclesConfig {
    /// Embedding deadline as a [`Duration`].
    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs)
    }

    /// Generation deadline as a [`Duration`].
    pub fn generate_timeout(&self) -> Duration {
        Duration::from_secs(self.generate_timeout_secs)
    }

    /// Fast-extraction deadline as a [`Duration`].
    pub fn extract_timeout(&self) -> Duration {
        Duration::from_millis(self.extract_timeout_ms)
    }
}

/// Retrieval budgets and rerank weights.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    /// Final result cap.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Vector-search candidate fetch size.
    #[serde(default = "default_top_k_vec")]
    pub top_k_vec: usize,

    /// Maximum graph traversal depth.
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,

    /// Per-branch retrieval deadline in milliseconds.
    #[serde(default = "default_branch_timeout_ms")]
    pub branch_timeout_ms: u64,

    /// Cosine-similarity weight in the unified rerank.
    #[serde(default = "default_w_cos")]
    pub w_cos: f64,

    /// Edge-weight contribution in the unified rerank.
    #[serde(default = "default_w_edge")]
    pub w_edge: f64,

    /// Recency contribution in the unified rerank.
    #[serde(default = "default_w_rec")]
    pub w_rec: f64,

    /// Affinity contribution in the unified rerank.
    #[serde(default = "default_w_aff")]
    pub w_aff: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            top_k_vec: default_top_k_vec(),
            max_hops: default_max_hops(),
            branch_timeout_ms: default_branch_timeout_ms(),
            w_cos: default_w_cos(),
            w_edge: default_w_edge(),
            w_rec: default_w_rec(),
            w_aff: default_w_aff(),
        }
    }
}

impl RetrievalConfig {
    /// Per-branch deadline as a [`Duration`].
    pub fn branch_timeout(&self) -> Duration {
        Duration::from_millis(self.branch_timeout_ms)
    }
}

/// Extraction thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionConfig {
    /// Below this overall confidence the memory is held for review.
    #[serde(default = "default_commit_threshold")]
    pub commit_threshold: f64,

    /// Raise the critic threshold from 0.5 to 0.7.
    #[serde(default)]
    pub strict: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            commit_threshold: default_commit_threshold(),
            strict: false,
        }
    }
}

/// Outbox drainer tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
    /// Worker count; defaults to available parallelism.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Events claimed per poll per worker.
    #[serde(default = "default_claim_batch")]
    pub claim_batch: usize,

    /// Poll interval in milliseconds when the queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Transient-failure retry cap before dead-lettering.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff base in milliseconds (`base * 2^n + jitter`).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff cap in milliseconds.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Events stuck in `processing` longer than this are requeued.
    #[serde(default = "default_processing_timeout_secs")]
    pub processing_timeout_secs: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            claim_batch: default_claim_batch(),
            poll_interval_ms: default_poll_interval_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            processing_timeout_secs: default_processing_timeout_secs(),
        }
    }
}

impl OutboxConfig {
    /// Idle poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Processing timeout as a chrono [`Duration`](chrono::Duration).
    pub fn processing_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.processing_timeout_secs).unwrap_or(600))
    }
}

/// Conversation-core tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationConfig {
    /// Turns of history included in the reply prompt.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,

    /// Reply token budget.
    #[serde(default = "default_reply_max_tokens")]
    pub reply_max_tokens: u32,

    /// Idempotency key TTL in seconds.
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,

    /// Greeting template cache TTL in seconds.
    #[serde(default = "default_greeting_ttl_secs")]
    pub greeting_ttl_secs: u64,

    /// Drain the enqueued event inline after replying (eval mode and
    /// single-process deployments).
    #[serde(default)]
    pub inline_drain: bool,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            history_turns: default_history_turns(),
            reply_max_tokens: default_reply_max_tokens(),
            idempotency_ttl_secs: default_idempotency_ttl_secs(),
            greeting_ttl_secs: default_greeting_ttl_secs(),
            inline_drain: false,
        }
    }
}

impl ConversationConfig {
    /// Idempotency TTL as a chrono [`Duration`](chrono::Duration).
    pub fn idempotency_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.idempotency_ttl_secs).unwrap_or(86_400))
    }
}

/// Rate limiter bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per client per 60-second window.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Bounded client map size (LRU eviction beyond this).
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            max_clients: default_max_clients(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated constraint.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.stores.embedding_dim == 0 {
            anyhow::bail!("stores.embedding_dim must be positive");
        }
        if self.retrieval.top_k == 0 {
            anyhow::bail!("retrieval.top_k must be positive");
        }
        if !(0.0..=1.0).contains(&self.extraction.commit_threshold) {
            anyhow::bail!("extraction.commit_threshold must be in [0, 1]");
        }
        if self.outbox.workers == 0 {
            anyhow::bail!("outbox.workers must be positive");
        }
        if self.ratelimit.requests_per_minute == 0 {
            anyhow::bail!("ratelimit.requests_per_minute must be positive");
        }
        Ok(())
    }
}

fn default_database_path() -> String {
    "kindred.db".to_owned()
}

fn default_max_connections() -> u32 {
    8
}

fn default_embedding_dim() -> usize {
    1024
}

fn default_oracle_base_url() -> String {
    "http://127.0.0.1:11434".to_owned()
}

fn default_embed_model() -> String {
    "bge-m3".to_owned()
}

fn default_generate_model() -> String {
    "qwen2.5".to_owned()
}

fn default_embed_timeout_secs() -> u64 {
    20
}

fn default_generate_timeout_secs() -> u64 {
    30
}

fn default_extract_timeout_ms() -> u64 {
    800
}

fn default_top_k() -> usize {
    20
}

fn default_top_k_vec() -> usize {
    32
}

fn default_max_hops() -> u32 {
    3
}

fn default_branch_timeout_ms() -> u64 {
    2_000
}

fn default_w_cos() -> f64 {
    0.55
}

fn default_w_edge() -> f64 {
    0.20
}

fn default_w_rec() -> f64 {
    0.15
}

fn default_w_aff() -> f64 {
    0.10
}

fn default_commit_threshold() -> f64 {
    0.35
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get)
}

fn default_claim_batch() -> usize {
    8
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    300_000
}

fn default_processing_timeout_secs() -> u64 {
    600
}

fn default_history_turns() -> usize {
    6
}

fn default_reply_max_tokens() -> u32 {
    1_024
}

fn default_idempotency_ttl_secs() -> u64 {
    86_400
}

fn default_greeting_ttl_secs() -> u64 {
    300
}

fn default_requests_per_minute() -> u32 {
    100
}

fn default_max_clients() -> usize {
    10_000
}
