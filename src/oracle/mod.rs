//! Embedding and generation oracle interfaces.
//!
//! The engine treats both models as opaque pure functions supplied by
//! the environment: `embed: text → vector(d)` and
//! `generate: prompt → text`. The [`ollama`] module provides HTTP
//! implementations of each; tests inject mocks.

pub mod ollama;

use std::pin::Pin;

use async_trait::async_trait;
use tokio_stream::Stream;

/// Errors from oracle calls.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    /// HTTP transport failure.
    #[error("oracle request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Response did not match the expected format.
    #[error("oracle response parse error: {0}")]
    Parse(String),

    /// Provider is unavailable or returned a non-success status.
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    /// The per-call deadline elapsed.
    #[error("oracle call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl OracleError {
    /// True for failures worth retrying (network, availability,
    /// deadline) as opposed to malformed responses.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Request(_) | Self::Unavailable(_) | Self::Timeout(_)
        )
    }
}

/// A stream of generated text chunks.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, OracleError>> + Send>>;

/// Embedding oracle: text to a fixed-dimension vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding vector for the given text.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is unreachable or the request
    /// fails.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, OracleError>;

    /// Dimensionality of the vectors produced.
    fn dimensions(&self) -> usize;
}

/// Generation oracle: prompt to reply text.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate a completion for the prompt.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is unreachable or the request
    /// fails.
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String, OracleError>;

    /// Generate a completion as a lazy chunk stream.
    ///
    /// The default implementation performs one [`generate`] call and
    /// yields the whole reply as a single chunk; providers with a
    /// native streaming API override this.
    ///
    /// [`generate`]: Generator::generate
    async fn generate_stream(
        &self,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<TokenStream, OracleError> {
        let text = self.generate(prompt, max_tokens).await?;
        Ok(Box::pin(tokio_stream::once(Ok(text))))
    }
}
