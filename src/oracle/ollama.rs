//! Ollama-backed oracle implementations.
//!
//! [`OllamaEmbedder`] calls `/api/embed`; [`OllamaGenerator`] calls
//! `/api/generate` with `stream = false`. Both wrap each request in the
//! configured deadline.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Embedder, Generator, OracleError};

/// Default base URL for the Ollama API.
const DEFAULT_OLLAMA_BASE_URL: &str = "http://127.0.0.1:11434";

/// Ollama embedder using the `/api/embed` endpoint.
pub struct OllamaEmbedder {
    model: String,
    client: reqwest::Client,
    base_url: String,
    dims: usize,
    timeout: Duration,
}

impl std::fmt::Debug for OllamaEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaEmbedder")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("dims", &self.dims)
            .finish()
    }
}

impl OllamaEmbedder {
    /// Create an embedder for the given model and dimension.
    pub fn new(model: &str, dims: usize, timeout: Duration) -> Self {
        Self::with_base_url(model, DEFAULT_OLLAMA_BASE_URL, dims, timeout)
    }

    /// Create an embedder with a custom base URL.
    pub fn with_base_url(model: &str, base_url: &str, dims: usize, timeout: Duration) -> Self {
        Self {
            model: model.to_owned(),
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            dims,
            timeout,
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, OracleError> {
        let url = format!("{}/api/embed", self.base_url);
        let body = EmbedRequest {
            model: self.model.clone(),
            input: text.to_owned(),
        };

        let fut = self.client.post(&url).json(&body).send();
        let response = tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| OracleError::Timeout(self.timeout))??;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(OracleError::Unavailable(format!(
                "ollama returned {status}: {body_text}"
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Parse(e.to_string()))?;

        parsed
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| OracleError::Parse("empty embeddings array".to_owned()))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Ollama generator using the `/api/generate` endpoint.
pub struct OllamaGenerator {
    model: String,
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl std::fmt::Debug for OllamaGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaGenerator")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl OllamaGenerator {
    /// Create a generator for the given model.
    pub fn new(model: &str, timeout: Duration) -> Self {
        Self::with_base_url(model, DEFAULT_OLLAMA_BASE_URL, timeout)
    }

    /// Create a generator with a custom base URL.
    pub fn with_base_url(model: &str, base_url: &str, timeout: Duration) -> Self {
        Self {
            model: model.to_owned(),
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            timeout,
        }
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String, OracleError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: self.model.clone(),
            prompt: prompt.to_owned(),
            stream: false,
            options: GenerateOptions {
                num_predict: max_tokens,
            },
        };

        let fut = self.client.post(&url).json(&body).send();
        let response = tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| OracleError::Timeout(self.timeout))??;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(OracleError::Unavailable(format!(
                "ollama returned {status}: {body_text}"
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Parse(e.to_string()))?;
        Ok(parsed.response)
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Request body for Ollama `/api/embed`.
#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    input: String,
}

/// Response body from Ollama `/api/embed`.
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Request body for Ollama `/api/generate`.
#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_predict: u32,
}

/// Response body from Ollama `/api/generate`.
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}
