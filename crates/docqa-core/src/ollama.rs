//! Ollama client for embeddings and completion. Wraps ollama-rs behind the blocking
//! [`Embedder`] and [`LanguageModel`] traits.
//!
//! Requests run on the tokio runtime whose handle the client holds. Calls block the current
//! thread, so they must come from a plain thread or from `spawn_blocking`, never from inside
//! an async task.

use std::future::Future;
use std::time::Duration;

use ollama_rs::generation::completion::request::GenerationRequest;
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};
use ollama_rs::Ollama;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, error};

use crate::embed::{EmbedError, Embedder};
use crate::llm::{GenerationError, LanguageModel};

pub const DEFAULT_EMBED_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_GENERATION_MODEL: &str = "llama3";
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Thin wrapper around Ollama for embedding and completion.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    inner: Ollama,
    runtime: Handle,
    embed_model: String,
    generation_model: String,
    timeout: Duration,
}

impl OllamaClient {
    /// Create from a URL string such as `http://localhost:11434`. `runtime` must belong to a
    /// multi-threaded runtime so it can drive I/O while the caller blocks.
    pub fn from_url(url: &str, runtime: Handle) -> Result<Self, OllamaError> {
        let inner = Ollama::try_new(url.trim_end_matches('/')).map_err(OllamaError::ParseUrl)?;
        Ok(Self {
            inner,
            runtime,
            embed_model: DEFAULT_EMBED_MODEL.to_string(),
            generation_model: DEFAULT_GENERATION_MODEL.to_string(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Set the embedding model (e.g. `nomic-embed-text`, `all-minilm`).
    pub fn with_embed_model(mut self, model: impl Into<String>) -> Self {
        self.embed_model = model.into();
        self
    }

    /// Set the completion model (e.g. `llama3`, `mistral`).
    pub fn with_generation_model(mut self, model: impl Into<String>) -> Self {
        self.generation_model = model.into();
        self
    }

    /// Upper bound on a single request, embedding or completion.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn block_on<F: Future>(&self, fut: F) -> Result<F::Output, tokio::time::error::Elapsed> {
        let timeout = self.timeout;
        self.runtime
            .block_on(async move { tokio::time::timeout(timeout, fut).await })
    }
}

impl Embedder for OllamaClient {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let req = GenerateEmbeddingsRequest::new(
            self.embed_model.clone(),
            EmbeddingsInput::Multiple(texts.to_vec()),
        );
        let res = self
            .block_on(self.inner.generate_embeddings(req))
            .map_err(|_| EmbedError::Timeout(self.timeout))?
            .map_err(|e| EmbedError::Request(e.to_string()))?;
        debug!(inputs = texts.len(), model = %self.embed_model, "embedded batch");
        Ok(res.embeddings)
    }
}

impl LanguageModel for OllamaClient {
    fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let req = GenerationRequest::new(self.generation_model.clone(), prompt.to_string());
        let res = self
            .block_on(self.inner.generate(req))
            .map_err(|_| {
                error!(model = %self.generation_model, timeout = ?self.timeout, "Ollama generation timed out");
                GenerationError::Timeout(self.timeout)
            })?
            .map_err(|e| {
                error!(model = %self.generation_model, error = %e, "failed to contact Ollama");
                GenerationError::Request(e.to_string())
            })?;
        Ok(res.response.trim().to_string())
    }
}

#[derive(Debug, Error)]
pub enum OllamaError {
    #[error("invalid Ollama URL: {0}")]
    ParseUrl(#[from] url::ParseError),
}
