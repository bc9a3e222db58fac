//! Retrieval pipeline for answering questions about one document, independent of how
//! the app is run (CLI or HTTP server).
//!
//! A document is extracted, chunked and embedded into an in-memory index; questions are
//! answered by a language model that only sees the best-matching chunks. Config lives in
//! the app data directory (see [app_data]).

pub mod app_data;
pub mod chunks;
pub mod config;
pub mod document;
pub mod embed;
pub mod llm;
pub mod ollama;
pub mod pipeline;
pub mod prompt;
pub mod store;

pub use app_data::app_data_dir;
pub use chunks::{
    chunk_text, normalize_whitespace, Chunk, ChunkError, Chunker, DEFAULT_CHUNK_OVERLAP,
    DEFAULT_CHUNK_SIZE,
};
pub use config::{load_config, load_config_from, save_config, save_config_to, Config, ConfigError};
pub use document::{extractor_for_path, ExtractError, PdfExtractor, PlainTextExtractor, TextExtractor};
pub use embed::{EmbedError, Embedder, HashingEmbedder};
pub use llm::{GenerationError, LanguageModel};
pub use ollama::{OllamaClient, OllamaError};
pub use pipeline::{PipelineError, RetrievalPipeline, DEFAULT_SCORE_THRESHOLD, DEFAULT_TOP_K};
pub use prompt::{build_prompt, REFUSAL_MESSAGE};
pub use store::{EmbeddingIndex, IndexError, RetrievalResult};

/// Returns a short status string. Used to verify the backend is wired up.
pub fn status() -> &'static str {
    "docqa-core ready"
}
