//! In-memory embedding index over the chunks of one document. Exhaustive inner-product
//! search over unit-normalized vectors (cosine similarity).
//!
//! No persistence; the index is discarded when the process exits. Each `build` produces a
//! fresh immutable snapshot that is published with a single pointer swap, so a search in
//! flight always sees one complete snapshot.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::chunks::Chunk;
use crate::embed::{EmbedError, Embedder};

/// A chunk with its embedding, stored for similarity search.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    /// Normalized embedding vector (unit length for cosine similarity via dot product).
    embedding: Vec<f32>,
}

/// A scored match from [`EmbeddingIndex::search`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalResult {
    pub text: String,
    /// Position of the chunk in the document.
    pub index: usize,
    /// Cosine similarity, in [-1, 1].
    pub score: f32,
}

#[derive(Debug)]
struct Snapshot {
    items: Vec<IndexedChunk>,
    dimension: usize,
}

/// Embedding index owning the chunks of the most recent successful `build`.
pub struct EmbeddingIndex {
    embedder: Arc<dyn Embedder>,
    current: RwLock<Option<Arc<Snapshot>>>,
}

impl std::fmt::Debug for EmbeddingIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingIndex")
            .field("len", &self.len())
            .field("dimension", &self.dimension())
            .finish()
    }
}

impl EmbeddingIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            current: RwLock::new(None),
        }
    }

    /// Encode every chunk and replace the current index.
    ///
    /// All-or-nothing: on any failure the previous index stays in place.
    pub fn build(&self, chunks: Vec<Chunk>) -> Result<(), IndexError> {
        if chunks.is_empty() {
            return Err(IndexError::EmptyInput);
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed(&texts)?;
        if embeddings.len() != chunks.len() {
            return Err(IndexError::CountMismatch {
                expected: chunks.len(),
                actual: embeddings.len(),
            });
        }

        let dimension = embeddings[0].len();
        if dimension == 0 {
            return Err(IndexError::InvalidVector("zero-length embedding".into()));
        }
        let mut items = Vec::with_capacity(chunks.len());
        for (chunk, embedding) in chunks.into_iter().zip(embeddings) {
            validate_vector(&embedding, dimension)?;
            items.push(IndexedChunk {
                chunk,
                embedding: normalize(&embedding),
            });
        }

        let snapshot = Arc::new(Snapshot { items, dimension });
        info!(chunks = snapshot.items.len(), dimension, "embedding index built");
        *self.current.write() = Some(snapshot);
        Ok(())
    }

    /// Return up to `top_k` chunks most similar to `query`, best first, dropping any whose
    /// score is below `score_threshold`.
    ///
    /// Equal scores keep document order. A short (or empty) result is not an error.
    pub fn search(
        &self,
        query: &str,
        top_k: usize,
        score_threshold: f32,
    ) -> Result<Vec<RetrievalResult>, IndexError> {
        let snapshot = self.snapshot().ok_or(IndexError::NotBuilt)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let mut encoded = self.embedder.embed(&[query.to_string()])?;
        if encoded.len() != 1 {
            return Err(IndexError::CountMismatch {
                expected: 1,
                actual: encoded.len(),
            });
        }
        let query_embedding = encoded.swap_remove(0);
        validate_vector(&query_embedding, snapshot.dimension)?;
        let q_norm = normalize(&query_embedding);

        let mut scored: Vec<(&IndexedChunk, f32)> = snapshot
            .items
            .iter()
            .map(|ic| (ic, dot(&q_norm, &ic.embedding)))
            .collect();
        // Stable sort: ties stay in insertion order.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(top_k);

        let results: Vec<RetrievalResult> = scored
            .into_iter()
            .filter(|(_, score)| *score >= score_threshold)
            .map(|(ic, score)| RetrievalResult {
                text: ic.chunk.text.clone(),
                index: ic.chunk.index,
                score,
            })
            .collect();
        debug!(
            top_k,
            score_threshold,
            hits = results.len(),
            "retrieved context chunks"
        );
        Ok(results)
    }

    /// Number of indexed chunks.
    pub fn len(&self) -> usize {
        self.snapshot().map_or(0, |s| s.items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Embedding dimension of the current index, if one has been built.
    pub fn dimension(&self) -> Option<usize> {
        self.snapshot().map(|s| s.dimension)
    }

    fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.current.read().clone()
    }
}

fn validate_vector(v: &[f32], dimension: usize) -> Result<(), IndexError> {
    if v.len() != dimension {
        return Err(IndexError::DimensionMismatch {
            expected: dimension,
            actual: v.len(),
        });
    }
    if let Some(i) = v.iter().position(|x| !x.is_finite()) {
        return Err(IndexError::InvalidVector(format!(
            "non-finite value at index {i}"
        )));
    }
    if v.iter().all(|x| *x == 0.0) {
        return Err(IndexError::InvalidVector("zero vector cannot be normalized".into()));
    }
    Ok(())
}

/// Scales `v` to unit length. The zero vector is returned unchanged.
pub(crate) fn normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("cannot build an index from no chunks")]
    EmptyInput,
    #[error("index has not been built")]
    NotBuilt,
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("encoder returned {actual} embeddings for {expected} inputs")]
    CountMismatch { expected: usize, actual: usize },
    #[error("invalid embedding: {0}")]
    InvalidVector(String),
    #[error(transparent)]
    Embedding(#[from] EmbedError),
}
