//! Text → vector encoders used by the embedding index.

use std::time::Duration;

use thiserror::Error;

use crate::chunks::normalize_whitespace;
use crate::store::normalize;

/// Encodes text into fixed-length vectors. One vector per input, same order.
///
/// The dimension must stay constant for the lifetime of an encoder. Implementations are
/// blocking; callers on an async runtime should dispatch through `spawn_blocking`.
pub trait Embedder: Send + Sync {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Default dimension of [`HashingEmbedder`].
pub const DEFAULT_HASHING_DIMENSIONS: usize = 384;

/// Offline encoder: hashes lowercase character trigrams and whole words into a fixed number
/// of buckets and L2-normalizes the counts.
///
/// Deterministic across runs and platforms. Similar wording gives similar vectors, which is
/// enough for tests and for running without an embedding server.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_HASHING_DIMENSIONS,
        }
    }
}

impl HashingEmbedder {
    /// `dimensions` is clamped to at least 1.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        let text = normalize_whitespace(&text.to_lowercase());
        if text.is_empty() {
            return v;
        }
        for word in text.split(' ') {
            v[self.bucket(word.as_bytes())] += 1.0;
        }
        let padded: Vec<char> = std::iter::once(' ')
            .chain(text.chars())
            .chain(std::iter::once(' '))
            .collect();
        let mut buf = [0u8; 12];
        for tri in padded.windows(3) {
            let mut len = 0;
            for c in tri {
                len += c.encode_utf8(&mut buf[len..]).len();
            }
            v[self.bucket(&buf[..len])] += 1.0;
        }
        normalize(&v)
    }

    fn bucket(&self, bytes: &[u8]) -> usize {
        (fnv1a(bytes) % self.dimensions as u64) as usize
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding request failed: {0}")]
    Request(String),
    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),
}
