//! Splits document text into overlapping fixed-size character windows for embedding.
//!
//! Whitespace is collapsed before windowing, so offsets and lengths always refer to the
//! normalized text and are counted in characters, not bytes.

use thiserror::Error;

/// Default window length in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 800;
/// Default number of characters shared by consecutive windows.
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;

/// A window of document text with its position in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    /// Ordinal of this chunk within the document (0, 1, 2, …).
    pub index: usize,
}

/// Fixed-size character window splitter. Parameters are validated once, at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl Chunker {
    /// Fails with [`ChunkError::InvalidConfiguration`] unless `chunk_size > chunk_overlap`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self, ChunkError> {
        validate(chunk_size, chunk_overlap)?;
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Chunk `text`, numbering the windows in document order.
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        split_windows(&normalize_whitespace(text), self.chunk_size, self.chunk_overlap)
            .into_iter()
            .enumerate()
            .map(|(index, text)| Chunk { text, index })
            .collect()
    }
}

/// Normalize `text` and split it into windows of `chunk_size` characters, each starting
/// `chunk_size - chunk_overlap` characters after the previous one.
///
/// Empty or whitespace-only input yields no chunks.
pub fn chunk_text(
    text: &str,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Result<Vec<String>, ChunkError> {
    validate(chunk_size, chunk_overlap)?;
    Ok(split_windows(
        &normalize_whitespace(text),
        chunk_size,
        chunk_overlap,
    ))
}

/// Collapses every run of whitespace (newlines included) into one space and trims the ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn validate(chunk_size: usize, chunk_overlap: usize) -> Result<(), ChunkError> {
    if chunk_size == 0 || chunk_size <= chunk_overlap {
        return Err(ChunkError::InvalidConfiguration {
            chunk_size,
            chunk_overlap,
        });
    }
    Ok(())
}

fn split_windows(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    // Byte offset of every character, plus the end of the string.
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let len = bounds.len() - 1;
    let step = chunk_size - chunk_overlap;

    let mut windows = Vec::with_capacity(len / step + 1);
    let mut start = 0;
    loop {
        let end = (start + chunk_size).min(len);
        windows.push(text[bounds[start]..bounds[end]].to_string());
        if end == len {
            break;
        }
        start += step;
    }
    windows
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error(
        "invalid chunking configuration: chunk_size ({chunk_size}) must be greater than chunk_overlap ({chunk_overlap})"
    )]
    InvalidConfiguration {
        chunk_size: usize,
        chunk_overlap: usize,
    },
}
