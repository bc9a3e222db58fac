//! Turning uploaded bytes into page text.

use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;

/// Extracts the text of each page of a document. An unreadable or empty document may yield
/// no pages at all; that is not an error here.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, document: &[u8]) -> Result<Vec<String>, ExtractError>;
}

/// PDF text extraction via `pdf-extract`. Pages are split on form feeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfExtractor;

impl TextExtractor for PdfExtractor {
    fn extract(&self, document: &[u8]) -> Result<Vec<String>, ExtractError> {
        if document.is_empty() {
            return Ok(Vec::new());
        }
        // pdf-extract panics on some malformed inputs instead of returning an error.
        let text = panic::catch_unwind(AssertUnwindSafe(|| {
            pdf_extract::extract_text_from_mem(document)
        }))
        .map_err(|_| ExtractError::Unreadable("PDF parser aborted".into()))?
        .map_err(|e| ExtractError::Unreadable(e.to_string()))?;
        Ok(split_pages(&text))
    }
}

/// Treats the bytes as UTF-8 text (invalid sequences are replaced). Form feeds separate pages.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, document: &[u8]) -> Result<Vec<String>, ExtractError> {
        Ok(split_pages(&String::from_utf8_lossy(document)))
    }
}

/// Picks an extractor from a file name: `.pdf` → [`PdfExtractor`], anything else → plain text.
pub fn extractor_for_path(path: &std::path::Path) -> Box<dyn TextExtractor> {
    let is_pdf = path
        .extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case("pdf"));
    if is_pdf {
        Box::new(PdfExtractor)
    } else {
        Box::new(PlainTextExtractor)
    }
}

fn split_pages(text: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    text.split('\u{c}').map(str::to_string).collect()
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unreadable document: {0}")]
    Unreadable(String),
}
