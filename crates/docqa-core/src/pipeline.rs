//! Retrieval pipeline: extract → chunk → embed → index on ingest; search → prompt →
//! generate on answer.
//!
//! The pipeline is `NotReady` until a document has been ingested successfully and `Ready`
//! afterwards. A failed ingest leaves the previous state and index in place. Both
//! operations block; transports should run them on a blocking pool.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chunks::{ChunkError, Chunker};
use crate::config::Config;
use crate::document::{ExtractError, TextExtractor};
use crate::embed::Embedder;
use crate::llm::{GenerationError, LanguageModel};
use crate::prompt::{build_prompt, REFUSAL_MESSAGE};
use crate::store::{EmbeddingIndex, IndexError, RetrievalResult};

pub const DEFAULT_TOP_K: usize = 4;
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.2;

/// Single-document question answering over an embedding index.
pub struct RetrievalPipeline {
    chunker: Chunker,
    index: EmbeddingIndex,
    extractor: Arc<dyn TextExtractor>,
    llm: Arc<dyn LanguageModel>,
    top_k: usize,
    score_threshold: f32,
    /// Serializes ingests; searches only take the index's read lock.
    ingest_lock: Mutex<()>,
}

impl RetrievalPipeline {
    pub fn new(
        chunker: Chunker,
        extractor: Arc<dyn TextExtractor>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LanguageModel>,
    ) -> Self {
        Self {
            chunker,
            index: EmbeddingIndex::new(embedder),
            extractor,
            llm,
            top_k: DEFAULT_TOP_K,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            ingest_lock: Mutex::new(()),
        }
    }

    /// Pipeline using the chunking and retrieval settings from `config`.
    pub fn from_config(
        config: &Config,
        extractor: Arc<dyn TextExtractor>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LanguageModel>,
    ) -> Result<Self, ChunkError> {
        Ok(Self::new(config.chunker()?, extractor, embedder, llm)
            .with_retrieval(config.top_k, config.score_threshold))
    }

    /// Override how many chunks are retrieved and the minimum score they need.
    pub fn with_retrieval(mut self, top_k: usize, score_threshold: f32) -> Self {
        self.top_k = top_k;
        self.score_threshold = score_threshold;
        self
    }

    /// Replace the indexed document with `document`. Returns the number of chunks indexed.
    pub fn ingest(&self, document: &[u8]) -> Result<usize, PipelineError> {
        let _guard = self.ingest_lock.lock();

        let pages = self.extractor.extract(document)?;
        let text = pages
            .iter()
            .map(|p| p.as_str())
            .filter(|p| !p.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = self.chunker.chunk(&text);
        if chunks.is_empty() {
            warn!(pages = pages.len(), "no text extracted from document");
            return Err(PipelineError::EmptyDocument);
        }

        let count = chunks.len();
        self.index.build(chunks)?;
        info!(chunks = count, "document ingested");
        Ok(count)
    }

    /// Answer `question` from the ingested document, or return [`REFUSAL_MESSAGE`] when the
    /// document has nothing relevant.
    pub fn answer(&self, question: &str) -> Result<String, PipelineError> {
        let results = self.retrieve(question)?;
        if results.is_empty() {
            info!("no relevant context found; returning refusal message");
            return Ok(REFUSAL_MESSAGE.to_string());
        }

        let contexts: Vec<&str> = results.iter().map(|r| r.text.as_str()).collect();
        let prompt = build_prompt(&contexts, question);
        debug!(context_chunks = contexts.len(), "constructed prompt");

        let answer = self.llm.generate(&prompt)?;
        let answer = answer.trim();
        if answer.is_empty() {
            return Ok(REFUSAL_MESSAGE.to_string());
        }
        Ok(answer.to_string())
    }

    /// The scored chunks `answer` would use as context for `question`.
    pub fn retrieve(&self, question: &str) -> Result<Vec<RetrievalResult>, PipelineError> {
        if !self.is_ready() {
            return Err(PipelineError::NotReady);
        }
        if question.trim().is_empty() {
            return Err(PipelineError::EmptyQuestion);
        }
        Ok(self
            .index
            .search(question, self.top_k, self.score_threshold)?)
    }

    pub fn is_ready(&self) -> bool {
        !self.index.is_empty()
    }

    /// Chunks in the live index; 0 when not ready.
    pub fn chunk_count(&self) -> usize {
        self.index.len()
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not read the document: {0}")]
    Extraction(#[from] ExtractError),
    #[error("no text could be extracted from the document")]
    EmptyDocument,
    #[error("question cannot be empty")]
    EmptyQuestion,
    #[error("no document has been ingested yet")]
    NotReady,
    #[error("language model unavailable: {0}")]
    GenerationUnavailable(#[from] GenerationError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
}

impl PipelineError {
    /// True for conditions the caller can fix (bad document, blank question, nothing
    /// ingested yet). Everything else is an infrastructure or internal failure.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::Extraction(_) | Self::EmptyDocument | Self::EmptyQuestion | Self::NotReady
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::document::PlainTextExtractor;
    use crate::embed::{EmbedError, HashingEmbedder};

    /// Records prompts and replies with a fixed answer.
    #[derive(Default)]
    struct ScriptedModel {
        reply: String,
        calls: AtomicUsize,
        last_prompt: Mutex<Option<String>>,
        unavailable: AtomicBool,
    }

    impl ScriptedModel {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                ..Self::default()
            })
        }
    }

    impl LanguageModel for ScriptedModel {
        fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock() = Some(prompt.to_string());
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(GenerationError::Timeout(Duration::from_secs(60)));
            }
            Ok(self.reply.clone())
        }
    }

    /// Hashing embedder that can be switched off to simulate an encoder outage.
    #[derive(Default)]
    struct FlakyEmbedder {
        inner: HashingEmbedder,
        down: AtomicBool,
    }

    impl Embedder for FlakyEmbedder {
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(EmbedError::Request("connection refused".into()));
            }
            self.inner.embed(texts)
        }
    }

    /// Embeds each text with a fixed function of the text.
    struct FnEmbedder(fn(&str) -> Vec<f32>);

    impl Embedder for FnEmbedder {
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            Ok(texts.iter().map(|t| (self.0)(t)).collect())
        }
    }

    /// Hashing embedder that records how many `embed` calls overlap.
    #[derive(Default)]
    struct OverlapEmbedder {
        inner: HashingEmbedder,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl Embedder for OverlapEmbedder {
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            let out = self.inner.embed(texts);
            self.active.fetch_sub(1, Ordering::SeqCst);
            out
        }
    }

    const DOC: &str = "The warranty covers manufacturing defects for two years.\n\n\
        Returns are accepted within thirty days with a receipt.\x0c\
        Shipping is free for orders over fifty dollars.";

    fn pipeline(model: Arc<ScriptedModel>) -> RetrievalPipeline {
        RetrievalPipeline::new(
            Chunker::new(60, 10).unwrap(),
            Arc::new(PlainTextExtractor),
            Arc::new(HashingEmbedder::default()),
            model,
        )
    }

    #[test]
    fn starts_not_ready() {
        let p = pipeline(ScriptedModel::replying("x"));
        assert!(!p.is_ready());
        assert_eq!(p.chunk_count(), 0);
        assert!(matches!(p.answer("What is X?"), Err(PipelineError::NotReady)));
    }

    #[test]
    fn ingest_returns_chunk_count_and_becomes_ready() {
        let p = pipeline(ScriptedModel::replying("x"));
        let n = p.ingest(DOC.as_bytes()).unwrap();
        let expected = Chunker::new(60, 10)
            .unwrap()
            .chunk(&DOC.replace('\u{c}', "\n"))
            .len();
        assert_eq!(n, expected);
        assert!(p.is_ready());
        assert_eq!(p.chunk_count(), n);
    }

    #[test]
    fn letters_document_yields_window_count() {
        let p = RetrievalPipeline::new(
            Chunker::new(5, 2).unwrap(),
            Arc::new(PlainTextExtractor),
            Arc::new(HashingEmbedder::default()),
            ScriptedModel::replying("x"),
        );
        assert_eq!(p.ingest(b"A B\nC   D E F").unwrap(), 3);
    }

    #[test]
    fn empty_document_is_rejected() {
        let p = pipeline(ScriptedModel::replying("x"));
        assert!(matches!(p.ingest(b""), Err(PipelineError::EmptyDocument)));
        assert!(matches!(
            p.ingest(b" \n\x0c \t"),
            Err(PipelineError::EmptyDocument)
        ));
        assert!(!p.is_ready());
    }

    #[test]
    fn blank_question_is_rejected_when_ready() {
        let model = ScriptedModel::replying("x");
        let p = pipeline(model.clone());
        p.ingest(DOC.as_bytes()).unwrap();
        assert!(matches!(p.answer(""), Err(PipelineError::EmptyQuestion)));
        assert!(matches!(p.answer("  \n "), Err(PipelineError::EmptyQuestion)));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn answers_from_retrieved_context() {
        let model = ScriptedModel::replying("  Two years.  ");
        let p = pipeline(model.clone()).with_retrieval(2, 0.0);
        p.ingest(DOC.as_bytes()).unwrap();

        let answer = p.answer("How long does the warranty cover defects?").unwrap();
        assert_eq!(answer, "Two years.");
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        let prompt = model.last_prompt.lock().clone().unwrap();
        assert!(prompt.contains("- The warranty covers manufacturing defects"));
        assert!(prompt.ends_with("Question:\nHow long does the warranty cover defects?\n\nAnswer:"));
    }

    #[test]
    fn no_context_refuses_without_calling_model() {
        let model = ScriptedModel::replying("made up");
        // Nothing can score above 1.0, so every search comes back empty.
        let p = pipeline(model.clone()).with_retrieval(4, 1.5);
        p.ingest(DOC.as_bytes()).unwrap();
        assert_eq!(p.answer("Who won the match?").unwrap(), REFUSAL_MESSAGE);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn default_threshold_refuses_unrelated_question() {
        fn axes(text: &str) -> Vec<f32> {
            match text.trim() {
                "aaaa" | "bbbb" => vec![1.0, 0.0],
                "cccc" => vec![-0.5, -1.0],
                _ => vec![0.0, 1.0],
            }
        }
        let model = ScriptedModel::replying("made up");
        let p = RetrievalPipeline::new(
            Chunker::new(5, 0).unwrap(),
            Arc::new(PlainTextExtractor),
            Arc::new(FnEmbedder(axes)),
            model.clone(),
        )
        .with_retrieval(DEFAULT_TOP_K, DEFAULT_SCORE_THRESHOLD);
        assert_eq!(p.ingest(b"aaaa bbbb cccc").unwrap(), 3);

        assert_eq!(p.answer("Who won the match?").unwrap(), REFUSAL_MESSAGE);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        assert!(p.retrieve("Who won the match?").unwrap().is_empty());
    }

    #[test]
    fn empty_model_output_becomes_refusal() {
        let model = ScriptedModel::replying("   ");
        let p = pipeline(model.clone()).with_retrieval(4, -1.0);
        p.ingest(DOC.as_bytes()).unwrap();
        assert_eq!(p.answer("Is shipping free?").unwrap(), REFUSAL_MESSAGE);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn generation_failure_is_distinct_and_keeps_state() {
        let model = ScriptedModel::replying("ok");
        model.unavailable.store(true, Ordering::SeqCst);
        let p = pipeline(model.clone()).with_retrieval(4, -1.0);
        p.ingest(DOC.as_bytes()).unwrap();
        let err = p.answer("Is shipping free?").unwrap_err();
        assert!(matches!(err, PipelineError::GenerationUnavailable(_)));
        assert!(!err.is_user_error());
        assert!(p.is_ready());

        model.unavailable.store(false, Ordering::SeqCst);
        assert_eq!(p.answer("Is shipping free?").unwrap(), "ok");
    }

    #[test]
    fn failed_ingest_keeps_previous_index() {
        let embedder = Arc::new(FlakyEmbedder::default());
        let p = RetrievalPipeline::new(
            Chunker::new(60, 10).unwrap(),
            Arc::new(PlainTextExtractor),
            embedder.clone(),
            ScriptedModel::replying("x"),
        )
        .with_retrieval(4, -1.0);
        let n = p.ingest(DOC.as_bytes()).unwrap();
        let before = p.retrieve("returns policy").unwrap();

        embedder.down.store(true, Ordering::SeqCst);
        assert!(matches!(
            p.ingest(b"A completely different document."),
            Err(PipelineError::Index(IndexError::Embedding(_)))
        ));
        embedder.down.store(false, Ordering::SeqCst);
        assert!(matches!(p.ingest(b""), Err(PipelineError::EmptyDocument)));

        assert!(p.is_ready());
        assert_eq!(p.chunk_count(), n);
        assert_eq!(p.retrieve("returns policy").unwrap(), before);
    }

    #[test]
    fn failed_first_ingest_stays_not_ready() {
        let embedder = Arc::new(FlakyEmbedder::default());
        embedder.down.store(true, Ordering::SeqCst);
        let p = RetrievalPipeline::new(
            Chunker::default(),
            Arc::new(PlainTextExtractor),
            embedder,
            ScriptedModel::replying("x"),
        );
        assert!(p.ingest(DOC.as_bytes()).is_err());
        assert!(!p.is_ready());
        assert!(matches!(p.answer("anything?"), Err(PipelineError::NotReady)));
    }

    #[test]
    fn reingest_replaces_document() {
        let p = pipeline(ScriptedModel::replying("x")).with_retrieval(10, -1.0);
        p.ingest(DOC.as_bytes()).unwrap();
        assert_eq!(p.ingest(b"Only one short sentence.").unwrap(), 1);
        let hits = p.retrieve("warranty").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "Only one short sentence.");
    }

    #[test]
    fn concurrent_searches_see_whole_snapshots() {
        let p = Arc::new(pipeline(ScriptedModel::replying("x")).with_retrieval(100, -1.0));
        let doc_a = "alpha ".repeat(200);
        let doc_b = "bravo ".repeat(50);
        let count_a = p.ingest(doc_a.as_bytes()).unwrap();
        let count_b = Chunker::new(60, 10).unwrap().chunk(&doc_b).len();

        std::thread::scope(|s| {
            let writer = {
                let p = p.clone();
                let (doc_a, doc_b) = (doc_a.clone(), doc_b.clone());
                s.spawn(move || {
                    for i in 0..20 {
                        let doc = if i % 2 == 0 { &doc_b } else { &doc_a };
                        p.ingest(doc.as_bytes()).unwrap();
                    }
                })
            };
            for _ in 0..4 {
                let p = p.clone();
                s.spawn(move || {
                    for _ in 0..50 {
                        let hits = p.retrieve("alpha bravo").unwrap();
                        let all_a = hits.iter().all(|h| h.text.contains("alpha"));
                        let all_b = hits.iter().all(|h| h.text.contains("bravo"));
                        assert!(all_a != all_b, "torn read across two documents");
                        assert!(hits.len() == count_a || hits.len() == count_b);
                    }
                });
            }
            writer.join().unwrap();
        });
    }

    #[test]
    fn concurrent_ingests_run_one_at_a_time() {
        let embedder = Arc::new(OverlapEmbedder::default());
        let p = RetrievalPipeline::new(
            Chunker::new(60, 10).unwrap(),
            Arc::new(PlainTextExtractor),
            embedder.clone(),
            ScriptedModel::replying("x"),
        )
        .with_retrieval(1000, -1.0);
        let words = ["alpha", "bravo", "charlie", "delta"];
        let docs: Vec<String> = words
            .iter()
            .enumerate()
            .map(|(i, word)| format!("{word} ").repeat(40 + 15 * i))
            .collect();
        let chunker = Chunker::new(60, 10).unwrap();
        let counts: Vec<usize> = docs.iter().map(|d| chunker.chunk(d).len()).collect();

        std::thread::scope(|s| {
            for doc in &docs {
                let p = &p;
                s.spawn(move || {
                    for _ in 0..3 {
                        p.ingest(doc.as_bytes()).unwrap();
                    }
                });
            }
        });

        assert_eq!(embedder.max_active.load(Ordering::SeqCst), 1);
        let hits = p.retrieve("alpha bravo charlie delta").unwrap();
        let winner = words
            .iter()
            .position(|w| hits[0].text.contains(w))
            .unwrap();
        let word = words[winner];
        assert_eq!(p.chunk_count(), counts[winner]);
        assert_eq!(hits.len(), counts[winner]);
        assert!(hits.iter().all(|h| h.text.contains(word)));
    }

    #[test]
    fn user_errors_are_classified() {
        assert!(PipelineError::EmptyDocument.is_user_error());
        assert!(PipelineError::EmptyQuestion.is_user_error());
        assert!(PipelineError::NotReady.is_user_error());
        assert!(!PipelineError::Index(IndexError::NotBuilt).is_user_error());
    }

    #[test]
    fn from_config_rejects_bad_chunking() {
        let config = Config {
            chunk_size: 10,
            chunk_overlap: 20,
            ..Config::default()
        };
        let res = RetrievalPipeline::from_config(
            &config,
            Arc::new(PlainTextExtractor),
            Arc::new(HashingEmbedder::default()),
            ScriptedModel::replying("x"),
        );
        assert!(res.is_err());
    }
}
