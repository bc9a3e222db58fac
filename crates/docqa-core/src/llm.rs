//! Prompt → text completion, the last step of answering a question.

use std::time::Duration;

use thiserror::Error;

/// A language model that completes a prompt in one blocking, non-streaming call.
///
/// Implementations must bound how long a call may wait and report an unreachable or slow
/// backend as a [`GenerationError`]; the caller treats every such error as retryable.
pub trait LanguageModel: Send + Sync {
    fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("language model request failed: {0}")]
    Request(String),
    #[error("language model did not answer within {0:?}")]
    Timeout(Duration),
}
