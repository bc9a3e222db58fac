//! Grounded-answer prompt construction.

macro_rules! refusal {
    () => {
        "I cannot find this information in the provided document."
    };
}

/// Returned whenever no relevant context is found or the model gives no usable answer.
/// The prompt instructs the model to reply with exactly this sentence, so callers cannot
/// tell the two cases apart.
pub const REFUSAL_MESSAGE: &str = refusal!();

const SYSTEM_PROMPT: &str = concat!(
    "You are an information retrieval assistant.\n",
    "Answer only using the provided context.\n",
    "If the answer is not in the context, respond exactly with: \"",
    refusal!(),
    "\".\n",
    "Do not use any external knowledge or make up information."
);

/// Renders the instruction, the non-blank context chunks (trimmed, in the given order),
/// the trimmed question, and a trailing `Answer:` marker.
pub fn build_prompt<S: AsRef<str>>(context_chunks: &[S], question: &str) -> String {
    let context = context_chunks
        .iter()
        .map(|c| c.as_ref().trim())
        .filter(|c| !c.is_empty())
        .map(|c| format!("- {c}"))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "{SYSTEM_PROMPT}\n\nContext:\n{context}\n\nQuestion:\n{}\n\nAnswer:",
        question.trim()
    )
}
