//! Tokenization and embedding. `Embedder` is the seam the rest of the crate
//! depends on; `OnnxEmbedder` is the concrete ONNX Runtime implementation.

pub mod model;
pub mod tokenizer;

use anyhow::Result;

pub use model::{EmbedderMode, OnnxEmbedder};
pub use tokenizer::SentencePieceTokenizer;

use crate::types::EmbedResult;

/// Embedding dimension produced by every `Embedder` implementation.
pub const EMBED_DIMENSION: usize = 1024;

/// Seam behind which the concrete embedding model sits. Query and passage
/// text get model-appropriate prefixes internally; callers just say which
/// kind of text they have.
pub trait Embedder: Send + Sync {
    fn embed_query(&self, text: &str) -> Result<EmbedResult>;
    fn embed_passage(&self, text: &str) -> Result<EmbedResult>;
    fn embed_passages(&self, texts: &[&str]) -> Result<Vec<EmbedResult>> {
        texts.iter().map(|t| self.embed_passage(t)).collect()
    }
    fn dimension(&self) -> usize {
        EMBED_DIMENSION
    }

    /// Exact token count when the tokenizer is loaded; callers that need a
    /// count before the model is ready use `approx_token_count` instead.
    fn count_tokens(&self, text: &str) -> usize;
}

/// `⌈len/4⌉` approximation used to bootstrap the chunker before an embedder
/// is loaded, or wherever an exact tokenizer is unavailable.
pub fn approx_token_count(text: &str) -> usize {
    (text.chars().count() + 3) / 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approx_token_count_rounds_up() {
        assert_eq!(approx_token_count(""), 0);
        assert_eq!(approx_token_count("abcd"), 1);
        assert_eq!(approx_token_count("abcde"), 2);
    }

    #[test]
    fn approx_token_count_counts_chars_not_bytes() {
        // each '→' is 3 bytes in utf8 but a single char
        assert_eq!(approx_token_count("→→→→"), 1);
    }
}
