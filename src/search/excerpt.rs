//! Reads the normalized source text for a span and truncates it to a
//! caller-supplied character budget, caching per-document file content the
//! same way the teacher caches embeddings: an `lru::LruCache`, same crate,
//! same eviction policy, different payload.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use crate::parser::normalize;
use crate::types::DocUri;

pub struct ExcerptExtractor {
    vault_root: PathBuf,
    cache: Mutex<lru::LruCache<DocUri, std::sync::Arc<Vec<char>>>>,
}

pub struct Excerpt {
    pub text: String,
    pub truncated: bool,
}

impl ExcerptExtractor {
    pub fn new(vault_root: impl Into<PathBuf>, cache_capacity: usize) -> Self {
        Self {
            vault_root: vault_root.into(),
            cache: Mutex::new(lru::LruCache::new(
                NonZeroUsize::new(cache_capacity.max(1)).unwrap(),
            )),
        }
    }

    fn document_chars(&self, doc_uri: &str) -> Result<std::sync::Arc<Vec<char>>> {
        if let Some(cached) = self.cache.lock().get(doc_uri) {
            return Ok(cached.clone());
        }
        let path = self.vault_root.join(doc_uri);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read source file {}", path.display()))?;
        let normalized = normalize(&raw);
        let chars = std::sync::Arc::new(normalized.chars().collect::<Vec<char>>());
        self.cache.lock().put(doc_uri.to_string(), chars.clone());
        Ok(chars)
    }

    /// Slices `[start_char, end_char)` and truncates at the latest space
    /// position within `[0.5·max, max]` if it exceeds `max_excerpt_chars`
    /// (falling back to a hard cut). The caller's original offsets are kept
    /// even when `truncated` is true.
    pub fn extract(&self, doc_uri: &str, start_char: usize, end_char: usize, max_excerpt_chars: usize) -> Result<Excerpt> {
        let chars = self.document_chars(doc_uri)?;
        let end = end_char.min(chars.len());
        let start = start_char.min(end);
        let slice = &chars[start..end];

        if slice.len() <= max_excerpt_chars {
            return Ok(Excerpt {
                text: slice.iter().collect(),
                truncated: false,
            });
        }

        let lower_bound = max_excerpt_chars / 2;
        let mut cut = max_excerpt_chars;
        for i in (lower_bound..max_excerpt_chars).rev() {
            if slice[i] == ' ' {
                cut = i;
                break;
            }
        }

        Ok(Excerpt {
            text: slice[..cut].iter().collect(),
            truncated: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_returns_exact_slice_when_under_budget() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "# H\n\nHello world.\n").unwrap();
        let extractor = ExcerptExtractor::new(dir.path(), 16);
        let excerpt = extractor.extract("a.md", 5, 18, 4000).unwrap();
        assert!(!excerpt.truncated);
        assert_eq!(excerpt.text, "Hello world.");
    }

    #[test]
    fn extract_truncates_at_space_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let body: String = (0..100).map(|_| "word ").collect();
        std::fs::write(dir.path().join("a.md"), &body).unwrap();
        let extractor = ExcerptExtractor::new(dir.path(), 16);
        let excerpt = extractor.extract("a.md", 0, body.chars().count(), 50).unwrap();
        assert!(excerpt.truncated);
        assert!(!excerpt.text.ends_with("wor"));
        assert!(excerpt.text.len() <= 50);
    }

    #[test]
    fn document_content_is_cached_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "cached text here\n").unwrap();
        let extractor = ExcerptExtractor::new(dir.path(), 16);
        let first = extractor.extract("a.md", 0, 6, 4000).unwrap();
        std::fs::remove_file(dir.path().join("a.md")).unwrap();
        let second = extractor.extract("a.md", 0, 6, 4000).unwrap();
        assert_eq!(first.text, second.text);
    }
}
