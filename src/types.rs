use serde::{Deserialize, Serialize};

/// Vault-relative, forward-slash, no-leading-slash path ending in `.md`.
pub type DocUri = String;

/// A node in a document's heading tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadingNode {
    pub node_id: String,
    pub doc_uri: DocUri,
    pub level: u8,
    pub title: String,
    pub heading_path: String,
    pub start_char: usize,
    pub end_char: usize,
    pub children: Vec<HeadingNode>,
}

impl HeadingNode {
    /// Depth-first iterator over this node and all descendants.
    pub fn iter(&self) -> HeadingNodeIter<'_> {
        HeadingNodeIter {
            stack: vec![self],
        }
    }
}

pub struct HeadingNodeIter<'a> {
    stack: Vec<&'a HeadingNode>,
}

impl<'a> Iterator for HeadingNodeIter<'a> {
    type Item = &'a HeadingNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        for child in node.children.iter().rev() {
            self.stack.push(child);
        }
        Some(node)
    }
}

/// A fenced code region detected during parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct FenceRegion {
    pub start_char: usize,
    pub end_char: usize,
    pub lang: Option<String>,
}

/// A contiguous character span that is the unit of embedding and BM25 indexing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub leaf_id: String,
    pub doc_uri: DocUri,
    pub node_id: String,
    pub heading_path: String,
    pub start_char: usize,
    pub end_char: usize,
    pub text: String,
    pub text_hash: String,
    pub shard_id: u32,
    pub token_count: usize,
}

/// Result of embedding a single piece of text.
#[derive(Debug, Clone)]
pub struct EmbedResult {
    pub vector: Vec<f32>,
    pub token_count: usize,
}

/// Query-time filters applied in RetrievalPipeline step 7.
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub doc_uri_prefix: Option<String>,
    pub doc_uris: Option<Vec<DocUri>>,
    pub heading_path_prefix: Option<String>,
    pub heading_path_contains: Option<String>,
}

impl QueryFilters {
    pub fn matches(&self, doc_uri: &str, heading_path: &str) -> bool {
        if let Some(prefix) = &self.doc_uri_prefix {
            if !doc_uri.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(uris) = &self.doc_uris {
            if !uris.is_empty() && !uris.iter().any(|u| u == doc_uri) {
                return false;
            }
        }
        if let Some(prefix) = &self.heading_path_prefix {
            if !heading_path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(needle) = &self.heading_path_contains {
            if !heading_path.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub query: String,
    pub top_k: usize,
    pub max_excerpt_chars: usize,
    pub filters: QueryFilters,
    pub include_shards_searched: bool,
}

/// One result row returned from `Engine::query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub doc_uri: DocUri,
    pub heading_path: String,
    pub start_char: usize,
    pub end_char: usize,
    pub excerpt: String,
    pub excerpt_truncated: bool,
    pub score: f32,
    pub vector_score: f32,
    pub bm25_score: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryMeta {
    pub took_ms: u64,
    pub shards_searched: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResponse {
    pub results: Vec<SearchResult>,
    pub meta: QueryMeta,
}

/// `{docUri, size, mtimeMs}` row produced while scanning the vault.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub doc_uri: DocUri,
    pub size: u64,
    pub mtime_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub added: Vec<DocUri>,
    pub modified: Vec<DocUri>,
    pub deleted: Vec<DocUri>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Add,
    Change,
    Unlink,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub doc_uri: DocUri,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Ready,
    Building,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub docs: u64,
    pub nodes: u64,
    pub leaves: u64,
    pub shards: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherStatus {
    pub enabled: bool,
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub snapshot_id: Option<String>,
    pub snapshot_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    pub stats: IndexStats,
    pub watcher: WatcherStatus,
    pub error: Option<String>,
}

/// Converts an absolute path to a vault-relative `DocUri`, rejecting paths
/// that escape the vault root.
pub fn doc_uri_from_abs(abs: &std::path::Path, vault_root: &std::path::Path) -> anyhow::Result<DocUri> {
    let rel = abs
        .strip_prefix(vault_root)
        .map_err(|_| anyhow::anyhow!("path {} is outside vault root {}", abs.display(), vault_root.display()))?;
    let posix = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    Ok(posix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn doc_uri_conversion_s3() {
        let uri = doc_uri_from_abs(Path::new("/vault/notes/a.md"), Path::new("/vault/")).unwrap();
        assert_eq!(uri, "notes/a.md");

        let err = doc_uri_from_abs(Path::new("/other/a.md"), Path::new("/vault"));
        assert!(err.is_err());
    }

    #[test]
    fn filters_empty_doc_uris_means_no_restriction() {
        let filters = QueryFilters {
            doc_uris: Some(vec![]),
            ..Default::default()
        };
        assert!(filters.matches("anything.md", "Any → Path"));
    }

    #[test]
    fn heading_path_contains_is_case_insensitive_substring() {
        let filters = QueryFilters {
            heading_path_contains: Some("Milestone".to_string()),
            ..Default::default()
        };
        assert!(filters.matches("a.md", "Q1 → Milestone: Launch"));
        assert!(!filters.matches("a.md", "Story: Login"));
    }
}
