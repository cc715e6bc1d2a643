//! Builds a staged snapshot directory from a file list (full build) or from
//! a prior snapshot plus a change set (incremental build).
//!
//! Per-file failures are caught with `AssertUnwindSafe(...).catch_unwind()`
//! around the parse/chunk/embed step, mirroring the teacher's
//! `indexing.rs::index_folder` panic containment, so one malformed file
//! cannot abort a vault-wide build.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::chunker;
use crate::config::EngineConfig;
use crate::embeddings::Embedder;
use crate::fence;
use crate::hashing::text_hash;
use crate::index::node_embedder::node_vector;
use crate::index::{LeafShardIndex, OutlineIndex};
use crate::parser;
use crate::shard;
use crate::store::{Bm25Index, DocRecord, MetadataStore};
use crate::types::{Chunk, DocUri, FileEntry, HeadingNode, IndexStats};

use super::{shard_dir, Snapshot, BM25_DIR, META_FILE, OUTLINE_BASENAME, OUTLINE_DIR, SHARDS_DIR};

/// Callback surface for build progress, generalized from the teacher's
/// `emit_progress`/`IndexingProgress` pair to a plain trait so hosts other
/// than Tauri (HTTP server, CLI, MCP stdio) can all drive a UI from it.
pub trait BuildProgress: Send + Sync {
    fn on_file(&self, processed: usize, total: usize, doc_uri: &str);
    fn on_done(&self, files_failed: u64);
}

pub struct NoopProgress;

impl BuildProgress for NoopProgress {
    fn on_file(&self, _processed: usize, _total: usize, _doc_uri: &str) {}
    fn on_done(&self, _files_failed: u64) {}
}

/// Drives an `indicatif::ProgressBar`, the teacher's own choice for
/// long-running CLI-visible work.
pub struct IndicatifProgress {
    bar: indicatif::ProgressBar,
}

impl IndicatifProgress {
    pub fn new(total: usize) -> Self {
        let bar = indicatif::ProgressBar::new(total as u64);
        bar.set_style(
            indicatif::ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar()),
        );
        Self { bar }
    }
}

impl BuildProgress for IndicatifProgress {
    fn on_file(&self, processed: usize, total: usize, doc_uri: &str) {
        self.bar.set_position(processed as u64);
        self.bar.set_length(total as u64);
        self.bar.set_message(doc_uri.to_string());
    }

    fn on_done(&self, files_failed: u64) {
        self.bar.finish_with_message(format!("done, {files_failed} files failed"));
    }
}

pub struct BuildOutcome {
    pub stats: IndexStats,
    pub file_hashes: HashMap<DocUri, String>,
    pub files_failed: u64,
}

pub struct SnapshotBuilder {
    vault_root: std::path::PathBuf,
    config: EngineConfig,
    embedder: Arc<dyn Embedder>,
}

/// One file's parse/chunk/embed output, ready to be merged into a store.
struct ProcessedFile {
    doc_uri: DocUri,
    content_hash: String,
    mtime_ms: i64,
    size: u64,
    shard_id: u32,
    tree: HeadingNode,
    chunks: Vec<Chunk>,
    vectors: HashMap<String, Vec<f32>>,
}

impl SnapshotBuilder {
    pub fn new(vault_root: impl Into<std::path::PathBuf>, config: EngineConfig, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            vault_root: vault_root.into(),
            config,
            embedder,
        }
    }

    /// Parses, chunks, and embeds one file. `cache` is consulted by leafId
    /// for embedding reuse (incremental builds only); a schema-version
    /// mismatch with the prior snapshot means the caller passes `None`.
    fn process_file(&self, entry: &FileEntry, cache: Option<&MetadataStore>) -> Result<ProcessedFile> {
        let abs_path = self.vault_root.join(&entry.doc_uri);
        let raw = std::fs::read_to_string(&abs_path)
            .with_context(|| format!("failed to read {}", abs_path.display()))?;
        let normalized = parser::normalize(&raw);
        let tree = parser::build_heading_tree(&normalized, &entry.doc_uri);
        let fences = fence::detect_fences(&normalized);
        let shard_id = shard::shard_id(&entry.doc_uri, self.config.sharding.shard_count);

        let mut chunks = Vec::new();
        for node in tree.iter() {
            chunks.extend(chunker::chunk_node(
                node,
                &normalized,
                shard_id,
                &self.config.chunking,
                &fences,
                &|t| self.embedder.count_tokens(t),
            ));
        }

        let mut vectors = HashMap::with_capacity(chunks.len());
        for chunk in &chunks {
            let cached = match cache {
                Some(store) => store.get_embedding(&chunk.leaf_id)?,
                None => None,
            };
            let vector = match cached {
                Some(v) => v,
                None => self.embedder.embed_passage(&chunk.text)?.vector,
            };
            vectors.insert(chunk.leaf_id.clone(), vector);
        }

        Ok(ProcessedFile {
            doc_uri: entry.doc_uri.clone(),
            content_hash: text_hash(&normalized),
            mtime_ms: entry.mtime_ms,
            size: entry.size,
            shard_id,
            tree,
            chunks,
            vectors,
        })
    }

    /// Parses/chunks/embeds one file with panic containment, returning
    /// `None` (and incrementing `files_failed` via the caller) on either an
    /// error or a caught panic.
    fn process_file_guarded(&self, entry: &FileEntry, cache: Option<&MetadataStore>) -> Option<ProcessedFile> {
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| self.process_file(entry, cache)));
        match result {
            Ok(Ok(processed)) => Some(processed),
            Ok(Err(e)) => {
                warn!(doc_uri = %entry.doc_uri, error = %e, "failed to process file");
                None
            }
            Err(_) => {
                warn!(doc_uri = %entry.doc_uri, "panicked while processing file");
                None
            }
        }
    }

    /// Writes a processed file's rows, BM25 postings, and shard vectors into
    /// the staging store, returning node vectors ready for outline
    /// insertion (descendant leaves are entirely within this one document,
    /// so they are computed in-memory from `processed.chunks`).
    fn ingest(
        &self,
        store: &mut MetadataStore,
        bm25: &Bm25Index,
        shard_batches: &mut HashMap<u32, Vec<(String, Vec<f32>)>>,
        processed: &ProcessedFile,
    ) -> Result<Vec<(String, Vec<f32>, HashSet<u32>)>> {
        let doc_id = store.upsert_doc(&DocRecord {
            doc_uri: processed.doc_uri.clone(),
            mtime_ms: processed.mtime_ms,
            size: processed.size,
            hash: processed.content_hash.clone(),
        })?;
        store.replace_doc_contents(doc_id, &processed.tree, &processed.chunks)?;

        for chunk in &processed.chunks {
            let vector = processed
                .vectors
                .get(&chunk.leaf_id)
                .context("missing vector for a just-chunked leaf")?;
            store.set_embedding(&chunk.leaf_id, vector)?;
            bm25.index_leaf(&chunk.leaf_id, &chunk.text, chunk.shard_id)?;
            shard_batches
                .entry(chunk.shard_id)
                .or_default()
                .push((chunk.leaf_id.clone(), vector.clone()));
        }

        let mut node_vectors = Vec::new();
        for node in processed.tree.iter() {
            let descendant_vectors: Vec<Vec<f32>> = processed
                .chunks
                .iter()
                .filter(|c| c.start_char >= node.start_char && c.end_char <= node.end_char)
                .filter_map(|c| processed.vectors.get(&c.leaf_id).cloned())
                .collect();
            if descendant_vectors.is_empty() {
                continue;
            }
            let mut shards = HashSet::new();
            shards.insert(processed.shard_id);
            node_vectors.push((node.node_id.clone(), node_vector(&descendant_vectors), shards));
        }
        Ok(node_vectors)
    }

    /// Parses, chunks, embeds, and indexes every file in `files` from
    /// scratch into `staging_dir`.
    pub async fn build_full(
        &self,
        files: &[FileEntry],
        staging_dir: &Path,
        progress: &dyn BuildProgress,
    ) -> Result<BuildOutcome> {
        std::fs::create_dir_all(staging_dir).context("failed to create staging directory")?;
        let mut store = MetadataStore::open(&staging_dir.join(META_FILE))?;
        let bm25 = Bm25Index::open(&staging_dir.join(BM25_DIR))?;

        let mut shard_batches: HashMap<u32, Vec<(String, Vec<f32>)>> = HashMap::new();
        let mut outline_entries = Vec::new();
        let mut files_failed = 0u64;

        for (i, entry) in files.iter().enumerate() {
            progress.on_file(i, files.len(), &entry.doc_uri);
            let Some(processed) = self.process_file_guarded(entry, None) else {
                files_failed += 1;
                continue;
            };
            let nodes = self.ingest(&mut store, &bm25, &mut shard_batches, &processed)?;
            outline_entries.extend(nodes);
        }
        progress.on_done(files_failed);

        bm25.commit()?;
        self.write_shards(staging_dir, shard_batches).await?;
        self.write_outline(staging_dir, outline_entries)?;

        Ok(BuildOutcome {
            stats: IndexStats {
                docs: store.doc_count()?,
                nodes: store.node_count()?,
                leaves: store.leaf_count()?,
                shards: self.count_nonempty_shards(staging_dir)?,
            },
            file_hashes: store.all_doc_hashes()?,
            files_failed,
        })
    }

    /// Copies `prev`'s on-disk snapshot into `staging_dir`, applies
    /// `added`/`modified`/`deleted` on top of the copy, rebuilds only the
    /// shards touched by the change, and rebuilds the outline index in
    /// full (it depends on every node's vector, so a partial rebuild isn't
    /// meaningful).
    pub async fn build_incremental(
        &self,
        prev: &Snapshot,
        changes: &crate::types::ChangeSet,
        staging_dir: &Path,
        progress: &dyn BuildProgress,
    ) -> Result<BuildOutcome> {
        copy_dir_recursive(&prev.dir, staging_dir)?;
        let mut store = MetadataStore::open(&staging_dir.join(META_FILE))?;
        let bm25 = Bm25Index::open(&staging_dir.join(BM25_DIR))?;

        let schema_matches = prev.manifest.cache_schema_version == self.config.chunking.schema_version();
        let prev_store_guard = prev.store.lock();

        let mut affected_shards: HashSet<u32> = HashSet::new();

        for doc_uri in changes.modified.iter().chain(changes.deleted.iter()) {
            let old_leaves = store.leaves_for_doc(doc_uri)?;
            for leaf in &old_leaves {
                bm25.delete_leaf(&leaf.leaf_id)?;
                affected_shards.insert(leaf.shard_id);
            }
            store.delete_doc(doc_uri)?;
        }

        let touched: Vec<&DocUri> = changes.added.iter().chain(changes.modified.iter()).collect();
        let total = touched.len();
        let mut files_failed = 0u64;

        for (i, doc_uri) in touched.iter().enumerate() {
            progress.on_file(i, total, doc_uri);
            let entry = FileEntry {
                doc_uri: (*doc_uri).clone(),
                size: std::fs::metadata(self.vault_root.join(doc_uri)).map(|m| m.len()).unwrap_or(0),
                mtime_ms: std::fs::metadata(self.vault_root.join(doc_uri))
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0),
            };
            let cache_source = if schema_matches { Some(&*prev_store_guard) } else { None };
            let Some(processed) = self.process_file_guarded(&entry, cache_source) else {
                files_failed += 1;
                continue;
            };
            affected_shards.insert(processed.shard_id);
            let mut scratch_batches: HashMap<u32, Vec<(String, Vec<f32>)>> = HashMap::new();
            self.ingest(&mut store, &bm25, &mut scratch_batches, &processed)?;
        }
        progress.on_done(files_failed);
        bm25.commit()?;

        for &shard_id in &affected_shards {
            let dir = shard_dir(staging_dir, shard_id);
            std::fs::remove_dir_all(&dir).ok();
            let leaves = store.leaves_in_shard(shard_id)?;
            if leaves.is_empty() {
                continue;
            }
            let index = LeafShardIndex::open(&dir, self.embedder.dimension()).await?;
            let batch: Vec<(String, Vec<f32>)> = leaves
                .into_iter()
                .filter_map(|(leaf_id, vector)| vector.map(|v| (leaf_id, v)))
                .collect();
            index.add(&batch).await?;
            index.train(&self.config.faiss).await?;
        }

        debug!(affected_shards = affected_shards.len(), "rebuilt shards after incremental change");

        let outline_entries = self.rebuild_outline_entries(&store)?;
        self.write_outline(staging_dir, outline_entries)?;

        Ok(BuildOutcome {
            stats: IndexStats {
                docs: store.doc_count()?,
                nodes: store.node_count()?,
                leaves: store.leaf_count()?,
                shards: self.count_nonempty_shards(staging_dir)?,
            },
            file_hashes: store.all_doc_hashes()?,
            files_failed,
        })
    }

    /// Recomputes every node's vector from its current descendant leaves,
    /// using the range-containment property that a leaf's span always
    /// nests inside every ancestor node's span.
    fn rebuild_outline_entries(&self, store: &MetadataStore) -> Result<Vec<(String, Vec<f32>, HashSet<u32>)>> {
        let mut entries = Vec::new();
        for node in store.all_nodes()? {
            let leaves = store.leaves_in_range(node.doc_id, node.start_char, node.end_char)?;
            let vectors: Vec<Vec<f32>> = leaves.iter().filter_map(|l| l.embedding.clone()).collect();
            if vectors.is_empty() {
                continue;
            }
            let mut shards = HashSet::new();
            for leaf in &leaves {
                shards.insert(leaf.shard_id);
            }
            entries.push((node.node_id, node_vector(&vectors), shards));
        }
        Ok(entries)
    }

    async fn write_shards(&self, staging_dir: &Path, batches: HashMap<u32, Vec<(String, Vec<f32>)>>) -> Result<()> {
        for (shard_id, leaves) in batches {
            let dir = shard_dir(staging_dir, shard_id);
            let index = LeafShardIndex::open(&dir, self.embedder.dimension()).await?;
            index.add(&leaves).await?;
            index.train(&self.config.faiss).await?;
        }
        Ok(())
    }

    fn write_outline(&self, staging_dir: &Path, entries: Vec<(String, Vec<f32>, HashSet<u32>)>) -> Result<()> {
        let mut outline = OutlineIndex::new(entries.len());
        for (node_id, vector, shards) in entries {
            outline.insert(&node_id, &vector, shards);
        }
        outline.save(&staging_dir.join(OUTLINE_DIR), OUTLINE_BASENAME)
    }

    fn count_nonempty_shards(&self, staging_dir: &Path) -> Result<u64> {
        let dir = staging_dir.join(SHARDS_DIR);
        if !dir.is_dir() {
            return Ok(0);
        }
        Ok(std::fs::read_dir(&dir)?.filter_map(|e| e.ok()).filter(|e| e.path().is_dir()).count() as u64)
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    for entry in std::fs::read_dir(src).with_context(|| format!("failed to read {}", src.display()))? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)
                .with_context(|| format!("failed to copy {} to {}", src_path.display(), dst_path.display()))?;
        }
    }
    Ok(())
}
