//! Immutable, atomically-published indexes + metadata defining the
//! queryable state: a manifest, the metadata/BM25 stores, the outline
//! index, and an LRU of per-shard ANN handles loaded lazily from disk.

pub mod builder;
pub mod manager;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::index::{LeafShardIndex, OutlineIndex};
use crate::store::{Bm25Index, MetadataStore};
use crate::types::{DocUri, IndexStats};

pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const CURRENT_FILE: &str = "CURRENT";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const META_FILE: &str = "meta.sqlite";
pub const OUTLINE_DIR: &str = "outline";
pub const OUTLINE_BASENAME: &str = "outline";
pub const SHARDS_DIR: &str = "shards";
pub const BM25_DIR: &str = "bm25";

pub fn snapshots_root(snapshot_dir: &Path) -> PathBuf {
    snapshot_dir.join(SNAPSHOTS_DIR)
}

pub fn snapshot_dir(snapshot_dir: &Path, id: &str) -> PathBuf {
    snapshots_root(snapshot_dir).join(id)
}

pub fn staging_dir(snapshot_dir: &Path, id: &str) -> PathBuf {
    snapshots_root(snapshot_dir).join(format!("{id}.building"))
}

pub fn current_pointer_path(snapshot_dir: &Path) -> PathBuf {
    snapshot_dir.join(CURRENT_FILE)
}

pub fn shard_dir(snapshot_root: &Path, shard_id: u32) -> PathBuf {
    snapshot_root.join(SHARDS_DIR).join(format!("shard_{shard_id:03}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildScope {
    Full,
    Incremental,
}

/// On-disk manifest: `manifest.json` at the root of a snapshot directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub build_duration_ms: u64,
    pub scope: BuildScope,
    pub previous_snapshot_id: Option<String>,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub shard_count: u32,
    /// Bumped whenever `ChunkingConfig::schema_version()` changes, so a
    /// config edit invalidates the embedding cache instead of silently
    /// reusing leafIds computed under different chunk boundaries.
    pub cache_schema_version: u32,
    pub stats: IndexStats,
    pub file_hashes: HashMap<DocUri, String>,
    pub files_failed: u64,
}

impl Manifest {
    pub fn write(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = serde_json::to_vec_pretty(self).context("failed to serialize manifest")?;
        std::fs::write(&path, bytes).with_context(|| format!("failed to write manifest at {}", path.display()))
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let bytes =
            std::fs::read(&path).with_context(|| format!("failed to read manifest at {}", path.display()))?;
        serde_json::from_slice(&bytes).context("failed to parse manifest")
    }
}

/// Lazily loads and caches per-shard ANN handles, bounded by
/// `faiss.maxCachedShards` because the ANN library isn't memory-mapped.
pub struct ShardCache {
    snapshot_root: PathBuf,
    dimension: usize,
    cache: tokio::sync::Mutex<lru::LruCache<u32, Arc<LeafShardIndex>>>,
}

impl ShardCache {
    pub fn new(snapshot_root: PathBuf, dimension: usize, capacity: usize) -> Self {
        Self {
            snapshot_root,
            dimension,
            cache: tokio::sync::Mutex::new(lru::LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap())),
        }
    }

    /// Returns the shard's ANN handle, or `None` if the shard has no leaves
    /// (no directory was written for it during the build).
    pub async fn get(&self, shard_id: u32) -> Result<Option<Arc<LeafShardIndex>>> {
        let mut cache = self.cache.lock().await;
        if let Some(handle) = cache.get(&shard_id) {
            return Ok(Some(handle.clone()));
        }
        drop(cache);

        let dir = shard_dir(&self.snapshot_root, shard_id);
        if !dir.is_dir() {
            return Ok(None);
        }
        let handle = Arc::new(
            LeafShardIndex::open(&dir, self.dimension)
                .await
                .with_context(|| format!("failed to open shard {shard_id}"))?,
        );

        let mut cache = self.cache.lock().await;
        cache.put(shard_id, handle.clone());
        Ok(Some(handle))
    }
}

/// One loaded, immutable snapshot: the unit the engine swaps atomically.
pub struct Snapshot {
    pub id: String,
    pub dir: PathBuf,
    pub manifest: Manifest,
    pub store: Mutex<MetadataStore>,
    pub bm25: Bm25Index,
    pub outline: OutlineIndex,
    pub shards: ShardCache,
}

impl Snapshot {
    /// Loads a previously activated snapshot directory (not staged).
    pub fn open(dir: &Path, max_cached_shards: usize) -> Result<Self> {
        let manifest = Manifest::read(dir)?;
        let store = MetadataStore::open(&dir.join(META_FILE))?;
        let bm25 = Bm25Index::open(&dir.join(BM25_DIR))?;
        let outline = OutlineIndex::load(&dir.join(OUTLINE_DIR), OUTLINE_BASENAME)
            .with_context(|| format!("failed to load outline index for snapshot {}", manifest.snapshot_id))?;

        Ok(Self {
            id: manifest.snapshot_id.clone(),
            dir: dir.to_path_buf(),
            manifest,
            store: Mutex::new(store),
            bm25,
            outline,
            shards: ShardCache::new(dir.to_path_buf(), crate::embeddings::EMBED_DIMENSION, max_cached_shards),
        })
    }

    pub fn stats(&self) -> IndexStats {
        self.manifest.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest {
            snapshot_id: "abc123".to_string(),
            created_at: Utc::now(),
            build_duration_ms: 42,
            scope: BuildScope::Full,
            previous_snapshot_id: None,
            embedding_model: "multilingual-e5-large".to_string(),
            embedding_dimension: 1024,
            shard_count: 128,
            cache_schema_version: 7,
            stats: IndexStats { docs: 1, nodes: 2, leaves: 3, shards: 1 },
            file_hashes: HashMap::new(),
            files_failed: 0,
        };
        manifest.write(dir.path()).unwrap();
        let loaded = Manifest::read(dir.path()).unwrap();
        assert_eq!(loaded.snapshot_id, "abc123");
        assert_eq!(loaded.shard_count, 128);
    }
}
