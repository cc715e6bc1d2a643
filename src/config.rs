use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub vault_root: PathBuf,
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub sharding: ShardingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub faiss: FaissConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from(".msrl")
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub max_sequence_length: usize,
    pub num_threads: usize,
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/embedding/model.onnx"),
            tokenizer_path: PathBuf::from("models/embedding"),
            max_sequence_length: 8192,
            num_threads: 4,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub target_min: usize,
    pub target_max: usize,
    pub hard_max: usize,
    pub min_preferred: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_min: 600,
            target_max: 1000,
            hard_max: 1200,
            min_preferred: 200,
            overlap: 100,
        }
    }
}

impl ChunkingConfig {
    /// Bumped whenever a change here could shift existing chunk offsets, so
    /// the embedding cache is invalidated instead of trusting stale leafIds.
    /// See the manifest's `cacheSchemaVersion` field.
    pub fn schema_version(&self) -> u32 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        use std::hash::{Hash, Hasher};
        self.target_min.hash(&mut hasher);
        self.target_max.hash(&mut hasher);
        self.hard_max.hash(&mut hasher);
        self.min_preferred.hash(&mut hasher);
        self.overlap.hash(&mut hasher);
        (hasher.finish() & 0xffff_ffff) as u32
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShardingConfig {
    pub shard_count: u32,
    pub max_shards_per_query: usize,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            shard_count: 128,
            max_shards_per_query: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub vector_weight: f32,
    pub bm25_weight: f32,
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub default_max_excerpt_chars: usize,
    pub max_max_excerpt_chars: usize,
    pub span_merge_gap_threshold: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_weight: 0.75,
            bm25_weight: 0.25,
            default_top_k: 8,
            max_top_k: 50,
            default_max_excerpt_chars: 4000,
            max_max_excerpt_chars: 20000,
            span_merge_gap_threshold: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FaissConfig {
    pub max_cached_shards: usize,
    pub ivfpq_threshold: usize,
    pub nprobe: usize,
}

impl Default for FaissConfig {
    fn default() -> Self {
        Self {
            max_cached_shards: 16,
            ivfpq_threshold: 1000,
            nprobe: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WatcherConfig {
    pub enabled: bool,
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 2000,
        }
    }
}

impl EngineConfig {
    pub fn new(vault_root: impl Into<PathBuf>) -> Self {
        let vault_root = vault_root.into();
        let snapshot_dir = vault_root.join(".msrl");
        Self {
            vault_root,
            snapshot_dir,
            embedding: EmbeddingConfig::default(),
            chunking: ChunkingConfig::default(),
            sharding: ShardingConfig::default(),
            retrieval: RetrievalConfig::default(),
            faiss: FaissConfig::default(),
            watcher: WatcherConfig::default(),
            log_level: default_log_level(),
        }
    }

    /// Validate config values, returning `INVALID_ARGUMENT` for broken configurations.
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |field: &str, reason: &str| EngineError::InvalidArgument {
            field: field.to_string(),
            value: String::new(),
            reason: reason.to_string(),
            valid_options: None,
        };

        if !self.vault_root.is_dir() {
            return Err(invalid("vault_root", "must be an existing directory"));
        }
        let w = self.retrieval.vector_weight;
        let b = self.retrieval.bm25_weight;
        if (w + b - 1.0).abs() > 1e-6 {
            return Err(invalid(
                "retrieval.vector_weight+bm25_weight",
                "weights must sum to 1.0",
            ));
        }
        if self.sharding.shard_count == 0 {
            return Err(invalid("sharding.shard_count", "must be > 0"));
        }
        if self.chunking.target_min == 0 || self.chunking.target_max < self.chunking.target_min {
            return Err(invalid(
                "chunking.target_min/target_max",
                "target_max must be >= target_min > 0",
            ));
        }
        if self.chunking.hard_max < self.chunking.target_max {
            return Err(invalid(
                "chunking.hard_max",
                "hard_max must be >= target_max",
            ));
        }
        if self.watcher.debounce_ms < 100 {
            return Err(invalid("watcher.debounce_ms", "must be >= 100"));
        }
        if self.retrieval.default_max_excerpt_chars < 200
            || self.retrieval.max_max_excerpt_chars < self.retrieval.default_max_excerpt_chars
        {
            return Err(invalid(
                "retrieval.max_max_excerpt_chars",
                "must be >= default_max_excerpt_chars >= 200",
            ));
        }
        Ok(())
    }

    /// Load config from a JSON file, then apply environment overrides and validate.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Applies `MSRL_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MSRL_VAULT_ROOT") {
            self.vault_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MSRL_SNAPSHOT_DIR") {
            self.snapshot_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MSRL_MODEL_PATH") {
            self.embedding.model_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MSRL_EMBEDDING_THREADS") {
            if let Ok(n) = v.parse() {
                self.embedding.num_threads = n;
            }
        }
        if let Ok(v) = std::env::var("MSRL_WATCHER_ENABLED") {
            self.watcher.enabled = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("MSRL_WATCHER_DEBOUNCE_MS") {
            if let Ok(n) = v.parse() {
                self.watcher.debounce_ms = n;
            }
        }
        if let Ok(v) = std::env::var("MSRL_LOG_LEVEL") {
            self.log_level = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_sum_to_one() {
        let cfg = RetrievalConfig::default();
        assert!((cfg.vector_weight + cfg.bm25_weight - 1.0).abs() < 1e-6);
    }

    #[test]
    fn validate_rejects_bad_weights() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = EngineConfig::new(dir.path());
        cfg.retrieval.vector_weight = 0.9;
        cfg.retrieval.bm25_weight = 0.3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn schema_version_changes_with_targets() {
        let a = ChunkingConfig::default();
        let mut b = a;
        b.target_max += 1;
        assert_ne!(a.schema_version(), b.schema_version());
    }
}
