//! Top-level orchestrator: owns the embedder, the active snapshot, the
//! retrieval pipeline, the watcher, and the single-build mutex guarding
//! reindex operations.

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::embeddings::{Embedder, OnnxEmbedder};
use crate::error::EngineError;
use crate::hashing::text_hash;
use crate::parser::normalize;
use crate::scanner::scan_vault;
use crate::search::RetrievalPipeline;
use crate::snapshot::builder::{NoopProgress, SnapshotBuilder};
use crate::snapshot::manager::SnapshotManager;
use crate::snapshot::{snapshot_dir, BuildScope, Manifest, Snapshot};
use crate::types::{
    ChangeSet, DocUri, EngineState, EngineStatus, FileEntry, IndexStats, QueryParams, QueryResponse, WatchEvent,
    WatcherStatus,
};
use crate::watcher::FileWatcher;

/// Number of recent snapshots kept on disk; older ones are pruned after
/// every successful build.
const KEEP_SNAPSHOTS: usize = 3;

pub struct ReindexOutcome {
    pub completed: bool,
    pub snapshot_id: String,
    pub stats: IndexStats,
}

pub struct Engine {
    config: EngineConfig,
    embedder: Arc<dyn Embedder>,
    manager: SnapshotManager,
    active: RwLock<Option<Arc<Snapshot>>>,
    pipeline: RetrievalPipeline,
    build_lock: tokio::sync::Mutex<()>,
    building_since: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
    watcher: Mutex<Option<FileWatcher>>,
}

impl Engine {
    /// Validates `config`, ensures the snapshot root exists, loads the
    /// embedding model, recovers the latest valid snapshot (if any), starts
    /// the watcher if enabled, and triggers an initial full build when the
    /// vault has never been indexed.
    pub async fn create(config: EngineConfig) -> Result<Arc<Self>, EngineError> {
        config.validate()?;
        std::fs::create_dir_all(&config.snapshot_dir)
            .with_context(|| format!("failed to create snapshot root at {}", config.snapshot_dir.display()))?;

        let embedder: Arc<dyn Embedder> = Arc::new(OnnxEmbedder::new(config.embedding.clone())?);
        let manager = SnapshotManager::new(config.snapshot_dir.clone(), config.faiss.max_cached_shards);
        let recovered = manager.recover()?;
        let pipeline = RetrievalPipeline::new(
            config.vault_root.clone(),
            config.retrieval,
            config.sharding,
            config.faiss,
            embedder.clone(),
        );

        let has_snapshot = recovered.is_some();
        let engine = Arc::new(Self {
            config: config.clone(),
            embedder,
            manager,
            active: RwLock::new(recovered),
            pipeline,
            build_lock: tokio::sync::Mutex::new(()),
            building_since: Mutex::new(None),
            last_error: Mutex::new(None),
            watcher: Mutex::new(None),
        });

        if !has_snapshot {
            info!("no snapshot found, triggering initial full build");
            engine.reindex(true, true).await?;
        }

        if config.watcher.enabled {
            engine.start_watcher(config.watcher.debounce_ms)?;
        }

        Ok(engine)
    }

    /// Delegates to the retrieval pipeline against the currently active
    /// snapshot, after validating `params` against configured bounds.
    pub async fn query(&self, params: QueryParams) -> Result<QueryResponse, EngineError> {
        self.validate_query_params(&params)?;
        let snapshot = self.active.read().clone().ok_or(EngineError::NotIndexed)?;
        Ok(self.pipeline.query(&snapshot, &params).await?)
    }

    fn validate_query_params(&self, params: &QueryParams) -> Result<(), EngineError> {
        let invalid = |field: &str, value: String, reason: &str| EngineError::InvalidArgument {
            field: field.to_string(),
            value,
            reason: reason.to_string(),
            valid_options: None,
        };
        if params.query.trim().is_empty() {
            return Err(invalid("query", params.query.clone(), "must not be empty"));
        }
        let max_top_k = self.config.retrieval.max_top_k;
        if params.top_k == 0 || params.top_k > max_top_k {
            return Err(invalid(
                "top_k",
                params.top_k.to_string(),
                &format!("must be in [1, {max_top_k}]"),
            ));
        }
        let max_excerpt = self.config.retrieval.max_max_excerpt_chars;
        if params.max_excerpt_chars < 200 || params.max_excerpt_chars > max_excerpt {
            return Err(invalid(
                "max_excerpt_chars",
                params.max_excerpt_chars.to_string(),
                &format!("must be in [200, {max_excerpt}]"),
            ));
        }
        Ok(())
    }

    /// Rebuilds the index. `wait=false` fails immediately with `INDEX_BUSY`
    /// if a build is already running; `wait=true` queues behind it with no
    /// piggybacking (the queued call always runs its own build afterward).
    /// `force=true` always does a full rebuild; otherwise an incremental
    /// build runs against the content-hash diff of the current vault scan.
    pub async fn reindex(&self, wait: bool, force: bool) -> Result<ReindexOutcome, EngineError> {
        let _guard = if wait {
            self.build_lock.lock().await
        } else {
            match self.build_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    let started = self.building_since.lock().unwrap_or_else(Utc::now);
                    return Err(EngineError::IndexBusy { current_build_started_at: started });
                }
            }
        };

        self.last_error.lock().take();
        *self.building_since.lock() = Some(Utc::now());
        let result = self.run_build(force).await;
        *self.building_since.lock() = None;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(error = %e, "reindex failed");
                *self.last_error.lock() = Some(format!("{e:#}"));
                Err(e.into())
            }
        }
    }

    async fn run_build(&self, force: bool) -> anyhow::Result<ReindexOutcome> {
        let started = Instant::now();
        let files = scan_vault(&self.config.vault_root)?;
        let prev = self.active.read().clone();

        let (id, staging_dir) = self.manager.new_staging_dir();
        let builder = SnapshotBuilder::new(self.config.vault_root.clone(), self.config.clone(), self.embedder.clone());
        let progress = NoopProgress;

        let (scope, outcome) = match (&prev, force) {
            (Some(_), false) => {
                let prev_snapshot = prev.as_ref().unwrap();
                let known = known_docs(&self.config.vault_root, &files)?;
                let changed = prev_snapshot.store.lock().get_changed_docs(&known)?;
                let changes = ChangeSet {
                    added: changed.added,
                    modified: changed.modified,
                    deleted: changed.deleted,
                };
                if changes.is_empty() {
                    return Ok(ReindexOutcome {
                        completed: true,
                        snapshot_id: prev_snapshot.id.clone(),
                        stats: prev_snapshot.stats(),
                    });
                }
                let outcome = builder.build_incremental(prev_snapshot, &changes, &staging_dir, &progress).await?;
                (BuildScope::Incremental, outcome)
            }
            _ => {
                let outcome = builder.build_full(&files, &staging_dir, &progress).await?;
                (BuildScope::Full, outcome)
            }
        };

        let manifest = Manifest {
            snapshot_id: id.clone(),
            created_at: Utc::now(),
            build_duration_ms: started.elapsed().as_millis() as u64,
            scope,
            previous_snapshot_id: prev.as_ref().map(|s| s.id.clone()),
            embedding_model: self.config.embedding.model_path.display().to_string(),
            embedding_dimension: self.embedder.dimension(),
            shard_count: self.config.sharding.shard_count,
            cache_schema_version: self.config.chunking.schema_version(),
            stats: outcome.stats.clone(),
            file_hashes: outcome.file_hashes,
            files_failed: outcome.files_failed,
        };
        manifest.write(&staging_dir)?;

        self.manager.validate(&staging_dir)?;
        self.manager.activate(&id, &staging_dir)?;

        let loaded = Snapshot::open(&snapshot_dir(&self.config.snapshot_dir, &id), self.config.faiss.max_cached_shards)?;
        *self.active.write() = Some(Arc::new(loaded));

        let ordered: Vec<String> = self.manager.list_by_recency()?.into_iter().map(|(id, _)| id).collect();
        self.manager.cleanup_old_snapshots(&ordered, KEEP_SNAPSHOTS)?;

        info!(snapshot_id = %id, docs = outcome.stats.docs, "activated new snapshot");
        Ok(ReindexOutcome {
            completed: true,
            snapshot_id: id,
            stats: outcome.stats,
        })
    }

    pub fn get_status(&self) -> EngineStatus {
        let active = self.active.read().clone();
        let building = *self.building_since.lock();
        let error = self.last_error.lock().clone();

        let state = if building.is_some() {
            EngineState::Building
        } else if error.is_some() {
            EngineState::Error
        } else {
            EngineState::Ready
        };

        let watcher = self.watcher.lock();
        EngineStatus {
            state,
            snapshot_id: active.as_ref().map(|s| s.id.clone()),
            snapshot_timestamp: active.as_ref().map(|s| s.manifest.created_at),
            stats: active.as_ref().map(|s| s.stats()).unwrap_or_default(),
            watcher: WatcherStatus {
                enabled: watcher.is_some(),
                debounce_ms: watcher.as_ref().map(|w| w.debounce_ms()).unwrap_or(self.config.watcher.debounce_ms),
            },
            error,
        }
    }

    /// Starts or stops the watcher. A debounce change restarts it. Not
    /// persisted: the next `create` re-reads the config default.
    pub fn set_watch(self: &Arc<Self>, enabled: bool, debounce_ms: u64) -> Result<(), EngineError> {
        {
            let mut watcher = self.watcher.lock();
            if let Some(w) = watcher.as_mut() {
                w.stop();
            }
            *watcher = None;
        }
        if enabled {
            self.start_watcher(debounce_ms)?;
        }
        Ok(())
    }

    fn start_watcher(self: &Arc<Self>, debounce_ms: u64) -> Result<(), EngineError> {
        let engine = self.clone();
        let watcher = FileWatcher::start(self.config.vault_root.clone(), debounce_ms, move |batch| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine.handle_watch_batch(batch).await;
            });
        })?;
        *self.watcher.lock() = Some(watcher);
        Ok(())
    }

    async fn handle_watch_batch(self: Arc<Self>, batch: Vec<WatchEvent>) {
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.reindex(true, false).await {
            warn!(error = %e, "watch-triggered reindex failed");
        }
    }

    /// Stops the watcher. The active snapshot and embedder are released
    /// when the last `Arc<Engine>` clone (held by in-flight readers) drops.
    pub fn shutdown(&self) {
        if let Some(mut w) = self.watcher.lock().take() {
            w.stop();
        }
        info!("engine shut down");
    }
}

/// Scans and hashes the current content of every file in `files`, producing
/// the `{docUri → (mtime, hash)}` map `MetadataStore::get_changed_docs`
/// diffs against the prior snapshot's stored rows.
fn known_docs(vault_root: &std::path::Path, files: &[FileEntry]) -> anyhow::Result<HashMap<DocUri, (i64, String)>> {
    let mut known = HashMap::with_capacity(files.len());
    for entry in files {
        let abs_path = vault_root.join(&entry.doc_uri);
        let raw = std::fs::read_to_string(&abs_path)
            .with_context(|| format!("failed to read {}", abs_path.display()))?;
        let normalized = normalize(&raw);
        known.insert(entry.doc_uri.clone(), (entry.mtime_ms, text_hash(&normalized)));
    }
    Ok(known)
}
