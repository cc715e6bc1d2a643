//! Orchestrates a single query end to end: embed, route, fan out to shards,
//! fuse, merge, extract. Mirrors the teacher's `rag_engine.rs::search_comprehensive`
//! shape (embed once, search branches concurrently, combine) generalized from
//! a flat single-index search to the shard-routed hybrid search this crate
//! needs.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{FaissConfig, RetrievalConfig, ShardingConfig};
use crate::embeddings::Embedder;
use crate::search::excerpt::ExcerptExtractor;
use crate::search::hybrid::{fuse, HybridWeights};
use crate::search::span_merge::{merge_spans, SpanCandidate};
use crate::shard;
use crate::snapshot::Snapshot;
use crate::types::{QueryMeta, QueryParams, QueryResponse, SearchResult};

/// Number of nearest outline nodes consulted when routing a query to
/// candidate shards. Not config-exposed: it trades routing recall against
/// latency at a finer grain than `maxShardsPerQuery` already controls.
const ROUTE_TOP_NODES: usize = 8;
const EXCERPT_CACHE_CAPACITY: usize = 64;

pub struct RetrievalPipeline {
    retrieval: RetrievalConfig,
    sharding: ShardingConfig,
    faiss: FaissConfig,
    embedder: Arc<dyn Embedder>,
    excerpts: ExcerptExtractor,
}

impl RetrievalPipeline {
    pub fn new(
        vault_root: impl Into<std::path::PathBuf>,
        retrieval: RetrievalConfig,
        sharding: ShardingConfig,
        faiss: FaissConfig,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            retrieval,
            sharding,
            faiss,
            embedder,
            excerpts: ExcerptExtractor::new(vault_root, EXCERPT_CACHE_CAPACITY),
        }
    }

    pub async fn query(&self, snapshot: &Snapshot, params: &QueryParams) -> Result<QueryResponse> {
        let started = Instant::now();
        let trimmed = params.query.trim();
        if trimmed.is_empty() {
            return Ok(empty_response(started));
        }

        let fetch_limit = params.top_k.saturating_mul(3).max(params.top_k);
        let embedded = self.embedder.embed_query(trimmed)?;
        let query_vector = embedded.vector;

        let mut candidate_shards = snapshot
            .outline
            .route(&query_vector, ROUTE_TOP_NODES, self.sharding.max_shards_per_query);
        self.narrow_by_doc_uris(params, &mut candidate_shards);

        if candidate_shards.is_empty() {
            return Ok(empty_response(started));
        }

        let (vector_hits, bm25_hits) = tokio::join!(
            self.vector_search_shards(snapshot, &query_vector, &candidate_shards, fetch_limit),
            self.bm25_search(snapshot, trimmed, &candidate_shards, fetch_limit),
        );
        let vector_candidates = vector_hits?;
        let bm25_candidates = self.attach_cached_vector_scores(snapshot, &query_vector, bm25_hits?);

        let weights = HybridWeights::new(self.retrieval.vector_weight, self.retrieval.bm25_weight)
            .map_err(|e| anyhow::anyhow!(e))?;
        let mut fused = fuse(&vector_candidates, &bm25_candidates, weights);
        fused.truncate(fetch_limit);

        let span_candidates = self.hydrate_and_filter(snapshot, params, &fused)?;
        let merged = merge_spans(span_candidates, self.retrieval.span_merge_gap_threshold);

        let fused_by_leaf: HashMap<&str, &crate::search::hybrid::FusedCandidate> =
            fused.iter().map(|c| (c.leaf_id.as_str(), c)).collect();

        let mut results = Vec::with_capacity(params.top_k);
        for span in merged.into_iter().take(params.top_k) {
            let excerpt =
                self.excerpts
                    .extract(&span.doc_uri, span.start_char, span.end_char, params.max_excerpt_chars)?;
            let representative = span.leaf_ids.first().and_then(|id| fused_by_leaf.get(id.as_str()));
            let (vector_score, bm25_score) =
                representative.map(|c| (c.vector_score, c.bm25_score)).unwrap_or((0.0, 0.0));

            results.push(SearchResult {
                doc_uri: span.doc_uri,
                heading_path: span.heading_path,
                start_char: span.start_char,
                end_char: span.end_char,
                excerpt: excerpt.text,
                excerpt_truncated: excerpt.truncated,
                score: span.score,
                vector_score,
                bm25_score,
            });
        }

        let mut shards_searched = candidate_shards;
        shards_searched.sort_unstable();
        Ok(QueryResponse {
            results,
            meta: QueryMeta {
                took_ms: started.elapsed().as_millis() as u64,
                shards_searched: params.include_shards_searched.then_some(shards_searched),
            },
        })
    }

    /// Narrows the routed shard set to those that could hold an exact-match
    /// `docUris` filter's documents, since the shard each document lives in
    /// is a pure function of its URI and needs no index lookup.
    fn narrow_by_doc_uris(&self, params: &QueryParams, candidate_shards: &mut Vec<u32>) {
        let Some(uris) = &params.filters.doc_uris else { return };
        if uris.is_empty() {
            return;
        }
        let allowed: HashSet<u32> = uris
            .iter()
            .map(|uri| shard::shard_id(uri, self.sharding.shard_count))
            .collect();
        candidate_shards.retain(|s| allowed.contains(s));
    }

    async fn vector_search_shards(
        &self,
        snapshot: &Snapshot,
        query_vector: &[f32],
        shards: &[u32],
        k: usize,
    ) -> Result<HashMap<String, f32>> {
        let searches = shards.iter().map(|&shard_id| async move {
            let Some(handle) = snapshot.shards.get(shard_id).await? else {
                return Ok(Vec::new());
            };
            handle.search(query_vector, k, self.faiss.nprobe).await
        });
        let per_shard: Vec<Vec<(String, f32)>> = futures::future::try_join_all(searches).await?;

        let mut merged: HashMap<String, f32> = HashMap::new();
        for hits in per_shard {
            for (leaf_id, score) in hits {
                merged
                    .entry(leaf_id)
                    .and_modify(|existing| {
                        if score > *existing {
                            *existing = score;
                        }
                    })
                    .or_insert(score);
            }
        }
        Ok(merged)
    }

    /// Tantivy search is synchronous CPU work; `block_in_place` lets it run
    /// to completion without starving the multi-threaded runtime, while the
    /// vector branch above keeps making progress concurrently via `tokio::join!`.
    async fn bm25_search(
        &self,
        snapshot: &Snapshot,
        query: &str,
        shards: &[u32],
        limit: usize,
    ) -> Result<Vec<(String, f32, f32)>> {
        tokio::task::block_in_place(|| snapshot.bm25.search_in_shards(query, Some(shards), limit))
    }

    /// A BM25-only candidate can still carry a vector score when its
    /// embedding happens to be cached, letting hybrid fusion weigh it
    /// fairly against vector-only candidates instead of zeroing it out.
    fn attach_cached_vector_scores(
        &self,
        snapshot: &Snapshot,
        query_vector: &[f32],
        bm25_hits: Vec<(String, f32, f32)>,
    ) -> HashMap<String, (f32, Option<f32>)> {
        let store = snapshot.store.lock();
        bm25_hits
            .into_iter()
            .map(|(leaf_id, _raw_rank, normalized)| {
                let cached_vector_score = store
                    .get_embedding(&leaf_id)
                    .ok()
                    .flatten()
                    .map(|vector| dot(query_vector, &vector));
                (leaf_id, (normalized, cached_vector_score))
            })
            .collect()
    }

    fn hydrate_and_filter(
        &self,
        snapshot: &Snapshot,
        params: &QueryParams,
        fused: &[crate::search::hybrid::FusedCandidate],
    ) -> Result<Vec<SpanCandidate>> {
        let store = snapshot.store.lock();
        let mut candidates = Vec::with_capacity(fused.len());
        for candidate in fused {
            let Some(location) = store.leaf_location(&candidate.leaf_id)? else {
                continue;
            };
            if !params.filters.matches(&location.doc_uri, &location.heading_path) {
                continue;
            }
            candidates.push(SpanCandidate {
                doc_uri: location.doc_uri,
                heading_path: location.heading_path,
                start_char: location.start_char,
                end_char: location.end_char,
                score: candidate.score,
                leaf_ids: vec![candidate.leaf_id.clone()],
            });
        }
        Ok(candidates)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn empty_response(started: Instant) -> QueryResponse {
    QueryResponse {
        results: Vec::new(),
        meta: QueryMeta {
            took_ms: started.elapsed().as_millis() as u64,
            shards_searched: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_product_of_orthonormal_axes_is_zero() {
        assert_eq!(dot(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn dot_product_of_identical_unit_vectors_is_one() {
        assert!((dot(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }
}
