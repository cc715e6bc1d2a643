//! Fuses vector and BM25 candidates with a fixed weighted-linear formula.
//!
//! A deliberately simpler replacement for the teacher's three fusion
//! strategies (`reciprocal_rank_fusion`, `score_aware_rrf`, `weighted_fusion`):
//! implemented in the shape of the teacher's `weighted_fusion` (normalize-then-
//! blend into a `HashMap<id, (score, ..)>`), but with a fixed deterministic
//! formula and tie-break instead of rank-based blending.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
pub struct HybridWeights {
    pub vector_weight: f32,
    pub bm25_weight: f32,
}

impl HybridWeights {
    pub fn new(vector_weight: f32, bm25_weight: f32) -> Result<Self, String> {
        if (vector_weight + bm25_weight - 1.0).abs() > 1e-6 {
            return Err(format!(
                "vector_weight + bm25_weight must sum to 1.0, got {vector_weight} + {bm25_weight}"
            ));
        }
        Ok(Self { vector_weight, bm25_weight })
    }
}

#[derive(Debug, Clone)]
pub struct FusedCandidate {
    pub leaf_id: String,
    pub score: f32,
    pub vector_score: f32,
    pub bm25_score: f32,
}

/// `score = w_v·v + w_b·b`. A BM25-only candidate uses its `cached_vector_score`
/// (from the embedding cache) if available, else 0; a vector-only candidate
/// uses `b=0`. Sorted descending by score, tie-break ascending by `leaf_id`.
pub fn fuse(
    vector_candidates: &HashMap<String, f32>,
    bm25_candidates: &HashMap<String, (f32, Option<f32>)>,
    weights: HybridWeights,
) -> Vec<FusedCandidate> {
    let mut merged: HashMap<String, (f32, f32)> = HashMap::new();

    for (leaf_id, &v) in vector_candidates {
        merged.insert(leaf_id.clone(), (v, 0.0));
    }
    for (leaf_id, &(b, cached_v)) in bm25_candidates {
        merged
            .entry(leaf_id.clone())
            .and_modify(|(_, existing_b)| *existing_b = b)
            .or_insert((cached_v.unwrap_or(0.0), b));
    }

    let mut results: Vec<FusedCandidate> = merged
        .into_iter()
        .map(|(leaf_id, (v, b))| FusedCandidate {
            score: weights.vector_weight * v + weights.bm25_weight * b,
            leaf_id,
            vector_score: v,
            bm25_score: b,
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.leaf_id.cmp(&b.leaf_id))
    });
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_must_sum_to_one() {
        assert!(HybridWeights::new(0.75, 0.25).is_ok());
        assert!(HybridWeights::new(0.9, 0.3).is_err());
    }

    #[test]
    fn vector_only_candidate_gets_zero_bm25() {
        let mut vectors = HashMap::new();
        vectors.insert("a".to_string(), 0.8f32);
        let bm25 = HashMap::new();
        let weights = HybridWeights::new(0.75, 0.25).unwrap();
        let fused = fuse(&vectors, &bm25, weights);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].score - 0.6).abs() < 1e-6);
    }

    #[test]
    fn bm25_only_candidate_uses_cached_vector_score_when_present() {
        let vectors = HashMap::new();
        let mut bm25 = HashMap::new();
        bm25.insert("a".to_string(), (0.5f32, Some(0.2f32)));
        let weights = HybridWeights::new(0.75, 0.25).unwrap();
        let fused = fuse(&vectors, &bm25, weights);
        assert!((fused[0].score - (0.75 * 0.2 + 0.25 * 0.5)).abs() < 1e-6);
    }

    #[test]
    fn ties_break_ascending_by_leaf_id() {
        let mut vectors = HashMap::new();
        vectors.insert("zzz".to_string(), 0.4f32);
        vectors.insert("aaa".to_string(), 0.4f32);
        let bm25 = HashMap::new();
        let weights = HybridWeights::new(1.0, 0.0).unwrap();
        let fused = fuse(&vectors, &bm25, weights);
        assert_eq!(fused[0].leaf_id, "aaa");
        assert_eq!(fused[1].leaf_id, "zzz");
    }
}
