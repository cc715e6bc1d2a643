//! Derives a heading node's own vector from its descendant leaves via
//! Maximal Marginal Relevance selection, so large sections keep their
//! distinct sub-topics instead of collapsing into a diluted centroid.

const LAMBDA: f32 = 0.7;

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

fn centroid(vectors: &[Vec<f32>]) -> Vec<f32> {
    let dim = vectors[0].len();
    let mut sum = vec![0.0f32; dim];
    for v in vectors {
        for (s, x) in sum.iter_mut().zip(v) {
            *s += x;
        }
    }
    for s in &mut sum {
        *s /= vectors.len() as f32;
    }
    normalize(sum)
}

/// `k = clamp(⌈n/5⌉, 2, 5)`; `k = 1` if `n = 1`.
fn selection_count(n: usize) -> usize {
    if n == 1 {
        return 1;
    }
    let raw = (n + 4) / 5;
    raw.clamp(2, 5)
}

/// Computes the node vector: normalized mean of an MMR-selected subset of
/// `leaf_vectors` (each assumed already L2-normalized).
pub fn node_vector(leaf_vectors: &[Vec<f32>]) -> Vec<f32> {
    assert!(!leaf_vectors.is_empty(), "node_vector requires at least one leaf vector");
    if leaf_vectors.len() == 1 {
        return leaf_vectors[0].clone();
    }

    let k = selection_count(leaf_vectors.len()).min(leaf_vectors.len());
    if k >= leaf_vectors.len() {
        return centroid(leaf_vectors);
    }

    let center = centroid(leaf_vectors);

    let seed = (0..leaf_vectors.len())
        .max_by(|&a, &b| {
            dot(&leaf_vectors[a], &center)
                .partial_cmp(&dot(&leaf_vectors[b], &center))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap();

    let mut selected = vec![seed];
    let mut remaining: Vec<usize> = (0..leaf_vectors.len()).filter(|&i| i != seed).collect();

    while selected.len() < k && !remaining.is_empty() {
        let next = remaining
            .iter()
            .copied()
            .max_by(|&a, &b| mmr_score(a, &center, leaf_vectors, &selected)
                .partial_cmp(&mmr_score(b, &center, leaf_vectors, &selected))
                .unwrap_or(std::cmp::Ordering::Equal))
            .unwrap();
        selected.push(next);
        remaining.retain(|&i| i != next);
    }

    let chosen: Vec<Vec<f32>> = selected.iter().map(|&i| leaf_vectors[i].clone()).collect();
    centroid(&chosen)
}

fn mmr_score(i: usize, center: &[f32], vectors: &[Vec<f32>], selected: &[usize]) -> f32 {
    let relevance = dot(&vectors[i], center);
    let redundancy = selected
        .iter()
        .map(|&j| dot(&vectors[i], &vectors[j]))
        .fold(f32::MIN, f32::max);
    LAMBDA * relevance - (1.0 - LAMBDA) * redundancy
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(v: Vec<f32>) -> Vec<f32> {
        normalize(v)
    }

    #[test]
    fn single_leaf_is_returned_unchanged() {
        let v = unit(vec![1.0, 2.0, 3.0]);
        assert_eq!(node_vector(&[v.clone()]), v);
    }

    #[test]
    fn small_set_uses_full_centroid() {
        let vectors = vec![unit(vec![1.0, 0.0]), unit(vec![0.0, 1.0])];
        let result = node_vector(&vectors);
        // result should equal the normalized mean since n <= k(=2)
        let expected = centroid(&vectors);
        for (a, b) in result.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn selection_count_matches_formula() {
        assert_eq!(selection_count(1), 1);
        assert_eq!(selection_count(2), 2);
        assert_eq!(selection_count(5), 2);
        assert_eq!(selection_count(6), 2);
        assert_eq!(selection_count(10), 2);
        assert_eq!(selection_count(11), 3);
        assert_eq!(selection_count(100), 5);
    }

    #[test]
    fn mmr_prefers_diverse_vectors_over_pure_centroid_dilution() {
        // Two tight clusters far apart; MMR should pick one from each rather
        // than many near-duplicates from a single cluster.
        let cluster_a = vec![unit(vec![1.0, 0.0]), unit(vec![0.99, 0.01])];
        let cluster_b = vec![unit(vec![0.0, 1.0]), unit(vec![0.01, 0.99])];
        let mut vectors = cluster_a.clone();
        vectors.extend(cluster_b.clone());
        vectors.push(unit(vec![0.7, 0.7]));

        let result = node_vector(&vectors);
        assert_eq!(result.len(), 2);
        // result should not be dominated entirely by one cluster
        assert!(result[0] > 0.05 && result[1] > 0.05);
    }
}
