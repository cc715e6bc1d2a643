//! HNSW index over heading-node vectors, used to route a query to a bounded
//! set of candidate shards instead of fanning out to all 128.

use anyhow::{Context, Result};
use hnsw_rs::prelude::*;
use std::collections::{HashMap, HashSet};

const M: usize = 32;
const EF_CONSTRUCTION: usize = 200;
const EF_SEARCH: usize = 64;
const MAX_LAYER: usize = 16;

pub struct OutlineIndex {
    hnsw: Hnsw<'static, f32, DistCosine>,
    id_to_node: Vec<String>,
    node_to_shards: HashMap<String, HashSet<u32>>,
}

impl OutlineIndex {
    pub fn new(expected_nodes: usize) -> Self {
        Self {
            hnsw: Hnsw::new(M, expected_nodes.max(16), MAX_LAYER, EF_CONSTRUCTION, DistCosine {}),
            id_to_node: Vec::new(),
            node_to_shards: HashMap::new(),
        }
    }

    /// Inserts a node's vector along with the set of shards holding any of
    /// its descendant leaves.
    pub fn insert(&mut self, node_id: &str, vector: &[f32], shards: HashSet<u32>) {
        let internal_id = self.id_to_node.len();
        self.hnsw.insert((vector, internal_id));
        self.id_to_node.push(node_id.to_string());
        self.node_to_shards.insert(node_id.to_string(), shards);
    }

    /// Searches the top `top_nodes` nearest heading nodes and returns the
    /// union of their shard sets, truncated to `max_shards`.
    pub fn route(&self, query: &[f32], top_nodes: usize, max_shards: usize) -> Vec<u32> {
        if self.id_to_node.is_empty() {
            return Vec::new();
        }
        let neighbors = self.hnsw.search(query, top_nodes, EF_SEARCH);

        let mut seen = HashSet::new();
        let mut shards = Vec::new();
        for neighbor in neighbors {
            let Some(node_id) = self.id_to_node.get(neighbor.d_id) else {
                continue;
            };
            if let Some(node_shards) = self.node_to_shards.get(node_id) {
                let mut sorted: Vec<u32> = node_shards.iter().copied().collect();
                sorted.sort_unstable();
                for shard_id in sorted {
                    if seen.insert(shard_id) {
                        shards.push(shard_id);
                        if shards.len() >= max_shards {
                            return shards;
                        }
                    }
                }
            }
        }
        shards
    }

    pub fn len(&self) -> usize {
        self.id_to_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_node.is_empty()
    }

    pub fn save(&self, base_path: &std::path::Path, basename: &str) -> Result<()> {
        std::fs::create_dir_all(base_path).context("failed to create outline index directory")?;
        self.hnsw
            .file_dump(base_path, basename)
            .map_err(|e| anyhow::anyhow!("failed to dump outline HNSW graph: {e}"))?;

        let sidecar = base_path.join(format!("{basename}.sidecar.json"));
        let sidecar_data = OutlineSidecar {
            id_to_node: self.id_to_node.clone(),
            node_to_shards: self
                .node_to_shards
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().copied().collect()))
                .collect(),
        };
        std::fs::write(sidecar, serde_json::to_vec(&sidecar_data)?)?;
        Ok(())
    }

    /// Reloads a graph previously written by `save`. The sidecar carries the
    /// `id_to_node`/`node_to_shards` maps the raw HNSW dump does not.
    pub fn load(base_path: &std::path::Path, basename: &str) -> Result<Self> {
        let sidecar_path = base_path.join(format!("{basename}.sidecar.json"));
        let sidecar_bytes = std::fs::read(&sidecar_path)
            .with_context(|| format!("failed to read outline sidecar at {}", sidecar_path.display()))?;
        let sidecar: OutlineSidecar =
            serde_json::from_slice(&sidecar_bytes).context("failed to parse outline sidecar")?;

        let mut reloader = HnswIo::new(base_path, basename);
        let hnsw = reloader
            .load_hnsw::<f32, DistCosine>()
            .map_err(|e| anyhow::anyhow!("failed to reload outline HNSW graph: {e}"))?;

        Ok(Self {
            hnsw,
            id_to_node: sidecar.id_to_node,
            node_to_shards: sidecar
                .node_to_shards
                .into_iter()
                .map(|(k, v)| (k, v.into_iter().collect()))
                .collect(),
        })
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct OutlineSidecar {
    id_to_node: Vec<String>,
    node_to_shards: HashMap<String, Vec<u32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(v: Vec<f32>) -> Vec<f32> {
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter().map(|x| x / norm).collect()
    }

    #[test]
    fn route_returns_shards_of_nearest_node() {
        let mut index = OutlineIndex::new(16);
        let mut shards_a = HashSet::new();
        shards_a.insert(3u32);
        shards_a.insert(5u32);
        index.insert("node-a", &unit(vec![1.0, 0.0, 0.0]), shards_a);

        let mut shards_b = HashSet::new();
        shards_b.insert(9u32);
        index.insert("node-b", &unit(vec![0.0, 1.0, 0.0]), shards_b);

        let routed = index.route(&unit(vec![0.9, 0.1, 0.0]), 1, 16);
        assert_eq!(routed, vec![3, 5]);
    }

    #[test]
    fn route_truncates_to_max_shards() {
        let mut index = OutlineIndex::new(16);
        let shards: HashSet<u32> = (0..20).collect();
        index.insert("node-a", &unit(vec![1.0, 0.0]), shards);
        let routed = index.route(&unit(vec![1.0, 0.0]), 1, 5);
        assert_eq!(routed.len(), 5);
    }

    #[test]
    fn empty_index_routes_to_no_shards() {
        let index = OutlineIndex::new(16);
        assert!(index.route(&unit(vec![1.0, 0.0]), 4, 16).is_empty());
    }
}
