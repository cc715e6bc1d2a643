use anyhow::{anyhow, Result};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use super::tokenizer::SentencePieceTokenizer;
use super::{Embedder, EMBED_DIMENSION};
use crate::config::EmbeddingConfig;
use crate::types::EmbedResult;

#[derive(Clone, Copy, Debug)]
pub enum EmbedderMode {
    Query,
    Passage,
}

/// ONNX Runtime-backed embedder for a multilingual-e5-large-class model.
pub struct OnnxEmbedder {
    session: Arc<Mutex<Session>>,
    tokenizer: Arc<SentencePieceTokenizer>,
    config: EmbeddingConfig,
    cache: Arc<RwLock<lru::LruCache<String, Vec<f32>>>>,
}

impl OnnxEmbedder {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        ort::init().with_name("mdvault_embedder").commit();

        if !config.model_path.exists() {
            return Err(anyhow!(
                "embedding model not found at: {}",
                config.model_path.display()
            ));
        }

        let model_bytes = std::fs::read(&config.model_path)
            .map_err(|e| anyhow!("failed to read model: {e:?}"))?;

        let session = Session::builder()
            .map_err(|e| anyhow!("session builder: {e:?}"))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!("optimization level: {e:?}"))?
            .with_intra_threads(config.num_threads)
            .map_err(|e| anyhow!("intra threads: {e:?}"))?
            .with_inter_threads(1)
            .map_err(|e| anyhow!("inter threads: {e:?}"))?
            .with_memory_pattern(true)
            .map_err(|e| anyhow!("memory pattern: {e:?}"))?
            .commit_from_memory(&model_bytes)
            .map_err(|e| anyhow!("failed to load model: {e:?}"))?;

        let tokenizer = SentencePieceTokenizer::from_model_dir(&config.tokenizer_path)?;

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            tokenizer: Arc::new(tokenizer),
            config,
            cache: Arc::new(RwLock::new(lru::LruCache::new(
                std::num::NonZeroUsize::new(1000).unwrap(),
            ))),
        })
    }

    fn embed_with_mode(&self, text: &str, mode: EmbedderMode) -> Result<EmbedResult> {
        let prefixed = match mode {
            EmbedderMode::Query => format!("query: {text}"),
            EmbedderMode::Passage => format!("passage: {text}"),
        };

        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut hasher);
        let cache_key = format!("{mode:?}:{:x}", hasher.finish());
        if let Some(cached) = self.cache.write().get(&cache_key) {
            return Ok(EmbedResult {
                vector: cached.clone(),
                token_count: self.tokenizer.count_tokens(&prefixed)?,
            });
        }

        let max_len = self.config.max_sequence_length;
        let mut token_ids = self.tokenizer.encode(&prefixed, true)?;
        let token_count = token_ids.len();
        if token_ids.len() > max_len {
            token_ids.truncate(max_len);
        }

        let (ids_vec, mask_vec) = self.tokenizer.prepare_for_model(&token_ids, max_len);

        let shape = vec![1, max_len];
        let input_ids = Value::from_array((shape.clone(), ids_vec))
            .map_err(|e| anyhow!("input_ids tensor: {e:?}"))?;
        let attention_mask = Value::from_array((shape, mask_vec.clone()))
            .map_err(|e| anyhow!("attention_mask tensor: {e:?}"))?;

        let inputs = ort::inputs![
            "input_ids" => input_ids,
            "attention_mask" => attention_mask,
        ];

        let mut session = self.session.lock();
        let outputs = session
            .run(inputs)
            .map_err(|e| anyhow!("inference failed: {e:?}"))?;

        let vector = extract_embedding(&outputs, &mask_vec)?;
        self.cache.write().put(cache_key, vector.clone());

        Ok(EmbedResult { vector, token_count })
    }

    fn embed_batch_with_mode(&self, texts: &[&str], mode: EmbedderMode) -> Result<Vec<EmbedResult>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batch_size = self.config.batch_size.max(1);
        let max_len = self.config.max_sequence_length;
        let mut results = Vec::with_capacity(texts.len());

        for batch in texts.chunks(batch_size) {
            let prefixed: Vec<String> = batch
                .iter()
                .map(|text| match mode {
                    EmbedderMode::Query => format!("query: {text}"),
                    EmbedderMode::Passage => format!("passage: {text}"),
                })
                .collect();

            let mut all_token_ids = Vec::new();
            let mut token_counts = Vec::new();
            let mut padded_len = 0;

            for text in &prefixed {
                let mut token_ids = self.tokenizer.encode(text, true)?;
                token_counts.push(token_ids.len());
                if token_ids.len() > max_len {
                    token_ids.truncate(max_len);
                }
                padded_len = padded_len.max(token_ids.len());
                all_token_ids.push(token_ids);
            }

            let rows = all_token_ids.len();
            let mut input_ids_flat = Vec::with_capacity(rows * padded_len);
            let mut attention_mask_flat = Vec::with_capacity(rows * padded_len);

            for token_ids in &all_token_ids {
                for &id in token_ids {
                    input_ids_flat.push(id as i64);
                    attention_mask_flat.push(1i64);
                }
                for _ in token_ids.len()..padded_len {
                    input_ids_flat.push(0i64);
                    attention_mask_flat.push(0i64);
                }
            }

            let shape = vec![rows, padded_len];
            let input_ids = Value::from_array((shape.clone(), input_ids_flat))
                .map_err(|e| anyhow!("input_ids tensor: {e:?}"))?;
            let attention_mask = Value::from_array((shape, attention_mask_flat.clone()))
                .map_err(|e| anyhow!("attention_mask tensor: {e:?}"))?;

            let inputs = ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
            ];

            let mut session = self.session.lock();
            let outputs = session
                .run(inputs)
                .map_err(|e| anyhow!("batch inference failed: {e:?}"))?;

            let vectors = extract_batch_embeddings(&outputs, &attention_mask_flat, rows, padded_len)?;
            drop(session);

            for (vector, token_count) in vectors.into_iter().zip(token_counts) {
                results.push(EmbedResult { vector, token_count });
            }
        }

        Ok(results)
    }
}

fn normalize_vec(mut vec: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for v in &mut vec {
            *v /= norm;
        }
    }
    vec
}

fn extract_embedding(outputs: &ort::session::SessionOutputs, attention_mask: &[i64]) -> Result<Vec<f32>> {
    if outputs.iter().any(|(name, _)| name == "sentence_embedding") {
        if let Ok((shape, data)) = outputs["sentence_embedding"].try_extract_tensor::<f32>() {
            if shape.len() == 2 {
                return Ok(normalize_vec(data.to_vec()));
            }
        }
    }

    let output_name = outputs
        .iter()
        .find(|(name, _)| *name == "last_hidden_state" || *name == "token_embeddings")
        .map(|(name, _)| name.to_string())
        .unwrap_or_else(|| {
            outputs
                .iter()
                .next()
                .map(|(name, _)| name.to_string())
                .unwrap_or_else(|| "last_hidden_state".to_string())
        });

    let (shape, data) = outputs[output_name.as_str()]
        .try_extract_tensor::<f32>()
        .map_err(|e| anyhow!("failed to extract output '{output_name}': {e:?}"))?;

    let seq_len = shape[1] as usize;
    let hidden_dim = shape[2] as usize;

    let mut pooled = vec![0.0f32; hidden_dim];
    let mut mask_sum = 0.0f32;
    for pos in 0..seq_len {
        let mask_val = attention_mask.get(pos).copied().unwrap_or(0) as f32;
        if mask_val > 0.0 {
            mask_sum += mask_val;
            let offset = pos * hidden_dim;
            for dim in 0..hidden_dim {
                pooled[dim] += data[offset + dim] * mask_val;
            }
        }
    }
    if mask_sum > 0.0 {
        for v in &mut pooled {
            *v /= mask_sum;
        }
    }

    Ok(normalize_vec(pooled))
}

fn extract_batch_embeddings(
    outputs: &ort::session::SessionOutputs,
    attention_mask_flat: &[i64],
    rows: usize,
    padded_len: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(rows);

    if outputs.iter().any(|(name, _)| name == "sentence_embedding") {
        if let Ok((shape, data)) = outputs["sentence_embedding"].try_extract_tensor::<f32>() {
            let hidden_dim = shape[1] as usize;
            for row in 0..rows {
                let offset = row * hidden_dim;
                out.push(normalize_vec(data[offset..offset + hidden_dim].to_vec()));
            }
            return Ok(out);
        }
    }

    let (shape, data) = outputs["last_hidden_state"]
        .try_extract_tensor::<f32>()
        .map_err(|e| anyhow!("failed to extract last_hidden_state: {e:?}"))?;
    let seq_len = shape[1] as usize;
    let hidden_dim = shape[2] as usize;

    for row in 0..rows {
        let mask_offset = row * padded_len;
        let row_offset = row * seq_len * hidden_dim;
        let mut pooled = vec![0.0f32; hidden_dim];
        let mut mask_sum = 0.0f32;
        for pos in 0..seq_len {
            let mask_val = attention_mask_flat
                .get(mask_offset + pos)
                .copied()
                .unwrap_or(0) as f32;
            if mask_val > 0.0 {
                mask_sum += mask_val;
                let offset = row_offset + pos * hidden_dim;
                for dim in 0..hidden_dim {
                    pooled[dim] += data[offset + dim] * mask_val;
                }
            }
        }
        if mask_sum > 0.0 {
            for v in &mut pooled {
                *v /= mask_sum;
            }
        }
        out.push(normalize_vec(pooled));
    }

    Ok(out)
}

impl Embedder for OnnxEmbedder {
    fn embed_query(&self, text: &str) -> Result<EmbedResult> {
        self.embed_with_mode(text, EmbedderMode::Query)
    }

    fn embed_passage(&self, text: &str) -> Result<EmbedResult> {
        self.embed_with_mode(text, EmbedderMode::Passage)
    }

    fn embed_passages(&self, texts: &[&str]) -> Result<Vec<EmbedResult>> {
        self.embed_batch_with_mode(texts, EmbedderMode::Passage)
    }

    fn dimension(&self) -> usize {
        EMBED_DIMENSION
    }

    fn count_tokens(&self, text: &str) -> usize {
        self.tokenizer
            .count_tokens(text)
            .unwrap_or_else(|_| super::approx_token_count(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_is_fixed_at_1024() {
        assert_eq!(EMBED_DIMENSION, 1024);
    }
}
