//! Per-shard ANN index over leaf (chunk) vectors: brute-force below the
//! IVFPQ threshold, trained IVFPQ above it.

use anyhow::{Context, Result};
use arrow_array::{Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use lancedb::index::vector::IvfPqIndexBuilder;
use lancedb::index::Index;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::path::Path;
use std::sync::Arc;

use crate::config::FaissConfig;

const TABLE_NAME: &str = "leaves";

pub struct LeafShardIndex {
    db: lancedb::Connection,
    dimension: usize,
}

impl LeafShardIndex {
    /// Opens (creating if absent) the ANN table for one shard directory.
    pub async fn open(shard_dir: &Path, dimension: usize) -> Result<Self> {
        std::fs::create_dir_all(shard_dir).ok();
        let db = lancedb::connect(&shard_dir.to_string_lossy())
            .execute()
            .await
            .context("failed to open shard database")?;
        let store = Self { db, dimension };
        store.ensure_table().await?;
        Ok(store)
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("leaf_id", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                true,
            ),
        ]))
    }

    async fn ensure_table(&self) -> Result<()> {
        let names = self.db.table_names().execute().await?;
        if names.contains(&TABLE_NAME.to_string()) {
            return Ok(());
        }
        let schema = self.schema();
        let seed_vector = FixedSizeListArray::new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            self.dimension as i32,
            Arc::new(Float32Array::from(vec![0.0f32; self.dimension])) as Arc<dyn Array>,
            None,
        );
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec!["__seed__"])) as Arc<dyn Array>,
                Arc::new(seed_vector) as Arc<dyn Array>,
            ],
        )?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        self.db
            .create_table(TABLE_NAME, Box::new(batches))
            .execute()
            .await
            .context("failed to create leaf shard table")?;
        let table = self.db.open_table(TABLE_NAME).execute().await?;
        table.delete("leaf_id = '__seed__'").await.ok();
        Ok(())
    }

    /// Inserts or appends leaf vectors (`add` in the component contract).
    pub async fn add(&self, leaves: &[(String, Vec<f32>)]) -> Result<()> {
        if leaves.is_empty() {
            return Ok(());
        }
        let table = self.db.open_table(TABLE_NAME).execute().await?;
        let schema = self.schema();

        let ids: Vec<&str> = leaves.iter().map(|(id, _)| id.as_str()).collect();
        let flat: Vec<f32> = leaves.iter().flat_map(|(_, v)| v.iter().copied()).collect();
        let vector_array = FixedSizeListArray::new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            self.dimension as i32,
            Arc::new(Float32Array::from(flat)) as Arc<dyn Array>,
            None,
        );

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(ids)) as Arc<dyn Array>,
                Arc::new(vector_array) as Arc<dyn Array>,
            ],
        )?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table.add(Box::new(reader)).execute().await.context("failed to add leaf vectors")?;
        Ok(())
    }

    pub async fn remove(&self, leaf_ids: &[String]) -> Result<()> {
        if leaf_ids.is_empty() {
            return Ok(());
        }
        let table = self.db.open_table(TABLE_NAME).execute().await?;
        for chunk in leaf_ids.chunks(100) {
            let list = chunk
                .iter()
                .map(|id| format!("'{}'", id.replace('\'', "''")))
                .collect::<Vec<_>>()
                .join(", ");
            table.delete(&format!("leaf_id IN ({list})")).await.ok();
        }
        Ok(())
    }

    /// Trains an IVFPQ index once the shard has crossed `ivfpq_threshold`
    /// rows; below that, queries run brute-force exact search with no
    /// index required (`train` is a no-op in the flat regime).
    pub async fn train(&self, faiss: &FaissConfig) -> Result<()> {
        let count = self.count().await?;
        if count < faiss.ivfpq_threshold {
            return Ok(());
        }
        let table = self.db.open_table(TABLE_NAME).execute().await?;
        let nlist = (count as f64).sqrt().floor().min(256.0).max(1.0) as u32;
        let builder = IvfPqIndexBuilder::default()
            .num_partitions(nlist)
            .num_sub_vectors(64)
            .num_bits(8);
        table
            .create_index(&["vector"], Index::IvfPq(builder))
            .execute()
            .await
            .context("failed to train IVFPQ index")?;
        Ok(())
    }

    /// Inner-product search, descending (cosine for L2-normalized inputs).
    pub async fn search(&self, query: &[f32], k: usize, nprobe: usize) -> Result<Vec<(String, f32)>> {
        let table = self.db.open_table(TABLE_NAME).execute().await?;
        let mut builder = table
            .query()
            .nearest_to(query)?
            .distance_type(lancedb::DistanceType::Cosine)
            .limit(k);
        if table.list_indices().await.map(|idxs| !idxs.is_empty()).unwrap_or(false) {
            builder = builder.nprobes(nprobe);
        }
        let results = builder.execute().await.context("leaf shard vector search failed")?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        Ok(extract_hits(&batches))
    }

    pub async fn count(&self) -> Result<usize> {
        let table = self.db.open_table(TABLE_NAME).execute().await?;
        Ok(table.count_rows(None).await?)
    }
}

fn extract_hits(batches: &[RecordBatch]) -> Vec<(String, f32)> {
    let mut hits = Vec::new();
    for batch in batches {
        let ids = batch
            .column_by_name("leaf_id")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());
        let Some(ids) = ids else { continue };
        for i in 0..batch.num_rows() {
            let score = distances.map(|d| 1.0 - d.value(i)).unwrap_or(0.0);
            hits.push((ids.value(i).to_string(), score));
        }
    }
    hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    hits
}
