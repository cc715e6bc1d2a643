//! Inverted-index lexical search over leaf text, ranked by BM25.
//!
//! Generalizes the teacher's `TextSearch` Tantivy wrapper: adds a `shard_id`
//! term field so `search_in_shards` can intersect by exact match, and drops
//! the teacher's `title` field since this crate has no document-title
//! concept.

use anyhow::{Context, Result};
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{self, IndexRecordOption, Schema, Value as TantivyValue, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

pub struct Bm25Index {
    index: Index,
    reader: IndexReader,
    writer: parking_lot::Mutex<IndexWriter>,
    leaf_id_field: schema::Field,
    text_field: schema::Field,
    shard_id_field: schema::Field,
}

impl Bm25Index {
    fn build_schema() -> (Schema, schema::Field, schema::Field, schema::Field) {
        let mut sb = Schema::builder();
        let leaf_id_field = sb.add_text_field("leaf_id", STRING | STORED);
        let text_field = sb.add_text_field("text", TEXT | STORED);
        let shard_id_field = sb.add_text_field("shard_id", STRING | STORED);
        (sb.build(), leaf_id_field, text_field, shard_id_field)
    }

    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path).ok();
        let (schema, leaf_id_field, text_field, shard_id_field) = Self::build_schema();

        let dir = tantivy::directory::MmapDirectory::open(path)?;
        let index = if Index::exists(&dir)? {
            Index::open_in_dir(path)?
        } else {
            Index::create_in_dir(path, schema)?
        };

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("failed to create tantivy reader")?;
        let writer = index.writer(50_000_000).context("failed to create tantivy writer")?;

        Ok(Self {
            index,
            reader,
            writer: parking_lot::Mutex::new(writer),
            leaf_id_field,
            text_field,
            shard_id_field,
        })
    }

    pub fn index_leaf(&self, leaf_id: &str, text: &str, shard_id: u32) -> Result<()> {
        let writer = self.writer.lock();
        writer.add_document(doc!(
            self.leaf_id_field => leaf_id,
            self.text_field => text,
            self.shard_id_field => shard_id.to_string(),
        ))?;
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.commit().context("tantivy commit failed")?;
        self.reader.reload()?;
        Ok(())
    }

    pub fn delete_leaf(&self, leaf_id: &str) -> Result<()> {
        let writer = self.writer.lock();
        writer.delete_term(Term::from_field_text(self.leaf_id_field, leaf_id));
        Ok(())
    }

    /// Splits `query` on whitespace, strips quote characters, ORs the terms,
    /// ranks by BM25, and normalizes raw ranks to `[0,1]` across the result
    /// set (`normalizedScore = |rawRank| / max(|rawRank|)`).
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<(String, f32, f32)>> {
        self.search_in_shards(query, None, limit)
    }

    pub fn search_in_shards(
        &self,
        query: &str,
        shard_ids: Option<&[u32]>,
        limit: usize,
    ) -> Result<Vec<(String, f32, f32)>> {
        let cleaned = query.replace(['"', '\''], "");
        let terms: Vec<&str> = cleaned.split_whitespace().collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let query_parser = QueryParser::for_index(&self.index, vec![self.text_field]);
        let or_query = terms
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(" OR ");
        let text_query: Box<dyn Query> = match query_parser.parse_query(&or_query) {
            Ok(q) => q,
            Err(_) => query_parser.parse_query(&cleaned)?,
        };

        let searcher = self.reader.searcher();
        let final_query: Box<dyn Query> = match shard_ids {
            None => text_query,
            Some(ids) if ids.is_empty() => text_query,
            Some(ids) => {
                let shard_clauses: Vec<(Occur, Box<dyn Query>)> = ids
                    .iter()
                    .map(|id| {
                        let term = Term::from_field_text(self.shard_id_field, &id.to_string());
                        let q: Box<dyn Query> = Box::new(TermQuery::new(term, IndexRecordOption::Basic));
                        (Occur::Should, q)
                    })
                    .collect();
                let shard_query: Box<dyn Query> = Box::new(BooleanQuery::new(shard_clauses));
                Box::new(BooleanQuery::new(vec![
                    (Occur::Must, text_query),
                    (Occur::Must, shard_query),
                ]))
            }
        };

        let top_docs = searcher.search(&final_query, &TopDocs::with_limit(limit))?;
        let mut raw: Vec<(String, f32)> = Vec::with_capacity(top_docs.len());
        for (score, addr) in top_docs {
            if let Ok(tdoc) = searcher.doc::<TantivyDocument>(addr) {
                if let Some(leaf_id) = tdoc
                    .get_first(self.leaf_id_field)
                    .and_then(|v| v.as_str())
                {
                    raw.push((leaf_id.to_string(), score));
                }
            }
        }

        let max_rank = raw.iter().map(|(_, s)| s.abs()).fold(0.0f32, f32::max);
        Ok(raw
            .into_iter()
            .map(|(id, rank)| {
                let normalized = if max_rank > 1e-9 { rank.abs() / max_rank } else { 0.0 };
                (id, rank, normalized)
            })
            .collect())
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.reader.searcher().num_docs() as usize)
    }

    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.delete_all_documents()?;
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_normalizes_scores_into_zero_one() {
        let dir = tempfile::tempdir().unwrap();
        let index = Bm25Index::open(dir.path()).unwrap();
        index.index_leaf("a", "retrieval engine for markdown vaults", 0).unwrap();
        index.index_leaf("b", "retrieval engine retrieval engine markdown markdown", 1).unwrap();
        index.commit().unwrap();

        let hits = index.search("retrieval markdown", 10).unwrap();
        assert!(!hits.is_empty());
        let max_norm = hits.iter().map(|(_, _, n)| *n).fold(0.0f32, f32::max);
        assert!((max_norm - 1.0).abs() < 1e-6);
        for (_, _, norm) in &hits {
            assert!(*norm >= 0.0 && *norm <= 1.0);
        }
    }

    #[test]
    fn search_in_shards_restricts_to_given_shards() {
        let dir = tempfile::tempdir().unwrap();
        let index = Bm25Index::open(dir.path()).unwrap();
        index.index_leaf("a", "vault search", 0).unwrap();
        index.index_leaf("b", "vault search", 1).unwrap();
        index.commit().unwrap();

        let hits = index.search_in_shards("vault", Some(&[0]), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "a");
    }

    #[test]
    fn delete_removes_leaf_from_results() {
        let dir = tempfile::tempdir().unwrap();
        let index = Bm25Index::open(dir.path()).unwrap();
        index.index_leaf("a", "ephemeral note", 0).unwrap();
        index.commit().unwrap();
        assert_eq!(index.search("ephemeral", 10).unwrap().len(), 1);

        index.delete_leaf("a").unwrap();
        index.commit().unwrap();
        assert_eq!(index.search("ephemeral", 10).unwrap().len(), 0);
    }
}
