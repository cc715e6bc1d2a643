//! Relational persistence for docs/nodes/leaves, the embedding cache, and
//! manifest key-value pairs. SQLite in WAL mode: the teacher's LanceDB and
//! Tantivy pair covers vectors and full text but has no general relational
//! table, which this contract needs for doc/node/leaf bookkeeping and
//! `getChangedDocs` diffing.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

use crate::types::{Chunk, DocUri, HeadingNode};

pub struct MetadataStore {
    conn: Connection,
}

pub struct DocRecord {
    pub doc_uri: DocUri,
    pub mtime_ms: i64,
    pub size: u64,
    pub hash: String,
}

#[derive(Debug, Default)]
pub struct ChangedDocs {
    pub added: Vec<DocUri>,
    pub modified: Vec<DocUri>,
    pub deleted: Vec<DocUri>,
}

/// A node row read back for outline-rebuild purposes (no children, no title).
pub struct NodeRow {
    pub node_id: String,
    pub doc_id: i64,
    pub start_char: i64,
    pub end_char: i64,
}

/// A leaf row's shard assignment and cached embedding, read for a range query.
pub struct LeafInRange {
    pub leaf_id: String,
    pub shard_id: u32,
    pub embedding: Option<Vec<f32>>,
}

/// A leaf's full identity, used to re-seed a contentless full-text index's
/// side table of original text on copy, or to delete stale BM25 rows.
pub struct LeafRow {
    pub leaf_id: String,
    pub shard_id: u32,
}

/// Provenance hydrated for one leaf at query time.
#[derive(Debug, Clone)]
pub struct LeafLocation {
    pub doc_uri: DocUri,
    pub heading_path: String,
    pub start_char: usize,
    pub end_char: usize,
}

impl MetadataStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open metadata database")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS docs (
                doc_id    INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_uri   TEXT NOT NULL UNIQUE,
                mtime_ms  INTEGER NOT NULL,
                size      INTEGER NOT NULL,
                hash      TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS nodes (
                node_id      TEXT PRIMARY KEY,
                doc_id       INTEGER NOT NULL REFERENCES docs(doc_id) ON DELETE CASCADE,
                level        INTEGER NOT NULL,
                heading_path TEXT NOT NULL,
                start_char   INTEGER NOT NULL,
                end_char     INTEGER NOT NULL,
                shard_id     INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS leaves (
                leaf_id    TEXT PRIMARY KEY,
                doc_id     INTEGER NOT NULL REFERENCES docs(doc_id) ON DELETE CASCADE,
                node_id    TEXT NOT NULL REFERENCES nodes(node_id) ON DELETE CASCADE,
                start_char INTEGER NOT NULL,
                end_char   INTEGER NOT NULL,
                text_hash  TEXT NOT NULL,
                shard_id   INTEGER NOT NULL,
                embedding  BLOB
            );
            CREATE TABLE IF NOT EXISTS meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_nodes_doc_id ON nodes(doc_id);
            CREATE INDEX IF NOT EXISTS idx_leaves_doc_id ON leaves(doc_id);
            CREATE INDEX IF NOT EXISTS idx_leaves_node_id ON leaves(node_id);
            CREATE INDEX IF NOT EXISTS idx_leaves_shard_id ON leaves(shard_id);
            ",
        )?;
        Ok(())
    }

    /// Idempotent: re-running with the same `doc_uri` updates the row in place.
    pub fn upsert_doc(&self, rec: &DocRecord) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO docs (doc_uri, mtime_ms, size, hash) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(doc_uri) DO UPDATE SET mtime_ms = excluded.mtime_ms, size = excluded.size, hash = excluded.hash",
            params![rec.doc_uri, rec.mtime_ms, rec.size as i64, rec.hash],
        )?;
        let doc_id: i64 = self.conn.query_row(
            "SELECT doc_id FROM docs WHERE doc_uri = ?1",
            params![rec.doc_uri],
            |row| row.get(0),
        )?;
        Ok(doc_id)
    }

    pub fn doc_id(&self, doc_uri: &str) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row("SELECT doc_id FROM docs WHERE doc_uri = ?1", params![doc_uri], |row| row.get(0))
            .optional()?)
    }

    /// Deletes a doc and cascades to its nodes and leaves via foreign keys.
    pub fn delete_doc(&self, doc_uri: &str) -> Result<()> {
        self.conn.execute("DELETE FROM docs WHERE doc_uri = ?1", params![doc_uri])?;
        Ok(())
    }

    /// Diffs `known` (caller's `{docUri → (mtime, hash)}`) against the store.
    pub fn get_changed_docs(&self, known: &HashMap<DocUri, (i64, String)>) -> Result<ChangedDocs> {
        let mut stmt = self.conn.prepare("SELECT doc_uri, mtime_ms, hash FROM docs")?;
        let mut stored: HashMap<DocUri, (i64, String)> = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
        })?;
        for row in rows {
            let (doc_uri, mtime, hash) = row?;
            stored.insert(doc_uri, (mtime, hash));
        }

        let mut changed = ChangedDocs::default();
        for (doc_uri, (mtime, hash)) in known {
            match stored.get(doc_uri) {
                None => changed.added.push(doc_uri.clone()),
                Some((stored_mtime, stored_hash)) => {
                    if stored_mtime != mtime || stored_hash != hash {
                        changed.modified.push(doc_uri.clone());
                    }
                }
            }
        }
        for doc_uri in stored.keys() {
            if !known.contains_key(doc_uri) {
                changed.deleted.push(doc_uri.clone());
            }
        }
        Ok(changed)
    }

    /// Bulk-inserts a document's heading tree and chunks inside one
    /// transaction, replacing any prior rows for `doc_id`.
    pub fn replace_doc_contents(&mut self, doc_id: i64, tree: &HeadingNode, chunks: &[Chunk]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM nodes WHERE doc_id = ?1", params![doc_id])?;

        {
            let mut insert_node = tx.prepare(
                "INSERT INTO nodes (node_id, doc_id, level, heading_path, start_char, end_char, shard_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for node in tree.iter() {
                let shard_id = crate::shard::shard_id(&node.doc_uri, 128);
                insert_node.execute(params![
                    node.node_id,
                    doc_id,
                    node.level,
                    node.heading_path,
                    node.start_char as i64,
                    node.end_char as i64,
                    shard_id,
                ])?;
            }
        }
        {
            let mut insert_leaf = tx.prepare(
                "INSERT INTO leaves (leaf_id, doc_id, node_id, start_char, end_char, text_hash, shard_id, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for chunk in chunks {
                insert_leaf.execute(params![
                    chunk.leaf_id,
                    doc_id,
                    chunk.node_id,
                    chunk.start_char as i64,
                    chunk.end_char as i64,
                    chunk.text_hash,
                    chunk.shard_id,
                    Option::<Vec<u8>>::None,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Stores a little-endian `f32[1024]` embedding BLOB for a leaf.
    pub fn set_embedding(&self, leaf_id: &str, vector: &[f32]) -> Result<()> {
        let bytes = f32_slice_to_le_bytes(vector);
        self.conn.execute(
            "UPDATE leaves SET embedding = ?1 WHERE leaf_id = ?2",
            params![bytes, leaf_id],
        )?;
        Ok(())
    }

    /// Looks up a cached embedding by `(docUri, startChar, endChar)` identity
    /// — i.e. by the `leafId` it hashes to — reusable across chunker runs
    /// that reproduce the same offsets.
    pub fn get_embedding(&self, leaf_id: &str) -> Result<Option<Vec<f32>>> {
        let bytes: Option<Vec<u8>> = self
            .conn
            .query_row("SELECT embedding FROM leaves WHERE leaf_id = ?1", params![leaf_id], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(bytes.map(|b| le_bytes_to_f32_vec(&b)))
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?)
    }

    /// All non-virtual heading nodes (`level > 0`) across the whole vault,
    /// used to recompute every node vector when the outline index is
    /// rebuilt after an incremental build.
    pub fn all_nodes(&self) -> Result<Vec<NodeRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT node_id, doc_id, start_char, end_char FROM nodes WHERE level > 0")?;
        let rows = stmt.query_map([], |row| {
            Ok(NodeRow {
                node_id: row.get(0)?,
                doc_id: row.get(1)?,
                start_char: row.get(2)?,
                end_char: row.get(3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Leaves whose span falls within `[start_char, end_char]` of `doc_id` —
    /// i.e. the descendant leaves of a node with that range, since node
    /// ranges nest and a leaf never straddles a child heading.
    pub fn leaves_in_range(&self, doc_id: i64, start_char: i64, end_char: i64) -> Result<Vec<LeafInRange>> {
        let mut stmt = self.conn.prepare(
            "SELECT leaf_id, shard_id, embedding FROM leaves
             WHERE doc_id = ?1 AND start_char >= ?2 AND end_char <= ?3",
        )?;
        let rows = stmt.query_map(params![doc_id, start_char, end_char], |row| {
            let leaf_id: String = row.get(0)?;
            let shard_id: i64 = row.get(1)?;
            let bytes: Option<Vec<u8>> = row.get(2)?;
            Ok(LeafInRange {
                leaf_id,
                shard_id: shard_id as u32,
                embedding: bytes.map(|b| le_bytes_to_f32_vec(&b)),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// All leaf ids + shard ids belonging to a document, used to clean up
    /// BM25 rows and shard membership before a document's rows are deleted.
    pub fn leaves_for_doc(&self, doc_uri: &DocUri) -> Result<Vec<LeafRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT l.leaf_id, l.shard_id FROM leaves l
             JOIN docs d ON d.doc_id = l.doc_id
             WHERE d.doc_uri = ?1",
        )?;
        let rows = stmt.query_map(params![doc_uri], |row| {
            let shard_id: i64 = row.get(1)?;
            Ok(LeafRow {
                leaf_id: row.get(0)?,
                shard_id: shard_id as u32,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// All leaf ids + embeddings currently assigned to `shard_id`, used to
    /// rebuild that shard's ANN index from scratch (IVFPQ has no point
    /// deletion, so any shard touched by a change is fully rebuilt).
    pub fn leaves_in_shard(&self, shard_id: u32) -> Result<Vec<(String, Option<Vec<f32>>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT leaf_id, embedding FROM leaves WHERE shard_id = ?1")?;
        let rows = stmt.query_map(params![shard_id], |row| {
            let bytes: Option<Vec<u8>> = row.get(1)?;
            Ok((row.get::<_, String>(0)?, bytes.map(|b| le_bytes_to_f32_vec(&b))))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// `(docUri, headingPath, startChar, endChar)` for a leaf, used by the
    /// retrieval pipeline to hydrate candidates after scoring.
    pub fn leaf_location(&self, leaf_id: &str) -> Result<Option<LeafLocation>> {
        Ok(self
            .conn
            .query_row(
                "SELECT d.doc_uri, n.heading_path, l.start_char, l.end_char
                 FROM leaves l
                 JOIN docs d ON d.doc_id = l.doc_id
                 JOIN nodes n ON n.node_id = l.node_id
                 WHERE l.leaf_id = ?1",
                params![leaf_id],
                |row| {
                    Ok(LeafLocation {
                        doc_uri: row.get(0)?,
                        heading_path: row.get(1)?,
                        start_char: row.get::<_, i64>(2)? as usize,
                        end_char: row.get::<_, i64>(3)? as usize,
                    })
                },
            )
            .optional()?)
    }

    /// `{docUri → contentHash}` for every document, used to populate the
    /// manifest's `fileHashes` field.
    pub fn all_doc_hashes(&self) -> Result<HashMap<DocUri, String>> {
        let mut stmt = self.conn.prepare("SELECT doc_uri, hash FROM docs")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut map = HashMap::new();
        for row in rows {
            let (uri, hash) = row?;
            map.insert(uri, hash);
        }
        Ok(map)
    }

    pub fn doc_count(&self) -> Result<u64> {
        Ok(self.conn.query_row("SELECT COUNT(*) FROM docs", [], |row| row.get::<_, i64>(0))? as u64)
    }

    pub fn node_count(&self) -> Result<u64> {
        Ok(self.conn.query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get::<_, i64>(0))? as u64)
    }

    pub fn leaf_count(&self) -> Result<u64> {
        Ok(self.conn.query_row("SELECT COUNT(*) FROM leaves", [], |row| row.get::<_, i64>(0))? as u64)
    }
}

fn f32_slice_to_le_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn le_bytes_to_f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_doc_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("meta.sqlite")).unwrap();
        let rec = DocRecord {
            doc_uri: "a.md".to_string(),
            mtime_ms: 1,
            size: 10,
            hash: "h1".to_string(),
        };
        let id1 = store.upsert_doc(&rec).unwrap();
        let rec2 = DocRecord { mtime_ms: 2, ..rec };
        let id2 = store.upsert_doc(&rec2).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(store.doc_count().unwrap(), 1);
    }

    #[test]
    fn delete_doc_cascades_to_nodes_and_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MetadataStore::open(&dir.path().join("meta.sqlite")).unwrap();
        let rec = DocRecord {
            doc_uri: "a.md".to_string(),
            mtime_ms: 1,
            size: 10,
            hash: "h1".to_string(),
        };
        let doc_id = store.upsert_doc(&rec).unwrap();
        let tree = HeadingNode {
            node_id: "n1".to_string(),
            doc_uri: "a.md".to_string(),
            level: 0,
            title: String::new(),
            heading_path: String::new(),
            start_char: 0,
            end_char: 10,
            children: Vec::new(),
        };
        let chunks = vec![Chunk {
            leaf_id: "l1".to_string(),
            doc_uri: "a.md".to_string(),
            node_id: "n1".to_string(),
            heading_path: String::new(),
            start_char: 0,
            end_char: 10,
            text: "0123456789".to_string(),
            text_hash: "x".to_string(),
            shard_id: 0,
            token_count: 3,
        }];
        store.replace_doc_contents(doc_id, &tree, &chunks).unwrap();
        assert_eq!(store.leaf_count().unwrap(), 1);

        store.delete_doc("a.md").unwrap();
        assert_eq!(store.node_count().unwrap(), 0);
        assert_eq!(store.leaf_count().unwrap(), 0);
    }

    #[test]
    fn embedding_roundtrips_through_le_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MetadataStore::open(&dir.path().join("meta.sqlite")).unwrap();
        let rec = DocRecord {
            doc_uri: "a.md".to_string(),
            mtime_ms: 1,
            size: 10,
            hash: "h1".to_string(),
        };
        let doc_id = store.upsert_doc(&rec).unwrap();
        let tree = HeadingNode {
            node_id: "n1".to_string(),
            doc_uri: "a.md".to_string(),
            level: 0,
            title: String::new(),
            heading_path: String::new(),
            start_char: 0,
            end_char: 10,
            children: Vec::new(),
        };
        let chunks = vec![Chunk {
            leaf_id: "l1".to_string(),
            doc_uri: "a.md".to_string(),
            node_id: "n1".to_string(),
            heading_path: String::new(),
            start_char: 0,
            end_char: 10,
            text: "0123456789".to_string(),
            text_hash: "x".to_string(),
            shard_id: 0,
            token_count: 3,
        }];
        store.replace_doc_contents(doc_id, &tree, &chunks).unwrap();

        let vector = vec![0.5f32, -1.0, 2.25];
        store.set_embedding("l1", &vector).unwrap();
        let roundtripped = store.get_embedding("l1").unwrap().unwrap();
        assert_eq!(vector, roundtripped);
    }

    #[test]
    fn get_changed_docs_diffs_against_known() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("meta.sqlite")).unwrap();
        store
            .upsert_doc(&DocRecord { doc_uri: "a.md".to_string(), mtime_ms: 1, size: 1, hash: "h1".to_string() })
            .unwrap();
        store
            .upsert_doc(&DocRecord { doc_uri: "b.md".to_string(), mtime_ms: 1, size: 1, hash: "h1".to_string() })
            .unwrap();

        let mut known = HashMap::new();
        known.insert("a.md".to_string(), (2i64, "h1".to_string())); // modified (mtime changed)
        known.insert("c.md".to_string(), (1i64, "h1".to_string())); // added

        let changed = store.get_changed_docs(&known).unwrap();
        assert_eq!(changed.added, vec!["c.md".to_string()]);
        assert_eq!(changed.modified, vec!["a.md".to_string()]);
        assert_eq!(changed.deleted, vec!["b.md".to_string()]);
    }
}
