//! Recursive vault walk producing `{docUri, size, mtimeMs}` for every
//! `.md` file, and a diff against a prior snapshot of the same shape.
//!
//! Built on `walkdir`, the crate the teacher already depends on for
//! directory traversal (`indexing.rs::preview_folder`/`index_folder`),
//! filtered in the same hidden-name/extension-matching style as
//! `is_supported_file_type` but narrowed to the single `.md` extension
//! this crate cares about.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use walkdir::WalkDir;

use crate::types::{ChangeSet, DocUri, FileEntry};

/// Directory names skipped during the walk, regardless of depth.
const EXCLUDED_DIRS: &[&str] = &[".git", "node_modules", ".msrl", ".obsidian"];

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn is_excluded_dir(name: &str) -> bool {
    EXCLUDED_DIRS.contains(&name) || is_hidden(name)
}

/// Recursively walks `vault_root`, returning one `FileEntry` per `.md` file
/// found. Hidden directories/files and `EXCLUDED_DIRS` are skipped. Paths
/// are POSIX-style and vault-relative, even on Windows.
pub fn scan_vault(vault_root: &Path) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();

    let walker = WalkDir::new(vault_root).into_iter().filter_entry(|entry| {
        if entry.depth() == 0 {
            return true;
        }
        let name = entry.file_name().to_string_lossy();
        if entry.file_type().is_dir() {
            !is_excluded_dir(&name)
        } else {
            !is_hidden(&name)
        }
    });

    for entry in walker {
        let entry = entry.context("failed to walk vault directory")?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }

        let doc_uri = crate::types::doc_uri_from_abs(path, vault_root)?;
        let metadata = entry.metadata().context("failed to stat file")?;
        let mtime_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        entries.push(FileEntry {
            doc_uri,
            size: metadata.len(),
            mtime_ms,
        });
    }

    Ok(entries)
}

/// Diffs `curr` against `prev`, detecting modification via either `mtimeMs`
/// or `size` differing.
pub fn detect_changes(prev: &[FileEntry], curr: &[FileEntry]) -> ChangeSet {
    let prev_by_uri: HashMap<&DocUri, &FileEntry> =
        prev.iter().map(|e| (&e.doc_uri, e)).collect();
    let curr_by_uri: HashMap<&DocUri, &FileEntry> =
        curr.iter().map(|e| (&e.doc_uri, e)).collect();

    let mut changes = ChangeSet::default();

    for (uri, entry) in &curr_by_uri {
        match prev_by_uri.get(uri) {
            None => changes.added.push((*uri).clone()),
            Some(prior) => {
                if prior.mtime_ms != entry.mtime_ms || prior.size != entry.size {
                    changes.modified.push((*uri).clone());
                }
            }
        }
    }
    for uri in prev_by_uri.keys() {
        if !curr_by_uri.contains_key(*uri) {
            changes.deleted.push((*uri).clone());
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn scan_finds_only_markdown_files_and_skips_hidden_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.md"), "# A\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "not markdown").unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git").join("config.md"), "x").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("b.md"), "# B\n").unwrap();

        let mut entries = scan_vault(dir.path()).unwrap();
        entries.sort_by(|a, b| a.doc_uri.cmp(&b.doc_uri));
        let uris: Vec<&str> = entries.iter().map(|e| e.doc_uri.as_str()).collect();
        assert_eq!(uris, vec!["a.md", "sub/b.md"]);
    }

    #[test]
    fn detect_changes_classifies_added_modified_deleted() {
        let prev = vec![
            FileEntry { doc_uri: "a.md".into(), size: 10, mtime_ms: 1 },
            FileEntry { doc_uri: "b.md".into(), size: 20, mtime_ms: 1 },
        ];
        let curr = vec![
            FileEntry { doc_uri: "a.md".into(), size: 10, mtime_ms: 2 }, // modified (mtime)
            FileEntry { doc_uri: "c.md".into(), size: 5, mtime_ms: 1 },  // added
        ];
        let changes = detect_changes(&prev, &curr);
        assert_eq!(changes.added, vec!["c.md".to_string()]);
        assert_eq!(changes.modified, vec!["a.md".to_string()]);
        assert_eq!(changes.deleted, vec!["b.md".to_string()]);
    }

    #[test]
    fn unchanged_files_produce_no_diff() {
        let entries = vec![FileEntry { doc_uri: "a.md".into(), size: 10, mtime_ms: 1 }];
        let changes = detect_changes(&entries, &entries);
        assert!(changes.is_empty());
    }
}
