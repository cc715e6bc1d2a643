//! Debounced filesystem watch over the vault's `.md` files.
//!
//! Generalizes the teacher's `app/src-tauri/src/file_watcher.rs`
//! (`RecommendedWatcher` + a per-path `SystemTime` debounce ledger) with the
//! Tauri `AppHandle`/`emit` coupling removed in favor of a plain callback,
//! and the teacher's fixed 2-second per-path cooldown replaced with a
//! single shared batch timer reset on every event, so that all events since
//! the last fire are coalesced into one batch rather than debounced
//! independently per file.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::types::{DocUri, WatchEvent, WatchEventKind};

/// Subscribes to filesystem events for `.md` files under the vault and
/// delivers debounced batches to `callback`.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    stop_tx: Option<mpsc::Sender<()>>,
    debounce_ms: u64,
}

impl FileWatcher {
    /// Starts watching `vault_root`. Events are coalesced on a shared timer
    /// reset by every new event and fired `debounce_ms` after the last one;
    /// the accumulated batch is then delivered to `callback` and cleared.
    pub fn start(
        vault_root: PathBuf,
        debounce_ms: u64,
        callback: impl Fn(Vec<WatchEvent>) + Send + Sync + 'static,
    ) -> Result<Self> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Event>();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = raw_tx.send(event);
            }
        })
        .context("failed to create filesystem watcher")?;
        watcher
            .watch(&vault_root, RecursiveMode::Recursive)
            .context("failed to start watching vault root")?;

        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let root = vault_root.clone();

        tokio::spawn(async move {
            let mut pending: HashMap<DocUri, WatchEventKind> = HashMap::new();
            let debounce = Duration::from_millis(debounce_ms);
            let timer = tokio::time::sleep(debounce);
            tokio::pin!(timer);
            let mut armed = false;

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    maybe_event = raw_rx.recv() => {
                        let Some(event) = maybe_event else { break };
                        if let Some(kind) = classify(&event.kind) {
                            for path in &event.paths {
                                if path.extension().and_then(|e| e.to_str()) != Some("md") {
                                    continue;
                                }
                                if let Ok(doc_uri) = crate::types::doc_uri_from_abs(path, &root) {
                                    pending.insert(doc_uri, kind);
                                }
                            }
                            if !pending.is_empty() {
                                timer.as_mut().reset(tokio::time::Instant::now() + debounce);
                                armed = true;
                            }
                        }
                    }
                    _ = &mut timer, if armed => {
                        armed = false;
                        if !pending.is_empty() {
                            let batch: Vec<WatchEvent> = pending
                                .drain()
                                .map(|(doc_uri, kind)| WatchEvent { kind, doc_uri })
                                .collect();
                            callback(batch);
                        }
                    }
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            stop_tx: Some(stop_tx),
            debounce_ms,
        })
    }

    pub fn debounce_ms(&self) -> u64 {
        self.debounce_ms
    }

    /// Cancels the pending timer and releases the subscription. Idempotent:
    /// calling `stop` a second time is a no-op.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn classify(kind: &EventKind) -> Option<WatchEventKind> {
    match kind {
        EventKind::Create(_) => Some(WatchEventKind::Add),
        EventKind::Modify(_) => Some(WatchEventKind::Change),
        EventKind::Remove(_) => Some(WatchEventKind::Unlink),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn debounced_writes_coalesce_into_one_batch() {
        let dir = tempfile::tempdir().unwrap();
        let batches: Arc<Mutex<Vec<Vec<WatchEvent>>>> = Arc::new(Mutex::new(Vec::new()));
        let batches_clone = batches.clone();

        let mut watcher = FileWatcher::start(dir.path().to_path_buf(), 150, move |batch| {
            batches_clone.lock().unwrap().push(batch);
        })
        .unwrap();

        let file = dir.path().join("a.md");
        std::fs::write(&file, "one").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        std::fs::write(&file, "two").unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        watcher.stop();

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1, "rapid writes to the same file should coalesce into one batch");
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].doc_uri, "a.md");
    }

    #[test]
    fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = FileWatcher::start(dir.path().to_path_buf(), 500, |_| {}).unwrap();
        watcher.stop();
        watcher.stop();
    }
}
