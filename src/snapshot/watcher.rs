// src/snapshot/watcher.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{info, trace, warn};

use super::SnapshotStore;

/// Keeps the OS watcher alive. Dropping it stops invalidation, after which
/// the store must no longer trust cached directory trees.
pub struct InvalidatorHandle {
    _inner: RecommendedWatcher,
}

impl std::fmt::Debug for InvalidatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidatorHandle").finish()
    }
}

/// Watch `root` recursively and invalidate snapshot entries as files change.
///
/// Once the watch is established the store is told it may cache whole
/// directory trees: a single change anywhere below `root` evicts that path
/// and its ancestors, so the next snapshot re-hashes only one spine.
pub fn spawn_invalidator(root: impl Into<PathBuf>, store: Arc<SnapshotStore>) -> Result<InvalidatorHandle> {
    let root = root.into();
    let canonical = root.canonicalize().unwrap_or_else(|_| root.clone());

    let callback_store = Arc::clone(&store);
    let callback_root = root.clone();
    let callback_canonical = canonical.clone();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                for path in &event.paths {
                    invalidate_event_path(&callback_store, &callback_root, &callback_canonical, path);
                }
            }
            Err(err) => {
                // The feed can no longer be trusted to be complete.
                warn!("file watch error, dropping cached snapshots: {err}");
                callback_store.invalidate_all();
            }
        },
        Config::default(),
    )?;

    watcher.watch(&canonical, RecursiveMode::Recursive)?;
    store.attach_change_feed();

    info!("snapshot invalidator watching {:?}", canonical);

    Ok(InvalidatorHandle { _inner: watcher })
}

/// Event paths come back canonicalised; the store may have been asked about
/// the same file through the non-canonical root, so evict both spellings.
fn invalidate_event_path(store: &SnapshotStore, root: &Path, canonical: &Path, path: &Path) {
    trace!(?path, "change feed event");
    store.invalidate(path);
    if root != canonical {
        if let Ok(rel) = path.strip_prefix(canonical) {
            store.invalidate(&root.join(rel));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::RealFileSystem;
    use std::time::Duration;

    #[test]
    fn feed_invalidates_changed_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.c"), "one").unwrap();

        let store = Arc::new(SnapshotStore::new(Arc::new(RealFileSystem)));
        let _handle = spawn_invalidator(dir.path(), Arc::clone(&store)).unwrap();

        let before = store.snapshot_of(&src).unwrap();
        std::fs::write(src.join("a.c"), "three").unwrap();

        // Give the OS feed a moment to deliver the event.
        let mut after = store.snapshot_of(&src).unwrap();
        for _ in 0..50 {
            if after.hash != before.hash {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
            after = store.snapshot_of(&src).unwrap();
        }
        assert_ne!(before.hash, after.hash);
    }
}
