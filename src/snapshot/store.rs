// src/snapshot/store.rs

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, trace};

use crate::fs::{FileKind, FileStamp, FileSystem};
use crate::hash::ContentHash;

use super::{Snapshot, SnapshotError};

#[derive(Debug, Clone)]
struct CachedFile {
    stamp: FileStamp,
    snapshot: Arc<Snapshot>,
}

#[derive(Debug, Default)]
struct StoreInner {
    files: HashMap<PathBuf, CachedFile>,
    /// Directory trees. Only populated while a change feed is attached,
    /// because a directory stamp does not cover its descendants.
    dirs: HashMap<PathBuf, Arc<Snapshot>>,
}

/// Counters exposed for tests and debug logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    /// Files whose bytes were read and hashed.
    pub files_hashed: u64,
    /// Files answered from the stamp cache without reading content.
    pub stamp_hits: u64,
    /// Directory trees answered from the directory cache.
    pub tree_hits: u64,
}

/// Computes and caches [`Snapshot`]s.
///
/// One store is built per build invocation and shared (behind `Arc`) by the
/// fingerprint engine, the build cache and the change feed.
#[derive(Debug)]
pub struct SnapshotStore {
    fs: Arc<dyn FileSystem>,
    inner: Mutex<StoreInner>,
    verify: bool,
    trust_directories: AtomicBool,
    files_hashed: AtomicU64,
    stamp_hits: AtomicU64,
    tree_hits: AtomicU64,
}

impl SnapshotStore {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            inner: Mutex::new(StoreInner::default()),
            verify: false,
            trust_directories: AtomicBool::new(false),
            files_hashed: AtomicU64::new(0),
            stamp_hits: AtomicU64::new(0),
            tree_hits: AtomicU64::new(0),
        }
    }

    /// Re-hash every stamp-cache hit and fail on disagreement.
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn filesystem(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Called once a change feed is delivering invalidations for every path
    /// the store will be asked about.
    pub fn attach_change_feed(&self) {
        self.trust_directories.store(true, Ordering::SeqCst);
        debug!("snapshot store: change feed attached, caching directory trees");
    }

    pub fn stats(&self) -> SnapshotStats {
        SnapshotStats {
            files_hashed: self.files_hashed.load(Ordering::Relaxed),
            stamp_hits: self.stamp_hits.load(Ordering::Relaxed),
            tree_hits: self.tree_hits.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot `path`, reusing cached hashes where the stamp is unchanged.
    pub fn snapshot_of(&self, path: &Path) -> Result<Arc<Snapshot>, SnapshotError> {
        self.snapshot_below(path, &mut Vec::new())
    }

    /// `ancestors` holds the resolved paths of the directories being walked.
    fn snapshot_below(&self, path: &Path, ancestors: &mut Vec<PathBuf>) -> Result<Arc<Snapshot>, SnapshotError> {
        if self.trust_directories.load(Ordering::SeqCst) {
            if let Some(tree) = self.lock().dirs.get(path).cloned() {
                self.tree_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(tree);
            }
        }

        let stamp = self.fs.metadata(path).map_err(|e| io_error(path, e))?;
        match stamp {
            None => Ok(Arc::new(Snapshot::missing(path))),
            Some(stamp) if stamp.kind == FileKind::File => self.snapshot_file(path, stamp),
            Some(_) => self.snapshot_dir(path, ancestors),
        }
    }

    fn snapshot_file(&self, path: &Path, stamp: FileStamp) -> Result<Arc<Snapshot>, SnapshotError> {
        let cached = self.lock().files.get(path).cloned();

        if let Some(cached) = cached {
            if cached.stamp == stamp {
                self.stamp_hits.fetch_add(1, Ordering::Relaxed);
                if self.verify {
                    let actual = self.hash_file(path)?;
                    if actual != cached.snapshot.hash {
                        error!(
                            path = ?path,
                            cached = %cached.snapshot.hash,
                            actual = %actual,
                            "snapshot integrity violation"
                        );
                        return Err(SnapshotError::Integrity {
                            path: path.to_path_buf(),
                            cached: cached.snapshot.hash,
                            actual,
                        });
                    }
                }
                trace!(path = ?path, "snapshot stamp hit");
                return Ok(cached.snapshot);
            }
        }

        let hash = self.hash_file(path)?;
        let snapshot = Arc::new(Snapshot::file(path, hash));

        // Only remember the hash if nothing changed while we were reading.
        let after = self.fs.metadata(path).map_err(|e| io_error(path, e))?;
        if after == Some(stamp) {
            self.lock().files.insert(
                path.to_path_buf(),
                CachedFile {
                    stamp,
                    snapshot: Arc::clone(&snapshot),
                },
            );
        } else {
            debug!(path = ?path, "file changed while hashing; not caching");
        }
        Ok(snapshot)
    }

    fn snapshot_dir(&self, path: &Path, ancestors: &mut Vec<PathBuf>) -> Result<Arc<Snapshot>, SnapshotError> {
        let resolved = self.fs.canonicalize(path).map_err(|e| io_error(path, e))?;
        if ancestors.contains(&resolved) {
            let target = self
                .fs
                .read_link(path)
                .map_err(|e| io_error(path, e))?
                .unwrap_or(resolved);
            debug!(path = ?path, target = ?target, "directory link cycle; not following");
            return Ok(Arc::new(Snapshot::link(path, &target)));
        }

        ancestors.push(resolved);
        let children = self.snapshot_children(path, ancestors);
        ancestors.pop();
        let snapshot = Arc::new(Snapshot::directory(path, children?));
        if self.trust_directories.load(Ordering::SeqCst) {
            self.lock()
                .dirs
                .insert(path.to_path_buf(), Arc::clone(&snapshot));
        }
        Ok(snapshot)
    }

    fn snapshot_children(
        &self,
        path: &Path,
        ancestors: &mut Vec<PathBuf>,
    ) -> Result<BTreeMap<String, Arc<Snapshot>>, SnapshotError> {
        let entries = self.fs.read_dir(path).map_err(|e| io_error(path, e))?;
        let mut children = BTreeMap::new();
        for child in entries {
            let Some(name) = child.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let name = name.to_string();
            let snap = self.snapshot_below(&child, ancestors)?;
            // Raced with a delete; the entry simply is not part of the tree.
            if snap.is_missing() {
                continue;
            }
            children.insert(name, snap);
        }
        Ok(children)
    }

    fn hash_file(&self, path: &Path) -> Result<ContentHash, SnapshotError> {
        let reader = self.fs.open_read(path).map_err(|e| io_error(path, e))?;
        let hash = ContentHash::of_reader(reader).map_err(|e| io_error(path, e.into()))?;
        self.files_hashed.fetch_add(1, Ordering::Relaxed);
        trace!(path = ?path, hash = %hash, "hashed file");
        Ok(hash)
    }

    /// Forget `path`, everything below it and every cached ancestor tree.
    pub fn invalidate(&self, path: &Path) {
        let mut inner = self.lock();
        inner.files.retain(|p, _| !p.starts_with(path));
        inner
            .dirs
            .retain(|p, _| !p.starts_with(path) && !path.starts_with(p));
        trace!(path = ?path, "invalidated snapshot");
    }

    pub fn invalidate_all(&self) {
        let mut inner = self.lock();
        inner.files.clear();
        inner.dirs.clear();
    }
}

fn io_error(path: &Path, err: anyhow::Error) -> SnapshotError {
    SnapshotError::Io {
        path: path.to_path_buf(),
        message: format!("{err:#}"),
    }
}
