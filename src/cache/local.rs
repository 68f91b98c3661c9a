// src/cache/local.rs

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::CacheError;
use crate::fingerprint::Fingerprint;
use crate::fs::{FileKind, FileSystem};
use crate::hash::ContentHash;

const MARKER_SUFFIX: &str = ".manifest";
const TMP_SUFFIX: &str = ".tmp";

/// Side-car written next to each archive. Its presence is what makes an
/// entry visible: it is renamed into place only after the archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMarker {
    checksum: ContentHash,
    size: u64,
    created_at: String,
    /// Unix milliseconds of the last store or hit.
    last_access_ms: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalCacheStats {
    pub entries: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub removed: u64,
    pub bytes_freed: u64,
}

/// On-disk cache tier: `<root>/<first two hex chars>/<hex>` plus a
/// `<hex>.manifest` side-car holding checksum, size and last access.
#[derive(Debug, Clone)]
pub struct LocalBuildCache {
    root: PathBuf,
    fs: Arc<dyn FileSystem>,
}

impl LocalBuildCache {
    pub fn new(root: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            root: root.into(),
            fs,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shard_dir(&self, key: &Fingerprint) -> PathBuf {
        self.root.join(key.shard())
    }

    fn archive_path(&self, key: &Fingerprint) -> PathBuf {
        self.shard_dir(key).join(key.to_hex())
    }

    fn marker_path(&self, key: &Fingerprint) -> PathBuf {
        self.shard_dir(key)
            .join(format!("{}{MARKER_SUFFIX}", key.to_hex()))
    }

    pub fn contains(&self, key: &Fingerprint) -> bool {
        self.fs.exists(&self.marker_path(key))
    }

    /// Read and verify an entry. `Ok(None)` on a miss; a corrupt entry is an
    /// integrity error and the caller is expected to [`evict`](Self::evict).
    pub fn load(&self, key: &Fingerprint) -> Result<Option<Vec<u8>>, CacheError> {
        let marker_path = self.marker_path(key);
        if !self.fs.exists(&marker_path) {
            return Ok(None);
        }
        let mut marker: EntryMarker = serde_json::from_str(&self.fs.read_to_string(&marker_path)?)
            .map_err(|e| CacheError::integrity(key, format!("unreadable entry manifest: {e}")))?;

        let archive_path = self.archive_path(key);
        if !self.fs.exists(&archive_path) {
            return Err(CacheError::integrity(key, "archive is missing"));
        }
        let mut bytes = Vec::new();
        self.fs.open_read(&archive_path)?.read_to_end(&mut bytes)?;

        if bytes.len() as u64 != marker.size {
            return Err(CacheError::integrity(
                key,
                format!("size {} does not match recorded size {}", bytes.len(), marker.size),
            ));
        }
        let actual = ContentHash::of_bytes(&bytes);
        if actual != marker.checksum {
            return Err(CacheError::integrity(
                key,
                format!("checksum {actual} does not match recorded {}", marker.checksum),
            ));
        }

        marker.last_access_ms = Utc::now().timestamp_millis();
        if let Err(e) = self.write_marker(key, &marker) {
            warn!(key = %key, error = %e, "failed to refresh cache entry access time");
        }
        debug!(key = %key, bytes = bytes.len(), "local cache hit");
        Ok(Some(bytes))
    }

    /// Store an entry. Existing entries are immutable and left as they are.
    pub fn store(&self, key: &Fingerprint, archive: &[u8]) -> Result<(), CacheError> {
        if self.contains(key) {
            debug!(key = %key, "local cache entry already present");
            return Ok(());
        }
        let tmp = self
            .shard_dir(key)
            .join(format!("{}.{}{TMP_SUFFIX}", key.to_hex(), Uuid::new_v4()));
        self.fs.write(&tmp, archive)?;
        self.fs.rename(&tmp, &self.archive_path(key))?;

        let now = Utc::now();
        let marker = EntryMarker {
            checksum: ContentHash::of_bytes(archive),
            size: archive.len() as u64,
            created_at: now.to_rfc3339(),
            last_access_ms: now.timestamp_millis(),
        };
        self.write_marker(key, &marker)?;
        debug!(key = %key, bytes = archive.len(), "stored local cache entry");
        Ok(())
    }

    fn write_marker(&self, key: &Fingerprint, marker: &EntryMarker) -> Result<(), CacheError> {
        let tmp = self
            .shard_dir(key)
            .join(format!("{}{MARKER_SUFFIX}.{}{TMP_SUFFIX}", key.to_hex(), Uuid::new_v4()));
        self.fs.write(&tmp, &serde_json::to_vec(marker)?)?;
        self.fs.rename(&tmp, &self.marker_path(key))?;
        Ok(())
    }

    /// Remove an entry. The marker goes first so readers never see a
    /// committed entry without its archive.
    pub fn evict(&self, key: &Fingerprint) -> Result<(), CacheError> {
        self.fs.remove_all(&self.marker_path(key))?;
        self.fs.remove_all(&self.archive_path(key))?;
        info!(key = %key, "evicted local cache entry");
        Ok(())
    }

    pub fn stats(&self) -> Result<LocalCacheStats, CacheError> {
        let mut stats = LocalCacheStats::default();
        for marker_path in self.marker_files()? {
            if let Some(marker) = self.read_marker(&marker_path) {
                stats.entries += 1;
                stats.bytes += marker.size;
            }
        }
        Ok(stats)
    }

    /// Remove entries not used within `max_age`.
    pub fn prune(&self, max_age: Duration) -> Result<PruneStats, CacheError> {
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.prune_unused_since(cutoff)
    }

    /// Remove entries whose last access is before `cutoff`, along with
    /// archives that were never committed and leftover temp files.
    pub fn prune_unused_since(&self, cutoff: DateTime<Utc>) -> Result<PruneStats, CacheError> {
        let cutoff_ms = cutoff.timestamp_millis();
        let mut stats = PruneStats::default();

        for shard in self.shard_dirs()? {
            for path in self.fs.read_dir(&shard)? {
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if name.ends_with(TMP_SUFFIX) {
                    self.fs.remove_all(&path)?;
                } else if let Some(hex) = name.strip_suffix(MARKER_SUFFIX) {
                    let archive = shard.join(hex);
                    let expired = match self.read_marker(&path) {
                        Some(marker) => marker.last_access_ms < cutoff_ms,
                        None => true,
                    };
                    if expired {
                        let size = self.file_len(&archive);
                        self.fs.remove_all(&path)?;
                        self.fs.remove_all(&archive)?;
                        stats.removed += 1;
                        stats.bytes_freed += size;
                    }
                } else if !self.fs.exists(&shard.join(format!("{name}{MARKER_SUFFIX}"))) {
                    let size = self.file_len(&path);
                    self.fs.remove_all(&path)?;
                    stats.bytes_freed += size;
                }
            }
        }

        info!(
            removed = stats.removed,
            bytes_freed = stats.bytes_freed,
            "pruned local build cache"
        );
        Ok(stats)
    }

    fn shard_dirs(&self) -> Result<Vec<PathBuf>, CacheError> {
        if !self.fs.is_dir(&self.root) {
            return Ok(Vec::new());
        }
        let mut shards: Vec<PathBuf> = self
            .fs
            .read_dir(&self.root)?
            .into_iter()
            .filter(|p| self.fs.is_dir(p))
            .collect();
        shards.sort();
        Ok(shards)
    }

    fn marker_files(&self) -> Result<Vec<PathBuf>, CacheError> {
        let mut markers = Vec::new();
        for shard in self.shard_dirs()? {
            for path in self.fs.read_dir(&shard)? {
                if path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(MARKER_SUFFIX))
                {
                    markers.push(path);
                }
            }
        }
        Ok(markers)
    }

    fn read_marker(&self, path: &Path) -> Option<EntryMarker> {
        let text = self.fs.read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn file_len(&self, path: &Path) -> u64 {
        match self.fs.metadata(path) {
            Ok(Some(stamp)) if stamp.kind == FileKind::File => stamp.len,
            _ => 0,
        }
    }
}
