// src/cache/mod.rs

//! Content-addressable build cache.
//!
//! - [`entry`]: origin metadata and the output manifest stored in an entry.
//! - [`packer`]: packs declared outputs into a gzip tar archive and back.
//! - [`local`]: sharded on-disk tier with atomic commits.
//! - [`remote`]: HTTP tier (`GET`/`PUT /cache/{hex}`).
//! - [`controller`]: [`BuildCache`], the load-or-compute facade.

pub mod controller;
pub mod entry;
pub mod local;
pub mod packer;
pub mod remote;

use std::time::Duration;

use thiserror::Error;

pub use controller::{BuildCache, CacheOutcome, CacheRequest, CacheSource};
pub use entry::{CacheEntry, ManifestEntry, OriginMetadata, OutputKind, OutputManifest};
pub use local::{LocalBuildCache, LocalCacheStats, PruneStats};
pub use remote::{HttpRemoteCache, RemoteCache, RemoteCredentials, RemoteFuture, ARTIFACT_CONTENT_TYPE};

#[derive(Error, Debug)]
pub enum CacheError {
    /// Disk or network trouble. Treated as a miss on read, a no-op on write.
    #[error("cache IO error: {0}")]
    Io(String),

    /// Corrupt entry (checksum mismatch, bad archive, missing files).
    #[error("integrity failure for cache entry {key}: {reason}")]
    Integrity { key: String, reason: String },

    /// The entry was produced for a different set of outputs.
    #[error("cache entry {key} stores outputs {stored:?} but the task declares {declared:?}")]
    ManifestMismatch {
        key: String,
        stored: Vec<String>,
        declared: Vec<String>,
    },

    #[error("remote cache returned HTTP {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("remote cache call timed out after {0:?}")]
    Timeout(Duration),

    #[error("cache metadata serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    /// Integrity problems evict the entry; everything else just degrades.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            CacheError::Integrity { .. } | CacheError::ManifestMismatch { .. }
        )
    }

    pub(crate) fn integrity(key: impl ToString, reason: impl Into<String>) -> Self {
        CacheError::Integrity {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}

impl From<anyhow::Error> for CacheError {
    fn from(err: anyhow::Error) -> Self {
        CacheError::Io(format!("{err:#}"))
    }
}
