// src/snapshot/mod.rs

//! Filesystem snapshots: content hash trees for files and directories.
//!
//! - [`Snapshot`] is an immutable hash tree over one path.
//! - [`SnapshotStore`] computes snapshots and caches them behind a cheap
//!   stamp check (size + mtime).
//! - [`watcher::spawn_invalidator`] feeds OS change notifications into the
//!   store so cached directory trees can be trusted between builds.

pub mod store;
pub mod watcher;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::hash::{ContentHash, HashBuilder};

pub use store::{SnapshotStats, SnapshotStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotKind {
    Missing,
    File,
    Directory,
    /// A directory link back into the tree being walked.
    Link,
}

impl SnapshotKind {
    pub(crate) fn tag(self) -> u8 {
        match self {
            SnapshotKind::Missing => 0,
            SnapshotKind::File => 1,
            SnapshotKind::Directory => 2,
            SnapshotKind::Link => 3,
        }
    }
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    /// The stamp check said "unchanged" but the bytes say otherwise.
    #[error("stale snapshot for {path:?}: cached hash {cached}, actual hash {actual}")]
    Integrity {
        path: PathBuf,
        cached: ContentHash,
        actual: ContentHash,
    },

    #[error("failed to snapshot {path:?}: {message}")]
    Io { path: PathBuf, message: String },
}

impl SnapshotError {
    pub fn is_integrity(&self) -> bool {
        matches!(self, SnapshotError::Integrity { .. })
    }
}

/// Hash tree over a path at one point in time. Never mutated, only replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub path: PathBuf,
    pub kind: SnapshotKind,
    pub hash: ContentHash,
    /// Children by name, sorted. Empty for files and missing paths.
    pub children: BTreeMap<String, Arc<Snapshot>>,
}

impl Snapshot {
    pub fn missing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: SnapshotKind::Missing,
            hash: ContentHash::missing(),
            children: BTreeMap::new(),
        }
    }

    pub fn file(path: impl Into<PathBuf>, hash: ContentHash) -> Self {
        Self {
            path: path.into(),
            kind: SnapshotKind::File,
            hash,
            children: BTreeMap::new(),
        }
    }

    /// Hashed by the link text, so a cycle is recorded instead of followed.
    pub fn link(path: impl Into<PathBuf>, target: &Path) -> Self {
        let mut builder = HashBuilder::new("kiln:link");
        builder.update_str(&target.to_string_lossy());
        Self {
            path: path.into(),
            kind: SnapshotKind::Link,
            hash: builder.finish(),
            children: BTreeMap::new(),
        }
    }

    /// A directory's hash covers the sorted `(name, kind, child hash)` list,
    /// so any change below it changes every ancestor's hash.
    pub fn directory(path: impl Into<PathBuf>, children: BTreeMap<String, Arc<Snapshot>>) -> Self {
        let mut builder = HashBuilder::new("kiln:dir");
        builder.update_u64(children.len() as u64);
        for (name, child) in &children {
            builder
                .update_str(name)
                .update_u8(child.kind.tag())
                .update_hash(&child.hash);
        }
        Self {
            path: path.into(),
            kind: SnapshotKind::Directory,
            hash: builder.finish(),
            children,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.kind == SnapshotKind::Missing
    }

    /// Visit this snapshot and every descendant in sorted pre-order, passing
    /// the path relative to `self` (empty for `self`).
    pub fn visit(&self, f: &mut impl FnMut(&Path, &Snapshot)) {
        self.visit_rel(Path::new(""), f);
    }

    fn visit_rel(&self, rel: &Path, f: &mut impl FnMut(&Path, &Snapshot)) {
        f(rel, self);
        for (name, child) in &self.children {
            child.visit_rel(&rel.join(name), f);
        }
    }

    /// Regular files below (or at) this snapshot, with relative paths.
    pub fn files(&self) -> Vec<(PathBuf, ContentHash)> {
        let mut out = Vec::new();
        self.visit(&mut |rel, snap| {
            if snap.kind == SnapshotKind::File {
                out.push((rel.to_path_buf(), snap.hash));
            }
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str, bytes: &[u8]) -> (String, Arc<Snapshot>) {
        (
            name.to_string(),
            Arc::new(Snapshot::file(name, ContentHash::of_bytes(bytes))),
        )
    }

    #[test]
    fn directory_hash_depends_on_names_and_contents() {
        let a = Snapshot::directory("/d", BTreeMap::from([leaf("a", b"1"), leaf("b", b"2")]));
        let renamed = Snapshot::directory("/d", BTreeMap::from([leaf("a", b"1"), leaf("c", b"2")]));
        let edited = Snapshot::directory("/d", BTreeMap::from([leaf("a", b"1"), leaf("b", b"3")]));
        assert_ne!(a.hash, renamed.hash);
        assert_ne!(a.hash, edited.hash);
    }

    #[test]
    fn empty_directory_is_not_missing() {
        let empty = Snapshot::directory("/d", BTreeMap::new());
        assert_ne!(empty.hash, Snapshot::missing("/d").hash);
    }

    #[test]
    fn files_lists_nested_relative_paths() {
        let inner = Snapshot::directory("/d/sub", BTreeMap::from([leaf("x", b"x")]));
        let root = Snapshot::directory(
            "/d",
            BTreeMap::from([leaf("a", b"a"), ("sub".to_string(), Arc::new(inner))]),
        );
        let names: Vec<PathBuf> = root.files().into_iter().map(|(p, _)| p).collect();
        assert_eq!(names, vec![PathBuf::from("a"), PathBuf::from("sub/x")]);
    }
}
