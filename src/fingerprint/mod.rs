// src/fingerprint/mod.rs

//! Task fingerprints: one deterministic cache key per task.
//!
//! A fingerprint folds, in a fixed order:
//! 1. a format version,
//! 2. the action identity,
//! 3. every input sorted by logical name, normalised by its path sensitivity,
//! 4. every output's logical name and sensitivity, sorted by name.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::graph::{InputSpec, InputValue, TaskNode};
use crate::hash::{ContentHash, HashBuilder};
use crate::snapshot::{Snapshot, SnapshotError, SnapshotKind, SnapshotStore};
use crate::types::PathSensitivity;

const FINGERPRINT_DOMAIN: &str = "kiln:fingerprint:v1";

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(ContentHash);

impl Fingerprint {
    pub fn from_hash(hash: ContentHash) -> Self {
        Self(hash)
    }

    pub fn hash(&self) -> &ContentHash {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        ContentHash::from_hex(s).map(Self)
    }

    /// First two hex characters; used to shard the local cache.
    pub fn shard(&self) -> String {
        self.to_hex()[..2].to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

/// Compile `exclude` patterns for a directory input.
pub fn compile_excludes(patterns: &[String]) -> Result<Option<GlobSet>, globset::Error> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(Some(builder.build()?))
}

/// Computes fingerprints against a shared [`SnapshotStore`].
#[derive(Debug, Clone)]
pub struct FingerprintEngine {
    snapshots: Arc<SnapshotStore>,
}

impl FingerprintEngine {
    pub fn new(snapshots: Arc<SnapshotStore>) -> Self {
        Self { snapshots }
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn fingerprint_of(&self, task: &TaskNode) -> Result<Fingerprint, SnapshotError> {
        let mut inputs: Vec<&InputSpec> = task.inputs.iter().collect();
        inputs.sort_by(|a, b| a.name.cmp(&b.name));

        let mut builder = HashBuilder::new(FINGERPRINT_DOMAIN);
        builder.update_str(&task.action.identity());

        builder.update_u64(inputs.len() as u64);
        for input in inputs {
            let normalized = self.normalized_input(input)?;
            builder
                .update_str(&input.name)
                .update_str(input.sensitivity.as_str())
                .update_hash(&normalized);
        }

        let mut outputs: Vec<_> = task.outputs.iter().collect();
        outputs.sort_by(|a, b| a.name.cmp(&b.name));
        builder.update_u64(outputs.len() as u64);
        for output in outputs {
            builder
                .update_str(&output.name)
                .update_str(output.sensitivity.as_str());
        }

        let fingerprint = Fingerprint(builder.finish());
        debug!(task = %task.id, fingerprint = %fingerprint, "computed fingerprint");
        Ok(fingerprint)
    }

    /// Hash of one input after path-sensitivity normalisation.
    pub fn normalized_input(&self, input: &InputSpec) -> Result<ContentHash, SnapshotError> {
        let path = match &input.value {
            InputValue::Scalar(value) => {
                return Ok(HashBuilder::new("kiln:scalar").update_str(value).finish());
            }
            InputValue::Path(path) => path,
        };

        if input.sensitivity == PathSensitivity::None {
            return Ok(HashBuilder::new("kiln:ignored").finish());
        }

        let excludes = compile_excludes(&input.exclude).map_err(|e| SnapshotError::Io {
            path: path.clone(),
            message: format!("invalid exclude pattern: {e}"),
        })?;

        let snapshot = self.snapshots.snapshot_of(path)?;
        let mut builder = HashBuilder::new("kiln:input");
        fold_entry(
            &mut builder,
            path,
            Path::new(""),
            &snapshot,
            input.sensitivity,
            excludes.as_ref(),
        );
        Ok(builder.finish())
    }

    /// Combined hash of all output snapshots, used by the up-to-date check to
    /// notice deleted or modified outputs.
    pub fn outputs_hash(&self, task: &TaskNode) -> Result<ContentHash, SnapshotError> {
        let mut outputs: Vec<_> = task.outputs.iter().collect();
        outputs.sort_by(|a, b| a.name.cmp(&b.name));

        let mut builder = HashBuilder::new("kiln:outputs");
        for output in outputs {
            let snapshot = self.snapshots.snapshot_of(&output.path)?;
            builder
                .update_str(&output.name)
                .update_u8(snapshot.kind.tag())
                .update_hash(&snapshot.hash);
        }
        Ok(builder.finish())
    }
}

fn fold_entry(
    builder: &mut HashBuilder,
    root: &Path,
    rel: &Path,
    snapshot: &Snapshot,
    sensitivity: PathSensitivity,
    excludes: Option<&GlobSet>,
) {
    let is_root = rel.as_os_str().is_empty();
    if !is_root {
        if let Some(set) = excludes {
            if set.is_match(rel) {
                return;
            }
        }
    }

    let normalized = normalized_path(root, rel, snapshot.kind, sensitivity);
    builder.update_str(&normalized).update_u8(snapshot.kind.tag());
    if matches!(snapshot.kind, SnapshotKind::File | SnapshotKind::Link) {
        builder.update_hash(&snapshot.hash);
    }

    for (name, child) in &snapshot.children {
        fold_entry(builder, root, &rel.join(name), child, sensitivity, excludes);
    }
}

fn normalized_path(root: &Path, rel: &Path, kind: SnapshotKind, sensitivity: PathSensitivity) -> String {
    let full: PathBuf = if rel.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(rel)
    };
    let name_of = |p: &Path| {
        p.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };

    match sensitivity {
        PathSensitivity::Absolute => slash_path(&full),
        PathSensitivity::NameOnly => name_of(&full),
        PathSensitivity::Relative => {
            if rel.as_os_str().is_empty() {
                // A directory root is the origin of the relative paths below it.
                if kind == SnapshotKind::Directory {
                    String::new()
                } else {
                    name_of(root)
                }
            } else {
                slash_path(rel)
            }
        }
        PathSensitivity::None => String::new(),
    }
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
