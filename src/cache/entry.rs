// src/cache/entry.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::hash::ContentHash;

/// Where and when a cache entry was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginMetadata {
    pub build_invocation_id: String,
    pub task_id: String,
    pub fingerprint: String,
    pub execution_time_ms: u64,
    /// RFC 3339.
    pub created_at: String,
    pub hostname: String,
}

impl OriginMetadata {
    pub fn new(build_invocation_id: &str, task_id: &str, fingerprint: &Fingerprint, execution_time: Duration) -> Self {
        Self {
            build_invocation_id: build_invocation_id.to_string(),
            task_id: task_id.to_string(),
            fingerprint: fingerprint.to_hex(),
            execution_time_ms: execution_time.as_millis() as u64,
            created_at: chrono::Utc::now().to_rfc3339(),
            hostname: hostname(),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    File,
    Directory,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// `/`-separated path relative to the output root; empty for a file output.
    pub path: String,
    pub hash: ContentHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub kind: OutputKind,
    #[serde(default)]
    pub files: Vec<ManifestFile>,
    /// Subdirectories (relative), so empty directories survive a round trip.
    #[serde(default)]
    pub dirs: Vec<String>,
}

/// Output name to stored content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputManifest {
    pub outputs: BTreeMap<String, ManifestEntry>,
}

impl OutputManifest {
    pub fn names(&self) -> Vec<String> {
        self.outputs.keys().cloned().collect()
    }
}

/// One packed cache entry. Immutable once written.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: Fingerprint,
    /// The gzip tar archive, exactly as stored in either tier.
    pub packed: Vec<u8>,
    pub manifest: OutputManifest,
    pub origin: OriginMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_records_fingerprint_and_time() {
        let fp = Fingerprint::from_hash(ContentHash::of_bytes(b"k"));
        let origin = OriginMetadata::new("build-1", "compile", &fp, Duration::from_millis(1500));
        assert_eq!(origin.fingerprint, fp.to_hex());
        assert_eq!(origin.execution_time_ms, 1500);
        assert!(chrono::DateTime::parse_from_rfc3339(&origin.created_at).is_ok());
        assert!(!origin.hostname.is_empty());
    }

    #[test]
    fn manifest_json_shape() {
        let mut manifest = OutputManifest::default();
        manifest.outputs.insert(
            "obj".into(),
            ManifestEntry {
                kind: OutputKind::File,
                files: vec![ManifestFile {
                    path: String::new(),
                    hash: ContentHash::of_bytes(b"o"),
                }],
                dirs: vec![],
            },
        );
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"kind\":\"file\""));
        let back: OutputManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);
    }
}
