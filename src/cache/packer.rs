// src/cache/packer.rs

//! Cache entry archive format.
//!
//! A gzip-compressed tar with, in order:
//!
//! - `METADATA`: [`OriginMetadata`] as JSON
//! - `MANIFEST`: [`OutputManifest`] as JSON
//! - per declared output, sorted by name:
//!   - `tree-<name>` for a file output, or
//!   - `tree-<name>` plus `tree-<name>/<rel>` entries for a directory, or
//!   - an empty `missing-tree-<name>` when the output did not exist.
//!
//! Headers carry no timestamps or owners, so equal outputs pack to equal
//! bytes.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::debug;

use super::CacheError;
use super::entry::{CacheEntry, ManifestEntry, ManifestFile, OriginMetadata, OutputKind, OutputManifest};
use crate::fingerprint::Fingerprint;
use crate::fs::{FileKind, FileSystem};
use crate::graph::OutputSpec;
use crate::hash::ContentHash;

pub const METADATA_ENTRY: &str = "METADATA";
pub const MANIFEST_ENTRY: &str = "MANIFEST";
const TREE_PREFIX: &str = "tree-";
const MISSING_PREFIX: &str = "missing-tree-";

/// One item below a directory output. `data` is `None` for directories.
struct TreeItem {
    rel: String,
    data: Option<Vec<u8>>,
}

enum Collected {
    Missing,
    File(Vec<u8>),
    Directory(Vec<TreeItem>),
}

/// Pack the current content of `outputs` into a cache entry.
pub fn pack(
    key: &Fingerprint,
    outputs: &[OutputSpec],
    origin: &OriginMetadata,
    fs: &dyn FileSystem,
) -> Result<CacheEntry, CacheError> {
    let mut sorted: Vec<&OutputSpec> = outputs.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut collected = Vec::with_capacity(sorted.len());
    let mut manifest = OutputManifest::default();
    for output in sorted {
        let content = collect_output(fs, &output.path)?;
        manifest
            .outputs
            .insert(output.name.clone(), manifest_entry(&content));
        collected.push((output.name.as_str(), content));
    }

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    append_file(&mut builder, METADATA_ENTRY, &serde_json::to_vec_pretty(origin)?)?;
    append_file(&mut builder, MANIFEST_ENTRY, &serde_json::to_vec_pretty(&manifest)?)?;

    for (name, content) in &collected {
        match content {
            Collected::Missing => {
                append_file(&mut builder, &format!("{MISSING_PREFIX}{name}"), &[])?;
            }
            Collected::File(data) => {
                append_file(&mut builder, &format!("{TREE_PREFIX}{name}"), data)?;
            }
            Collected::Directory(items) => {
                append_dir(&mut builder, &format!("{TREE_PREFIX}{name}"))?;
                for item in items {
                    let path = format!("{TREE_PREFIX}{name}/{}", item.rel);
                    match &item.data {
                        Some(data) => append_file(&mut builder, &path, data)?,
                        None => append_dir(&mut builder, &path)?,
                    }
                }
            }
        }
    }

    let packed = builder.into_inner()?.finish()?;
    debug!(key = %key, bytes = packed.len(), outputs = collected.len(), "packed cache entry");

    Ok(CacheEntry {
        key: *key,
        packed,
        manifest,
        origin: origin.clone(),
    })
}

fn collect_output(fs: &dyn FileSystem, path: &Path) -> Result<Collected, CacheError> {
    match fs.metadata(path)? {
        None => Ok(Collected::Missing),
        Some(stamp) if stamp.kind == FileKind::File => Ok(Collected::File(read_all(fs, path)?)),
        Some(_) => {
            let mut items = Vec::new();
            collect_dir(fs, path, "", &mut items, &mut Vec::new())?;
            Ok(Collected::Directory(items))
        }
    }
}

/// `ancestors` holds the resolved paths of the directories being walked.
fn collect_dir(
    fs: &dyn FileSystem,
    dir: &Path,
    prefix: &str,
    items: &mut Vec<TreeItem>,
    ancestors: &mut Vec<PathBuf>,
) -> Result<(), CacheError> {
    let resolved = fs.canonicalize(dir)?;
    if ancestors.contains(&resolved) {
        return Err(CacheError::Io(format!("cannot pack directory link cycle at {:?}", dir)));
    }
    ancestors.push(resolved);
    let result = collect_children(fs, dir, prefix, items, ancestors);
    ancestors.pop();
    result
}

fn collect_children(
    fs: &dyn FileSystem,
    dir: &Path,
    prefix: &str,
    items: &mut Vec<TreeItem>,
    ancestors: &mut Vec<PathBuf>,
) -> Result<(), CacheError> {
    let mut children = fs.read_dir(dir)?;
    children.sort();
    for child in children {
        let name = child
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CacheError::Io(format!("cannot pack non UTF-8 path {:?}", child)))?;
        let rel = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}/{name}")
        };
        match fs.metadata(&child)? {
            // Vanished while walking.
            None => continue,
            Some(stamp) if stamp.kind == FileKind::Directory => {
                items.push(TreeItem {
                    rel: rel.clone(),
                    data: None,
                });
                collect_dir(fs, &child, &rel, items, ancestors)?;
            }
            Some(_) => {
                let data = read_all(fs, &child)?;
                items.push(TreeItem { rel, data: Some(data) });
            }
        }
    }
    Ok(())
}

fn manifest_entry(content: &Collected) -> ManifestEntry {
    match content {
        Collected::Missing => ManifestEntry {
            kind: OutputKind::Missing,
            files: vec![],
            dirs: vec![],
        },
        Collected::File(data) => ManifestEntry {
            kind: OutputKind::File,
            files: vec![ManifestFile {
                path: String::new(),
                hash: ContentHash::of_bytes(data),
            }],
            dirs: vec![],
        },
        Collected::Directory(items) => {
            let mut files = Vec::new();
            let mut dirs = Vec::new();
            for item in items {
                match &item.data {
                    Some(data) => files.push(ManifestFile {
                        path: item.rel.clone(),
                        hash: ContentHash::of_bytes(data),
                    }),
                    None => dirs.push(item.rel.clone()),
                }
            }
            ManifestEntry {
                kind: OutputKind::Directory,
                files,
                dirs,
            }
        }
    }
}

fn read_all(fs: &dyn FileSystem, path: &Path) -> Result<Vec<u8>, CacheError> {
    let mut reader = fs.open_read(path)?;
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    Ok(data)
}

fn base_header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn append_file<W: Write>(builder: &mut tar::Builder<W>, path: &str, data: &[u8]) -> io::Result<()> {
    let mut header = base_header(tar::EntryType::Regular, 0o644, data.len() as u64);
    builder.append_data(&mut header, path, data)
}

fn append_dir<W: Write>(builder: &mut tar::Builder<W>, path: &str) -> io::Result<()> {
    let mut header = base_header(tar::EntryType::Directory, 0o755, 0);
    builder.append_data(&mut header, path, io::empty())
}

/// What the archive holds for one output, after verification.
enum Restore {
    Missing,
    File(Vec<u8>),
    Directory {
        dirs: Vec<String>,
        files: Vec<(String, Vec<u8>)>,
    },
}

#[derive(Default)]
struct RawTree {
    /// `tree-<name>` itself: `Some(data)` for a file, `None` for a directory.
    root: Option<Option<Vec<u8>>>,
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
}

/// Verify `archive` completely, then restore it into the declared outputs.
///
/// Nothing is written unless every entry checks out: unknown or unsafe
/// entry names, hash mismatches, missing files and an output set that
/// differs from `outputs` are all rejected up front.
pub fn unpack(
    key: &Fingerprint,
    archive: &[u8],
    outputs: &[OutputSpec],
    fs: &dyn FileSystem,
) -> Result<(OutputManifest, OriginMetadata), CacheError> {
    let corrupt = |reason: String| CacheError::integrity(key, reason);

    // Inflate fully first so the gzip checksum is always verified.
    let mut tar_bytes = Vec::new();
    GzDecoder::new(archive)
        .read_to_end(&mut tar_bytes)
        .map_err(|e| corrupt(format!("bad gzip stream: {e}")))?;

    let mut metadata: Option<OriginMetadata> = None;
    let mut manifest: Option<OutputManifest> = None;
    let mut missing: BTreeSet<String> = BTreeSet::new();
    let mut trees: BTreeMap<String, RawTree> = BTreeMap::new();

    let mut tar = tar::Archive::new(tar_bytes.as_slice());
    let entries = tar
        .entries()
        .map_err(|e| corrupt(format!("bad tar stream: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| corrupt(format!("bad tar entry: {e}")))?;
        let raw_path = entry
            .path()
            .map_err(|e| corrupt(format!("bad entry path: {e}")))?
            .into_owned();
        if raw_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(corrupt(format!("unsafe entry path {:?}", raw_path)));
        }
        let name = raw_path
            .to_str()
            .ok_or_else(|| corrupt(format!("non UTF-8 entry path {:?}", raw_path)))?
            .trim_end_matches('/')
            .to_string();

        let is_dir = match entry.header().entry_type() {
            tar::EntryType::Regular => false,
            tar::EntryType::Directory => true,
            other => return Err(corrupt(format!("unsupported entry type {other:?} for {name}"))),
        };
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| corrupt(format!("reading {name}: {e}")))?;

        if name == METADATA_ENTRY {
            metadata = Some(
                serde_json::from_slice(&data).map_err(|e| corrupt(format!("bad METADATA: {e}")))?,
            );
        } else if name == MANIFEST_ENTRY {
            manifest = Some(
                serde_json::from_slice(&data).map_err(|e| corrupt(format!("bad MANIFEST: {e}")))?,
            );
        } else if let Some(output) = name.strip_prefix(MISSING_PREFIX) {
            missing.insert(output.to_string());
        } else if let Some(rest) = name.strip_prefix(TREE_PREFIX) {
            let (output, rel) = rest.split_once('/').unwrap_or((rest, ""));
            if !rel.is_empty() && !is_safe_rel(rel) {
                return Err(corrupt(format!("unsafe entry path {name}")));
            }
            let tree = trees.entry(output.to_string()).or_default();
            match (rel.is_empty(), is_dir) {
                (true, true) => tree.root = Some(None),
                (true, false) => tree.root = Some(Some(data)),
                (false, true) => {
                    tree.dirs.insert(rel.to_string());
                }
                (false, false) => {
                    tree.files.insert(rel.to_string(), data);
                }
            }
        } else {
            return Err(corrupt(format!("unexpected entry {name}")));
        }
    }

    let origin = metadata.ok_or_else(|| corrupt("archive has no METADATA".to_string()))?;
    let manifest = manifest.ok_or_else(|| corrupt("archive has no MANIFEST".to_string()))?;

    let mut declared: Vec<String> = outputs.iter().map(|o| o.name.clone()).collect();
    declared.sort();
    let stored = manifest.names();
    if stored != declared {
        return Err(CacheError::ManifestMismatch {
            key: key.to_string(),
            stored,
            declared,
        });
    }
    if let Some(extra) = trees
        .keys()
        .chain(missing.iter())
        .find(|name| !manifest.outputs.contains_key(*name))
    {
        return Err(corrupt(format!("archive holds undeclared output {extra}")));
    }

    let mut plan: Vec<(PathBuf, Restore)> = Vec::with_capacity(outputs.len());
    for output in outputs {
        let Some(entry) = manifest.outputs.get(&output.name) else {
            continue;
        };
        let tree = trees.remove(&output.name);
        let restore = verify_output(&output.name, entry, tree, missing.contains(&output.name))
            .map_err(corrupt)?;
        plan.push((output.path.clone(), restore));
    }

    for (path, restore) in plan {
        fs.remove_all(&path)?;
        match restore {
            Restore::Missing => {}
            Restore::File(data) => fs.write(&path, &data)?,
            Restore::Directory { dirs, files } => {
                fs.create_dir_all(&path)?;
                for dir in dirs {
                    fs.create_dir_all(&join_rel(&path, &dir))?;
                }
                for (rel, data) in files {
                    fs.write(&join_rel(&path, &rel), &data)?;
                }
            }
        }
    }

    debug!(key = %key, task = %origin.task_id, "unpacked cache entry");
    Ok((manifest, origin))
}

/// Read only the `MANIFEST` of `archive`. Output content is not verified.
pub fn read_manifest(key: &Fingerprint, archive: &[u8]) -> Result<OutputManifest, CacheError> {
    let corrupt = |reason: String| CacheError::integrity(key, reason);
    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    let entries = tar
        .entries()
        .map_err(|e| corrupt(format!("bad tar stream: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| corrupt(format!("bad tar entry: {e}")))?;
        let is_manifest = entry
            .path()
            .map(|p| p == Path::new(MANIFEST_ENTRY))
            .unwrap_or(false);
        if !is_manifest {
            continue;
        }
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| corrupt(format!("reading {MANIFEST_ENTRY}: {e}")))?;
        return serde_json::from_slice(&data).map_err(|e| corrupt(format!("bad MANIFEST: {e}")));
    }
    Err(corrupt("archive has no MANIFEST".to_string()))
}

fn verify_output(name: &str, entry: &ManifestEntry, tree: Option<RawTree>, missing: bool) -> Result<Restore, String> {
    match entry.kind {
        OutputKind::Missing => {
            if !missing || tree.is_some() {
                return Err(format!("output {name} should be missing"));
            }
            Ok(Restore::Missing)
        }
        OutputKind::File => {
            let tree = tree.ok_or_else(|| format!("output {name} has no content"))?;
            let (Some(Some(data)), [file]) = (tree.root, entry.files.as_slice()) else {
                return Err(format!("output {name} is not a single file"));
            };
            if missing || !tree.files.is_empty() || !tree.dirs.is_empty() || !file.path.is_empty() {
                return Err(format!("output {name} is not a single file"));
            }
            check_hash(name, "", &data, &file.hash)?;
            Ok(Restore::File(data))
        }
        OutputKind::Directory => {
            let mut tree = tree.ok_or_else(|| format!("output {name} has no content"))?;
            if missing || !matches!(tree.root, Some(None)) {
                return Err(format!("output {name} is not a directory"));
            }
            let expected_dirs: BTreeSet<String> = entry.dirs.iter().cloned().collect();
            if expected_dirs != tree.dirs {
                return Err(format!("directory listing of output {name} does not match its manifest"));
            }
            if entry.files.len() != tree.files.len() {
                return Err(format!("file count of output {name} does not match its manifest"));
            }
            let mut files = Vec::with_capacity(entry.files.len());
            for file in &entry.files {
                let data = tree
                    .files
                    .remove(&file.path)
                    .ok_or_else(|| format!("output {name} is missing {}", file.path))?;
                check_hash(name, &file.path, &data, &file.hash)?;
                files.push((file.path.clone(), data));
            }
            Ok(Restore::Directory {
                dirs: entry.dirs.clone(),
                files,
            })
        }
    }
}

fn check_hash(name: &str, rel: &str, data: &[u8], expected: &ContentHash) -> Result<(), String> {
    let actual = ContentHash::of_bytes(data);
    if actual != *expected {
        return Err(format!(
            "hash mismatch for {name}/{rel}: manifest {expected}, content {actual}"
        ));
    }
    Ok(())
}

fn is_safe_rel(rel: &str) -> bool {
    rel.split('/')
        .all(|seg| !seg.is_empty() && seg != "." && seg != "..")
}

fn join_rel(root: &Path, rel: &str) -> PathBuf {
    rel.split('/').fold(root.to_path_buf(), |p, seg| p.join(seg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;
    use std::time::Duration;

    fn key() -> Fingerprint {
        Fingerprint::from_hash(ContentHash::of_bytes(b"key"))
    }

    fn origin() -> OriginMetadata {
        OriginMetadata {
            build_invocation_id: "b1".into(),
            task_id: "compile".into(),
            fingerprint: key().to_hex(),
            execution_time_ms: 12,
            created_at: "2024-01-01T00:00:00+00:00".into(),
            hostname: "host".into(),
        }
    }

    fn outputs() -> Vec<OutputSpec> {
        vec![
            OutputSpec::new("obj", "/p/out/main.o"),
            OutputSpec::new("classes", "/p/out/classes"),
            OutputSpec::new("log", "/p/out/build.log"),
        ]
    }

    fn populated_fs() -> MockFileSystem {
        let fs = MockFileSystem::new();
        fs.add_file("/p/out/main.o", "object code");
        fs.add_file("/p/out/classes/A.class", "A");
        fs.add_file("/p/out/classes/pkg/B.class", "B");
        fs.add_dir("/p/out/classes/empty");
        fs
    }

    #[test]
    fn restores_files_directories_and_missing_outputs() {
        let fs = populated_fs();
        let entry = pack(&key(), &outputs(), &origin(), &fs).unwrap();
        assert_eq!(entry.manifest.outputs["log"].kind, OutputKind::Missing);
        assert_eq!(entry.manifest.outputs["classes"].files.len(), 2);

        fs.remove_all(Path::new("/p/out")).unwrap();
        fs.add_file("/p/out/build.log", "stale log");
        fs.add_file("/p/out/classes/Stale.class", "old");

        let (manifest, restored_origin) = unpack(&key(), &entry.packed, &outputs(), &fs).unwrap();
        assert_eq!(manifest, entry.manifest);
        assert_eq!(restored_origin, origin());
        assert_eq!(fs.read_bytes(Path::new("/p/out/main.o")).unwrap(), b"object code");
        assert_eq!(fs.read_bytes(Path::new("/p/out/classes/pkg/B.class")).unwrap(), b"B");
        assert!(fs.is_dir(Path::new("/p/out/classes/empty")));
        assert!(!fs.exists(Path::new("/p/out/classes/Stale.class")));
        assert!(!fs.exists(Path::new("/p/out/build.log")));
    }

    #[test]
    fn packing_is_deterministic() {
        let fs = populated_fs();
        let a = pack(&key(), &outputs(), &origin(), &fs).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let b = pack(&key(), &outputs(), &origin(), &fs).unwrap();
        assert_eq!(a.packed, b.packed);
    }

    #[test]
    fn corrupt_archive_is_an_integrity_error_and_writes_nothing() {
        let fs = populated_fs();
        let mut packed = pack(&key(), &outputs(), &origin(), &fs).unwrap().packed;
        let mid = packed.len() / 2;
        packed[mid] ^= 0xff;

        fs.remove_all(Path::new("/p/out")).unwrap();
        let err = unpack(&key(), &packed, &outputs(), &fs).unwrap_err();
        assert!(err.is_integrity(), "{err}");
        assert!(!fs.exists(Path::new("/p/out/main.o")));
    }

    #[test]
    fn manifest_is_readable_without_restoring() {
        let fs = populated_fs();
        let entry = pack(&key(), &outputs(), &origin(), &fs).unwrap();
        assert_eq!(read_manifest(&key(), &entry.packed).unwrap(), entry.manifest);
        assert!(read_manifest(&key(), b"not gzip").unwrap_err().is_integrity());
    }

    #[cfg(unix)]
    #[test]
    fn directory_link_cycle_is_not_packed() {
        let dir = tempfile::tempdir().unwrap();
        let classes = dir.path().join("classes");
        std::fs::create_dir_all(&classes).unwrap();
        std::fs::write(classes.join("A.class"), "A").unwrap();
        std::os::unix::fs::symlink("../classes", classes.join("loop")).unwrap();

        let outputs = vec![OutputSpec::new("classes", classes)];
        let err = pack(&key(), &outputs, &origin(), &crate::fs::RealFileSystem).unwrap_err();
        assert!(!err.is_integrity());
        assert!(err.to_string().contains("link cycle"), "{err}");
    }

    #[test]
    fn different_output_names_are_a_manifest_mismatch() {
        let fs = populated_fs();
        let entry = pack(&key(), &outputs(), &origin(), &fs).unwrap();
        let declared = vec![OutputSpec::new("obj", "/p/out/main.o")];
        let err = unpack(&key(), &entry.packed, &declared, &fs).unwrap_err();
        assert!(matches!(err, CacheError::ManifestMismatch { .. }), "{err}");
    }

    #[test]
    fn unexpected_entries_are_rejected() {
        let manifest = OutputManifest::default();
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        append_file(&mut builder, METADATA_ENTRY, &serde_json::to_vec(&origin()).unwrap()).unwrap();
        append_file(&mut builder, MANIFEST_ENTRY, &serde_json::to_vec(&manifest).unwrap()).unwrap();
        append_file(&mut builder, "junk", b"x").unwrap();
        let packed = builder.into_inner().unwrap().finish().unwrap();

        let fs = MockFileSystem::new();
        let err = unpack(&key(), &packed, &[], &fs).unwrap_err();
        assert!(err.is_integrity());
        assert!(err.to_string().contains("unexpected entry junk"));
    }

    #[test]
    fn tampered_file_content_fails_hash_check() {
        let fs = MockFileSystem::new();
        fs.add_file("/p/a.txt", "real");
        let outputs = vec![OutputSpec::new("a", "/p/a.txt")];
        let mut manifest = OutputManifest::default();
        manifest.outputs.insert(
            "a".into(),
            ManifestEntry {
                kind: OutputKind::File,
                files: vec![ManifestFile {
                    path: String::new(),
                    hash: ContentHash::of_bytes(b"real"),
                }],
                dirs: vec![],
            },
        );
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        append_file(&mut builder, METADATA_ENTRY, &serde_json::to_vec(&origin()).unwrap()).unwrap();
        append_file(&mut builder, MANIFEST_ENTRY, &serde_json::to_vec(&manifest).unwrap()).unwrap();
        append_file(&mut builder, "tree-a", b"fake").unwrap();
        let packed = builder.into_inner().unwrap().finish().unwrap();

        let err = unpack(&key(), &packed, &outputs, &fs).unwrap_err();
        assert!(err.is_integrity());
        assert_eq!(fs.read_bytes(Path::new("/p/a.txt")).unwrap(), b"real");
    }
}
