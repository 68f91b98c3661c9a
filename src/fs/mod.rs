// src/fs/mod.rs

use std::fmt::Debug;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};

pub mod mock;

/// File or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    File,
    Directory,
}

/// Cheap change detector for a path: kind, size and modification time.
///
/// Two equal stamps are taken to mean "content unchanged".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileStamp {
    pub kind: FileKind,
    pub len: u64,
    pub modified_nanos: u128,
}

/// Abstract filesystem interface.
pub trait FileSystem: Send + Sync + Debug {
    fn read_to_string(&self, path: &Path) -> Result<String>;
    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>>;
    /// Write `contents`, creating parent directories as needed.
    fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn is_file(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    fn canonicalize(&self, path: &Path) -> Result<PathBuf>;

    /// Target of the symbolic link at `path`, or `None` if `path` is not a
    /// link. Filesystems without links keep the default.
    fn read_link(&self, _path: &Path) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    /// Return a list of entries in a directory.
    /// Returns full paths.
    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Stamp of `path`, or `None` if nothing exists there.
    fn metadata(&self, path: &Path) -> Result<Option<FileStamp>>;

    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Remove a file or a whole directory tree. Missing paths are not an error.
    fn remove_all(&self, path: &Path) -> Result<()>;

    /// Atomically move `from` to `to`, replacing any file at `to`.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
}

/// Implementation that uses `std::fs`.
#[derive(Debug, Clone, Default)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).with_context(|| format!("reading file {:?}", path))
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        let file = fs::File::open(path).with_context(|| format!("opening file {:?}", path))?;
        Ok(Box::new(file))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating dir {:?}", parent))?;
        }
        let mut file = fs::File::create(path).with_context(|| format!("creating file {:?}", path))?;
        file.write_all(contents).with_context(|| format!("writing to file {:?}", path))?;
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        fs::canonicalize(path).with_context(|| format!("canonicalizing {:?}", path))
    }

    fn read_link(&self, path: &Path) -> Result<Option<PathBuf>> {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_symlink() => fs::read_link(path)
                .map(Some)
                .with_context(|| format!("reading link {:?}", path)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading metadata of {:?}", path)),
        }
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).with_context(|| format!("reading dir {:?}", path))? {
            let entry = entry?;
            entries.push(entry.path());
        }
        Ok(entries)
    }

    fn metadata(&self, path: &Path) -> Result<Option<FileStamp>> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading metadata of {:?}", path)),
        };
        let kind = if meta.is_dir() {
            FileKind::Directory
        } else {
            FileKind::File
        };
        let modified_nanos = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Ok(Some(FileStamp {
            kind,
            len: meta.len(),
            modified_nanos,
        }))
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).with_context(|| format!("creating dir {:?}", path))
    }

    fn remove_all(&self, path: &Path) -> Result<()> {
        let result = match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {:?}", path)),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating dir {:?}", parent))?;
        }
        fs::rename(from, to).with_context(|| format!("renaming {:?} to {:?}", from, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_of_missing_path_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFileSystem;
        assert_eq!(fs.metadata(&dir.path().join("nope")).unwrap(), None);
    }

    #[test]
    fn remove_all_handles_files_dirs_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFileSystem;
        let nested = dir.path().join("out/a/b.txt");
        fs.write(&nested, b"x").unwrap();

        fs.remove_all(&dir.path().join("out")).unwrap();
        assert!(!fs.exists(&dir.path().join("out")));
        fs.remove_all(&dir.path().join("out")).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn read_link_reports_only_links() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFileSystem;
        let file = dir.path().join("f");
        fs.write(&file, b"x").unwrap();
        std::os::unix::fs::symlink("f", dir.path().join("l")).unwrap();

        assert_eq!(fs.read_link(&dir.path().join("l")).unwrap(), Some(PathBuf::from("f")));
        assert_eq!(fs.read_link(&file).unwrap(), None);
        assert_eq!(fs.read_link(&dir.path().join("nope")).unwrap(), None);
    }

    #[test]
    fn stamp_tracks_size() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFileSystem;
        let file = dir.path().join("f");
        fs.write(&file, b"one").unwrap();
        let a = fs.metadata(&file).unwrap().unwrap();
        fs.write(&file, b"three").unwrap();
        let b = fs.metadata(&file).unwrap().unwrap();
        assert_eq!(a.kind, FileKind::File);
        assert_ne!(a, b);
    }
}
