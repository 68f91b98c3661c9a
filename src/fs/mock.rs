// src/fs/mock.rs

use super::{FileKind, FileStamp, FileSystem};
use anyhow::{anyhow, Result};
use std::collections::{BTreeSet, HashMap};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub enum MockEntry {
    File { content: Vec<u8>, tick: u64 },
    Dir { children: BTreeSet<String>, tick: u64 },
}

#[derive(Debug, Default)]
struct MockState {
    entries: HashMap<PathBuf, MockEntry>,
    /// Logical clock standing in for mtimes.
    clock: u64,
}

/// In-memory filesystem for tests. Every write advances a logical clock so
/// stamps change exactly when contents are rewritten.
#[derive(Debug, Clone, Default)]
pub struct MockFileSystem {
    state: Arc<Mutex<MockState>>,
}

impl MockFileSystem {
    pub fn new() -> Self {
        let fs = Self::default();
        {
            let mut state = fs.lock();
            state.entries.insert(
                PathBuf::from("/"),
                MockEntry::Dir {
                    children: BTreeSet::new(),
                    tick: 0,
                },
            );
        }
        fs
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        let mut state = self.lock();
        state.clock += 1;
        let tick = state.clock;
        insert_file(&mut state, path.as_ref(), content.into(), tick);
    }

    /// Replace a file's bytes without touching its stamp, simulating a
    /// change the stamp check cannot see.
    pub fn set_file_preserving_stamp(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        let mut state = self.lock();
        let path = path.as_ref();
        let content = content.into();
        let tick = match state.entries.get(path) {
            Some(MockEntry::File { tick, .. }) => *tick,
            _ => 0,
        };
        insert_file(&mut state, path, content, tick);
    }

    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let mut state = self.lock();
        state.clock += 1;
        let tick = state.clock;
        ensure_dir(&mut state, path.as_ref(), tick);
    }

    pub fn read_bytes(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        match self.lock().entries.get(path.as_ref()) {
            Some(MockEntry::File { content, .. }) => Some(content.clone()),
            _ => None,
        }
    }
}

fn parent_of(path: &Path) -> Option<&Path> {
    match path.parent() {
        Some(p) if p.as_os_str().is_empty() => Some(Path::new(".")),
        other => other,
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(str::to_string)
}

fn link_into_parent(state: &mut MockState, path: &Path, tick: u64) {
    if let Some(parent) = parent_of(path) {
        if parent == path {
            return;
        }
        ensure_dir(state, parent, tick);
        if let (Some(MockEntry::Dir { children, .. }), Some(name)) =
            (state.entries.get_mut(parent), file_name(path))
        {
            children.insert(name);
        }
    }
}

fn ensure_dir(state: &mut MockState, path: &Path, tick: u64) {
    if matches!(state.entries.get(path), Some(MockEntry::Dir { .. })) {
        return;
    }
    state.entries.insert(
        path.to_path_buf(),
        MockEntry::Dir {
            children: BTreeSet::new(),
            tick,
        },
    );
    link_into_parent(state, path, tick);
}

fn insert_file(state: &mut MockState, path: &Path, content: Vec<u8>, tick: u64) {
    state
        .entries
        .insert(path.to_path_buf(), MockEntry::File { content, tick });
    link_into_parent(state, path, tick);
}

fn unlink_from_parent(state: &mut MockState, path: &Path) {
    if let Some(parent) = parent_of(path) {
        if let (Some(MockEntry::Dir { children, .. }), Some(name)) =
            (state.entries.get_mut(parent), file_name(path))
        {
            children.remove(&name);
        }
    }
}

impl FileSystem for MockFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        let state = self.lock();
        match state.entries.get(path) {
            Some(MockEntry::File { content, .. }) => {
                String::from_utf8(content.clone()).map_err(|e| anyhow!("Invalid UTF-8: {}", e))
            }
            Some(MockEntry::Dir { .. }) => Err(anyhow!("Is a directory: {:?}", path)),
            None => Err(anyhow!("File not found: {:?}", path)),
        }
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        let state = self.lock();
        match state.entries.get(path) {
            Some(MockEntry::File { content, .. }) => Ok(Box::new(Cursor::new(content.clone()))),
            Some(MockEntry::Dir { .. }) => Err(anyhow!("Is a directory: {:?}", path)),
            None => Err(anyhow!("File not found: {:?}", path)),
        }
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.add_file(path, contents);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.lock().entries.contains_key(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        matches!(self.lock().entries.get(path), Some(MockEntry::File { .. }))
    }

    fn is_dir(&self, path: &Path) -> bool {
        matches!(self.lock().entries.get(path), Some(MockEntry::Dir { .. }))
    }

    fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        // Tests use absolute paths throughout.
        Ok(path.to_path_buf())
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let state = self.lock();
        match state.entries.get(path) {
            Some(MockEntry::Dir { children, .. }) => {
                Ok(children.iter().map(|name| path.join(name)).collect())
            }
            _ => Err(anyhow!("Not a directory or not found: {:?}", path)),
        }
    }

    fn metadata(&self, path: &Path) -> Result<Option<FileStamp>> {
        let state = self.lock();
        Ok(state.entries.get(path).map(|entry| match entry {
            MockEntry::File { content, tick } => FileStamp {
                kind: FileKind::File,
                len: content.len() as u64,
                modified_nanos: *tick as u128,
            },
            MockEntry::Dir { children, tick } => FileStamp {
                kind: FileKind::Directory,
                len: children.len() as u64,
                modified_nanos: *tick as u128,
            },
        }))
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.add_dir(path);
        Ok(())
    }

    fn remove_all(&self, path: &Path) -> Result<()> {
        let mut state = self.lock();
        state.entries.retain(|p, _| !p.starts_with(path));
        unlink_from_parent(&mut state, path);
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut state = self.lock();
        if !state.entries.contains_key(from) {
            return Err(anyhow!("File not found: {:?}", from));
        }
        state.entries.retain(|p, _| !p.starts_with(to));
        let moved: Vec<(PathBuf, MockEntry)> = state
            .entries
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, e)| (p.clone(), e.clone()))
            .collect();
        for (old, entry) in moved {
            state.entries.remove(&old);
            let rel = old.strip_prefix(from).unwrap_or(Path::new(""));
            let new = if rel.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(rel)
            };
            state.entries.insert(new, entry);
        }
        unlink_from_parent(&mut state, from);
        state.clock += 1;
        let tick = state.clock;
        link_into_parent(&mut state, to, tick);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parents_are_created_and_listed() {
        let fs = MockFileSystem::new();
        fs.add_file("/proj/src/main.c", "int main() {}");
        assert!(fs.is_dir(Path::new("/proj/src")));
        assert_eq!(
            fs.read_dir(Path::new("/proj")).unwrap(),
            vec![PathBuf::from("/proj/src")]
        );
    }

    #[test]
    fn rewrite_changes_stamp_unless_preserved() {
        let fs = MockFileSystem::new();
        let path = Path::new("/a.txt");
        fs.add_file(path, "one");
        let first = fs.metadata(path).unwrap().unwrap();
        fs.add_file(path, "two");
        let second = fs.metadata(path).unwrap().unwrap();
        assert_ne!(first, second);

        fs.set_file_preserving_stamp(path, "six");
        assert_eq!(fs.metadata(path).unwrap().unwrap(), second);
        assert_eq!(fs.read_bytes(path).unwrap(), b"six");
    }

    #[test]
    fn rename_moves_subtrees() {
        let fs = MockFileSystem::new();
        fs.add_file("/tmp/x/a", "a");
        fs.rename(Path::new("/tmp/x"), Path::new("/out/y")).unwrap();
        assert!(!fs.exists(Path::new("/tmp/x/a")));
        assert_eq!(fs.read_bytes("/out/y/a").unwrap(), b"a");
        assert!(fs.read_dir(Path::new("/tmp")).unwrap().is_empty());
    }
}
