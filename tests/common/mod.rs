#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln::build::BuildSession;
use kiln::config::BuildSettings;
use tempfile::TempDir;

/// A scratch project directory with kiln state under `.kiln/`.
pub struct Project {
    dir: TempDir,
}

impl Project {
    pub fn new() -> Self {
        kiln_test_utils::init_tracing();
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn read(&self, rel: &str) -> Option<String> {
        std::fs::read_to_string(self.path(rel)).ok()
    }

    pub fn remove(&self, rel: &str) {
        let path = self.path(rel);
        if path.is_dir() {
            std::fs::remove_dir_all(path).unwrap();
        } else if path.exists() {
            std::fs::remove_file(path).unwrap();
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.path(".kiln/cache")
    }

    pub fn settings(&self) -> BuildSettings {
        let mut settings = BuildSettings::defaults(self.root());
        settings.max_workers = 4;
        settings.cancel_grace = Duration::from_secs(2);
        settings
    }

    pub fn session(&self) -> BuildSession {
        self.session_with(self.settings())
    }

    pub fn session_with(&self, settings: BuildSettings) -> BuildSession {
        BuildSession::new(self.root(), settings)
    }
}
