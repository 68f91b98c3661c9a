// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::types::{CacheMode, HistoryStorageMode, PathSensitivity};

/// Top-level build file as read from TOML, before validation.
///
/// ```toml
/// [build]
/// max_workers = 4
/// build_cache = "on"
///
/// [build.remote]
/// url = "https://cache.example.com"
/// push = true
/// timeout = "10s"
///
/// [task.compile]
/// cmd = "cc -c src/main.c -o out/main.o"
/// inputs = ["src/main.c", { name = "headers", path = "include", sensitivity = "name_only" }]
/// properties = { opt = "-O2" }
/// outputs = { obj = "out/main.o" }
///
/// [task.link]
/// cmd = "cc out/main.o -o out/app"
/// inputs = ["out/main.o"]
/// outputs = { app = "out/app" }
/// after = ["compile"]
/// ```
///
/// All sections are optional. Use [`BuildFile`] (via `TryFrom`) for the
/// validated form.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBuildFile {
    #[serde(default)]
    pub build: BuildSection,

    /// Tasks from `[task.<id>]`, keyed by task id.
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,
}

/// A build file that passed validation.
#[derive(Debug, Clone)]
pub struct BuildFile {
    pub build: BuildSection,
    pub task: BTreeMap<String, TaskConfig>,
}

impl BuildFile {
    /// Internal constructor used by the validator.
    pub(crate) fn new_unchecked(build: BuildSection, task: BTreeMap<String, TaskConfig>) -> Self {
        Self { build, task }
    }
}

/// `[build]` section. Every field falls back to a built-in default, and
/// environment variables and CLI flags override it (see
/// [`BuildSettings::resolve`](crate::config::BuildSettings::resolve)).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildSection {
    #[serde(default)]
    pub max_workers: Option<usize>,

    /// `"on"` or `"off"`.
    #[serde(default)]
    pub build_cache: Option<CacheMode>,

    #[serde(default)]
    pub offline: Option<bool>,

    #[serde(default)]
    pub continue_on_failure: Option<bool>,

    /// Relative paths are resolved against the project root.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    #[serde(default)]
    pub history_dir: Option<PathBuf>,

    /// `"file"` (default) or `"memory"`.
    #[serde(default)]
    pub history_storage: Option<HistoryStorageMode>,

    /// Duration string such as `"5s"`.
    #[serde(default)]
    pub cancel_grace: Option<String>,

    /// Re-hash files on every stamp-cache hit.
    #[serde(default)]
    pub verify_snapshots: Option<bool>,

    /// Attach a filesystem change feed while building.
    #[serde(default)]
    pub watch_changes: Option<bool>,

    #[serde(default)]
    pub remote: Option<RemoteSection>,
}

/// `[build.remote]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSection {
    pub url: String,

    /// Upload fresh entries. Pull-only when `false`.
    #[serde(default)]
    pub push: bool,

    /// Per-call timeout, e.g. `"10s"`.
    #[serde(default)]
    pub timeout: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

/// `[task.<id>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    /// Shell command, run from the project root.
    pub cmd: String,

    #[serde(default)]
    pub inputs: Vec<InputConfig>,

    /// Scalar inputs (`properties = { opt = "-O2" }`).
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    /// Output name to path.
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputConfig>,

    /// This task runs after every task listed here.
    #[serde(default)]
    pub after: Vec<String>,

    /// Named locks held while the task runs.
    #[serde(default)]
    pub resources: Vec<String>,

    #[serde(default = "default_cacheable")]
    pub cacheable: bool,
}

fn default_cacheable() -> bool {
    true
}

/// A file input: either a bare path or a table.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InputConfig {
    Path(String),
    Detailed {
        /// Defaults to the path itself.
        #[serde(default)]
        name: Option<String>,
        path: String,
        /// One of `absolute`, `relative`, `name_only`, `none`.
        #[serde(default)]
        sensitivity: Option<String>,
        #[serde(default)]
        exclude: Vec<String>,
    },
}

impl InputConfig {
    pub fn name(&self) -> &str {
        match self {
            InputConfig::Path(path) => path,
            InputConfig::Detailed { name, path, .. } => name.as_deref().unwrap_or(path),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            InputConfig::Path(path) => path,
            InputConfig::Detailed { path, .. } => path,
        }
    }

    pub fn sensitivity(&self) -> Option<&str> {
        match self {
            InputConfig::Path(_) => None,
            InputConfig::Detailed { sensitivity, .. } => sensitivity.as_deref(),
        }
    }

    pub fn exclude(&self) -> &[String] {
        match self {
            InputConfig::Path(_) => &[],
            InputConfig::Detailed { exclude, .. } => exclude,
        }
    }

    /// Effective sensitivity. Only meaningful after validation.
    pub fn effective_sensitivity(&self) -> PathSensitivity {
        self.sensitivity()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

/// An output: either a bare path or `{ path, sensitivity }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OutputConfig {
    Path(String),
    Detailed {
        path: String,
        #[serde(default)]
        sensitivity: Option<String>,
    },
}

impl OutputConfig {
    pub fn path(&self) -> &str {
        match self {
            OutputConfig::Path(path) => path,
            OutputConfig::Detailed { path, .. } => path,
        }
    }

    pub fn sensitivity(&self) -> Option<&str> {
        match self {
            OutputConfig::Path(_) => None,
            OutputConfig::Detailed { sensitivity, .. } => sensitivity.as_deref(),
        }
    }

    pub fn effective_sensitivity(&self) -> PathSensitivity {
        self.sensitivity()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}
