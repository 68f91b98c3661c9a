#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use kiln::config::{BuildFile, BuildSection, InputConfig, OutputConfig, RawBuildFile, RemoteSection, TaskConfig};
use kiln::types::CacheMode;

/// Builder for `BuildFile` to simplify test setup.
pub struct BuildFileBuilder {
    file: RawBuildFile,
}

impl BuildFileBuilder {
    pub fn new() -> Self {
        Self {
            file: RawBuildFile {
                build: BuildSection::default(),
                task: BTreeMap::new(),
            },
        }
    }

    pub fn with_task(mut self, name: &str, task: TaskConfig) -> Self {
        self.file.task.insert(name.to_string(), task);
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.file.build.max_workers = Some(n);
        self
    }

    pub fn build_cache(mut self, mode: CacheMode) -> Self {
        self.file.build.build_cache = Some(mode);
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.file.build.cache_dir = Some(dir.into());
        self
    }

    pub fn remote(mut self, url: &str, push: bool) -> Self {
        self.file.build.remote = Some(RemoteSection {
            url: url.to_string(),
            push,
            timeout: None,
            username: None,
            password: None,
        });
        self
    }

    /// The unvalidated file, for tests that expect validation to fail.
    pub fn raw(self) -> RawBuildFile {
        self.file
    }

    pub fn build(self) -> BuildFile {
        BuildFile::try_from(self.file).expect("Failed to build valid build file from builder")
    }
}

impl Default for BuildFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for one `[task.<id>]` section.
pub struct TaskSpecBuilder {
    task: TaskConfig,
}

impl TaskSpecBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            task: TaskConfig {
                cmd: cmd.to_string(),
                inputs: vec![],
                properties: BTreeMap::new(),
                outputs: BTreeMap::new(),
                after: vec![],
                resources: vec![],
                cacheable: true,
            },
        }
    }

    pub fn input(mut self, path: &str) -> Self {
        self.task.inputs.push(InputConfig::Path(path.to_string()));
        self
    }

    pub fn named_input(mut self, name: &str, path: &str, sensitivity: Option<&str>) -> Self {
        self.task.inputs.push(InputConfig::Detailed {
            name: Some(name.to_string()),
            path: path.to_string(),
            sensitivity: sensitivity.map(str::to_string),
            exclude: vec![],
        });
        self
    }

    pub fn property(mut self, name: &str, value: &str) -> Self {
        self.task.properties.insert(name.to_string(), value.to_string());
        self
    }

    pub fn output(mut self, name: &str, path: &str) -> Self {
        self.task
            .outputs
            .insert(name.to_string(), OutputConfig::Path(path.to_string()));
        self
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.task.after.push(dep.to_string());
        self
    }

    pub fn resource(mut self, name: &str) -> Self {
        self.task.resources.push(name.to_string());
        self
    }

    pub fn cacheable(mut self, val: bool) -> Self {
        self.task.cacheable = val;
        self
    }

    pub fn build(self) -> TaskConfig {
        self.task
    }
}
