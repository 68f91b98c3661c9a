// src/config/mod.rs

//! Build file loading, validation and settings resolution.
//!
//! - `model.rs`: the TOML data model (`Kiln.toml`).
//! - `loader.rs`: read a build file from disk.
//! - `validate.rs`: semantic checks (`RawBuildFile` -> `BuildFile`).
//! - `tasks.rs`: `[task.<id>]` sections as task declarations.
//! - `settings.rs`: layer defaults, `[build]`, environment and CLI flags
//!   into [`BuildSettings`].

pub mod loader;
pub mod model;
pub mod settings;
pub mod tasks;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, project_root, DEFAULT_BUILD_FILE};
pub use model::{BuildFile, BuildSection, InputConfig, OutputConfig, RawBuildFile, RemoteSection, TaskConfig};
pub use settings::{parse_duration, BuildSettings, CliOverrides, RemoteSettings};
pub use tasks::declarations;
