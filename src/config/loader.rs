// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{BuildFile, RawBuildFile};
use crate::errors::Result;

/// File name looked up when `--config` is not given.
pub const DEFAULT_BUILD_FILE: &str = "Kiln.toml";

/// Read and deserialize a build file without semantic validation. Use
/// [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawBuildFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    parse_str(&contents)
}

pub fn parse_str(contents: &str) -> Result<RawBuildFile> {
    let raw: RawBuildFile = toml::from_str(contents)?;
    Ok(raw)
}

/// Load a build file and validate it:
///
/// - at least one task,
/// - known, non-self `after` references and an acyclic task graph,
/// - valid path sensitivities, durations and worker count.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<BuildFile> {
    let raw = load_from_path(&path)?;
    BuildFile::try_from(raw)
}

pub fn default_build_file_path() -> PathBuf {
    PathBuf::from(DEFAULT_BUILD_FILE)
}

/// Directory that relative paths in `build_file` are resolved against: its
/// parent, or the current directory for a bare file name.
pub fn project_root(build_file: &Path) -> PathBuf {
    match build_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::KilnError;
    use std::io::Write;

    #[test]
    fn loads_and_validates_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[task.compile]
cmd = "echo compile"
outputs = {{ obj = "out/main.o" }}

[task.link]
cmd = "echo link"
after = ["compile"]
"#
        )
        .unwrap();

        let cfg = load_and_validate(file.path()).unwrap();
        assert_eq!(cfg.task.len(), 2);
        assert_eq!(cfg.task["link"].after, vec!["compile".to_string()]);
        assert!(cfg.task["compile"].cacheable);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_and_validate("/definitely/not/here/Kiln.toml").unwrap_err();
        assert!(matches!(err, KilnError::IoError(_)));
    }

    #[test]
    fn bad_toml_is_a_toml_error() {
        let err = parse_str("[task.a\ncmd = 1").unwrap_err();
        assert!(matches!(err, KilnError::TomlError(_)));
    }

    #[test]
    fn project_root_of_bare_name_is_cwd() {
        assert_eq!(
            project_root(Path::new("Kiln.toml")),
            std::env::current_dir().unwrap()
        );
        assert_eq!(project_root(Path::new("proj/Kiln.toml")), PathBuf::from("proj"));
    }
}
