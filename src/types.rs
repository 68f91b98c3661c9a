use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How much of an input's path participates in its fingerprint.
///
/// - `Absolute`: the full absolute path of every file.
/// - `Relative`: the path relative to the input root (a file root
///   contributes its file name).
/// - `NameOnly`: only the final path component.
/// - `None`: neither path nor content; used for pure side-effect inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathSensitivity {
    Absolute,
    Relative,
    NameOnly,
    None,
}

impl Default for PathSensitivity {
    fn default() -> Self {
        PathSensitivity::Relative
    }
}

impl PathSensitivity {
    pub fn as_str(self) -> &'static str {
        match self {
            PathSensitivity::Absolute => "absolute",
            PathSensitivity::Relative => "relative",
            PathSensitivity::NameOnly => "name_only",
            PathSensitivity::None => "none",
        }
    }
}

impl fmt::Display for PathSensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PathSensitivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "absolute" => Ok(PathSensitivity::Absolute),
            "relative" => Ok(PathSensitivity::Relative),
            "name_only" | "name-only" | "nameonly" => Ok(PathSensitivity::NameOnly),
            "none" => Ok(PathSensitivity::None),
            other => Err(format!(
                "invalid path sensitivity: {other} (expected \"absolute\", \"relative\", \"name_only\" or \"none\")"
            )),
        }
    }
}

/// Lifecycle of a task node within one build.
///
/// States only ever move forward:
/// `Pending -> Ready -> Running -> {Executed | FromCache | UpToDate | Failed}`,
/// and `Pending | Ready -> Skipped` when an upstream task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    UpToDate,
    FromCache,
    Executed,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::UpToDate
                | TaskState::FromCache
                | TaskState::Executed
                | TaskState::Failed
                | TaskState::Skipped
        )
    }

    /// Terminal states that count as a successful build.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            TaskState::UpToDate | TaskState::FromCache | TaskState::Executed | TaskState::Skipped
        )
    }

    fn rank(self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Ready => 1,
            TaskState::Running => 2,
            _ => 3,
        }
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            TaskState::Pending => false,
            TaskState::Ready => self == TaskState::Pending,
            TaskState::Running => self == TaskState::Ready,
            TaskState::Skipped => self.rank() < TaskState::Running.rank(),
            _ => self == TaskState::Running,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "PENDING",
            TaskState::Ready => "READY",
            TaskState::Running => "RUNNING",
            TaskState::UpToDate => "UP-TO-DATE",
            TaskState::FromCache => "FROM-CACHE",
            TaskState::Executed => "EXECUTED",
            TaskState::Failed => "FAILED",
            TaskState::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// `--build-cache=on|off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    On,
    Off,
}

impl Default for CacheMode {
    fn default() -> Self {
        CacheMode::On
    }
}

impl FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "on" | "true" => Ok(CacheMode::On),
            "off" | "false" => Ok(CacheMode::Off),
            other => Err(format!("invalid build cache mode: {other} (expected \"on\" or \"off\")")),
        }
    }
}

/// Where per-task execution history is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStorageMode {
    /// Persist to `<history_dir>/task-history` (survives between builds).
    File,
    /// Keep in memory only (every fresh process starts cold).
    Memory,
}

impl Default for HistoryStorageMode {
    fn default() -> Self {
        HistoryStorageMode::File
    }
}
