// src/graph/node.rs

//! Task declarations as registered by collaborators.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::action::TaskAction;
use crate::errors::GraphError;
use crate::types::PathSensitivity;

/// Stable task identity. Non-empty, no whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Result<Self, GraphError> {
        let id = id.into();
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(GraphError::InvalidTask {
                task: id,
                reason: "task ids must be non-empty and contain no whitespace".to_string(),
            });
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputValue {
    /// A file or directory. Relative paths are resolved against the project
    /// root when the task is registered.
    Path(PathBuf),
    /// A scalar property such as a compiler flag.
    Scalar(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    pub name: String,
    pub value: InputValue,
    pub sensitivity: PathSensitivity,
    /// Glob patterns (relative to a directory input) left out of the hash.
    pub exclude: Vec<String>,
}

impl InputSpec {
    pub fn path(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            value: InputValue::Path(path.into()),
            sensitivity: PathSensitivity::default(),
            exclude: Vec::new(),
        }
    }

    pub fn scalar(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: InputValue::Scalar(value.into()),
            sensitivity: PathSensitivity::default(),
            exclude: Vec::new(),
        }
    }

    pub fn with_sensitivity(mut self, sensitivity: PathSensitivity) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn excluding(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    pub fn path_value(&self) -> Option<&Path> {
        match &self.value {
            InputValue::Path(p) => Some(p),
            InputValue::Scalar(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    /// Logical name; also names the entry inside cache archives.
    pub name: String,
    pub path: PathBuf,
    pub sensitivity: PathSensitivity,
}

impl OutputSpec {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            sensitivity: PathSensitivity::default(),
        }
    }

    pub fn with_sensitivity(mut self, sensitivity: PathSensitivity) -> Self {
        self.sensitivity = sensitivity;
        self
    }
}

/// Output names end up as archive entry names.
pub(crate) fn valid_output_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Everything a collaborator supplies for one task.
#[derive(Clone)]
pub struct TaskDeclaration {
    pub id: TaskId,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
    pub depends_on: Vec<TaskId>,
    pub action: Arc<dyn TaskAction>,
    /// Named advisory locks held while the task runs.
    pub resources: Vec<String>,
    pub cacheable: bool,
}

impl TaskDeclaration {
    pub fn new(id: TaskId, action: impl TaskAction + 'static) -> Self {
        Self::with_shared_action(id, Arc::new(action))
    }

    pub fn with_shared_action(id: TaskId, action: Arc<dyn TaskAction>) -> Self {
        Self {
            id,
            inputs: Vec::new(),
            outputs: Vec::new(),
            depends_on: Vec::new(),
            action,
            resources: Vec::new(),
            cacheable: true,
        }
    }

    pub fn input(mut self, input: InputSpec) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn inputs(mut self, inputs: impl IntoIterator<Item = InputSpec>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn output(mut self, output: OutputSpec) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn outputs(mut self, outputs: impl IntoIterator<Item = OutputSpec>) -> Self {
        self.outputs.extend(outputs);
        self
    }

    pub fn depends_on(mut self, dep: TaskId) -> Self {
        self.depends_on.push(dep);
        self
    }

    pub fn resource(mut self, name: impl Into<String>) -> Self {
        self.resources.push(name.into());
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// Build a standalone node without registering it anywhere.
    pub fn into_node(self) -> TaskNode {
        TaskNode {
            id: self.id,
            inputs: self.inputs,
            outputs: self.outputs,
            depends_on: self.depends_on,
            action: self.action,
            resources: self.resources,
            cacheable: self.cacheable,
        }
    }
}

impl fmt::Debug for TaskDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDeclaration")
            .field("id", &self.id)
            .field("action", &self.action.identity())
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}

/// Immutable node stored in the graph arena. Mutable state lives in the
/// scheduler, never here.
#[derive(Clone)]
pub struct TaskNode {
    pub id: TaskId,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
    pub depends_on: Vec<TaskId>,
    pub action: Arc<dyn TaskAction>,
    pub resources: Vec<String>,
    pub cacheable: bool,
}

impl TaskNode {
    pub fn has_outputs(&self) -> bool {
        !self.outputs.is_empty()
    }

    /// Output names, sorted.
    pub fn output_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.outputs.iter().map(|o| o.name.clone()).collect();
        names.sort();
        names
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("action", &self.action.identity())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("depends_on", &self.depends_on)
            .field("resources", &self.resources)
            .field("cacheable", &self.cacheable)
            .finish()
    }
}
