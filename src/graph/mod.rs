// src/graph/mod.rs

//! The task graph: registration API and plan construction.
//!
//! - [`node`] holds task declarations and their input/output specs.
//! - [`plan`] validates the graph (unknown dependencies, cycles) and builds
//!   the immutable [`ExecutionPlan`] the scheduler runs.

pub mod node;
pub mod plan;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::action::TaskAction;
use crate::errors::GraphError;
use crate::fingerprint::compile_excludes;

pub use node::{InputSpec, InputValue, OutputSpec, TaskDeclaration, TaskId, TaskNode};
pub use plan::ExecutionPlan;

/// Collects task declarations until [`plan`](TaskGraph::plan) seals it.
#[derive(Debug)]
pub struct TaskGraph {
    root: PathBuf,
    nodes: Vec<Arc<TaskNode>>,
    ids: HashSet<TaskId>,
    plan: Option<Arc<ExecutionPlan>>,
}

impl TaskGraph {
    /// `root` anchors relative input and output paths.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            nodes: Vec::new(),
            ids: HashSet::new(),
            plan: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_sealed(&self) -> bool {
        self.plan.is_some()
    }

    /// `registerTask(id, inputs, outputs, dependsOn, action)`.
    pub fn register_task(
        &mut self,
        id: &str,
        inputs: Vec<InputSpec>,
        outputs: Vec<OutputSpec>,
        depends_on: &[&str],
        action: impl TaskAction + 'static,
    ) -> Result<(), GraphError> {
        let mut decl = TaskDeclaration::new(TaskId::new(id)?, action)
            .inputs(inputs)
            .outputs(outputs);
        for dep in depends_on {
            decl = decl.depends_on(TaskId::new(*dep)?);
        }
        self.register(decl)
    }

    /// Register a full declaration. Dependencies may name tasks that are
    /// registered later; they are resolved by `plan()`.
    pub fn register(&mut self, decl: TaskDeclaration) -> Result<(), GraphError> {
        if self.is_sealed() {
            return Err(GraphError::RegistrationClosed);
        }
        if self.ids.contains(&decl.id) {
            return Err(GraphError::DuplicateTask(decl.id.to_string()));
        }
        validate_declaration(&decl)?;

        let node = self.resolve(decl);
        debug!(task = %node.id, deps = node.depends_on.len(), "registered task");
        self.ids.insert(node.id.clone());
        self.nodes.push(Arc::new(node));
        Ok(())
    }

    fn resolve(&self, decl: TaskDeclaration) -> TaskNode {
        let mut node = decl.into_node();
        for input in &mut node.inputs {
            if let InputValue::Path(path) = &mut input.value {
                *path = self.root.join(&*path);
            }
        }
        for output in &mut node.outputs {
            output.path = self.root.join(&output.path);
        }
        node
    }

    /// Validate the graph and freeze it. Calling again returns the same plan.
    pub fn plan(&mut self) -> Result<Arc<ExecutionPlan>, GraphError> {
        if let Some(plan) = &self.plan {
            return Ok(Arc::clone(plan));
        }
        let plan = Arc::new(ExecutionPlan::build(self.nodes.clone())?);
        self.plan = Some(Arc::clone(&plan));
        Ok(plan)
    }
}

fn validate_declaration(decl: &TaskDeclaration) -> Result<(), GraphError> {
    let invalid = |reason: String| GraphError::InvalidTask {
        task: decl.id.to_string(),
        reason,
    };

    let mut input_names = HashSet::new();
    for input in &decl.inputs {
        if !input_names.insert(input.name.as_str()) {
            return Err(invalid(format!("input '{}' is declared twice", input.name)));
        }
        if let Err(e) = compile_excludes(&input.exclude) {
            return Err(invalid(format!("input '{}': {e}", input.name)));
        }
    }

    let mut output_names = HashSet::new();
    for output in &decl.outputs {
        if !node::valid_output_name(&output.name) {
            return Err(invalid(format!(
                "output name '{}' may only contain letters, digits, '.', '_' and '-'",
                output.name
            )));
        }
        if !output_names.insert(output.name.as_str()) {
            return Err(invalid(format!("output '{}' is declared twice", output.name)));
        }
    }
    Ok(())
}
