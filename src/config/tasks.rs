// src/config/tasks.rs

//! Turns `[task.<id>]` sections into task declarations.

use crate::action::ShellAction;
use crate::config::model::{BuildFile, TaskConfig};
use crate::errors::Result;
use crate::graph::{InputSpec, OutputSpec, TaskDeclaration, TaskId};

/// One declaration per task, each running its `cmd` through [`ShellAction`].
pub fn declarations(file: &BuildFile) -> Result<Vec<TaskDeclaration>> {
    file.task
        .iter()
        .map(|(name, task)| declaration(name, task))
        .collect()
}

fn declaration(name: &str, task: &TaskConfig) -> Result<TaskDeclaration> {
    let mut decl = TaskDeclaration::new(TaskId::new(name)?, ShellAction::new(task.cmd.clone()))
        .cacheable(task.cacheable);

    for input in &task.inputs {
        let mut spec = InputSpec::path(input.name(), input.path())
            .with_sensitivity(input.effective_sensitivity());
        for pattern in input.exclude() {
            spec = spec.excluding(pattern.clone());
        }
        decl = decl.input(spec);
    }
    for (key, value) in &task.properties {
        decl = decl.input(InputSpec::scalar(key.clone(), value.clone()));
    }
    for (output, spec) in &task.outputs {
        decl = decl.output(OutputSpec::new(output.clone(), spec.path()).with_sensitivity(spec.effective_sensitivity()));
    }
    for dep in &task.after {
        decl = decl.depends_on(TaskId::new(dep.clone())?);
    }
    for resource in &task.resources {
        decl = decl.resource(resource.clone());
    }
    Ok(decl)
}
