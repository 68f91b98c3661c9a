// src/config/validate.rs

use std::collections::HashSet;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{BuildFile, RawBuildFile, TaskConfig};
use crate::config::settings::parse_duration;
use crate::errors::{GraphError, KilnError, Result};
use crate::types::PathSensitivity;

impl TryFrom<RawBuildFile> for BuildFile {
    type Error = KilnError;

    fn try_from(raw: RawBuildFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_build_file(&raw)?;
        Ok(BuildFile::new_unchecked(raw.build, raw.task))
    }
}

fn validate_raw_build_file(cfg: &RawBuildFile) -> Result<()> {
    ensure_has_tasks(cfg)?;
    validate_build_section(cfg)?;
    for (name, task) in cfg.task.iter() {
        validate_task(name, task)?;
    }
    validate_task_dependencies(cfg)?;
    validate_dag(cfg)?;
    Ok(())
}

fn ensure_has_tasks(cfg: &RawBuildFile) -> Result<()> {
    if cfg.task.is_empty() {
        return Err(KilnError::ConfigError(
            "build file must contain at least one [task.<id>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_build_section(cfg: &RawBuildFile) -> Result<()> {
    let build = &cfg.build;
    if build.max_workers == Some(0) {
        return Err(KilnError::ConfigError(
            "[build].max_workers must be >= 1 (got 0)".to_string(),
        ));
    }
    if let Some(grace) = &build.cancel_grace {
        parse_duration(grace)
            .map_err(|e| KilnError::ConfigError(format!("[build].cancel_grace: {e}")))?;
    }
    if let Some(remote) = &build.remote {
        if remote.url.trim().is_empty() {
            return Err(KilnError::ConfigError(
                "[build.remote].url must not be empty".to_string(),
            ));
        }
        if let Some(timeout) = &remote.timeout {
            parse_duration(timeout)
                .map_err(|e| KilnError::ConfigError(format!("[build.remote].timeout: {e}")))?;
        }
    }
    Ok(())
}

fn validate_task(name: &str, task: &TaskConfig) -> Result<()> {
    if task.cmd.trim().is_empty() {
        return Err(KilnError::ConfigError(format!("task '{name}' has an empty `cmd`")));
    }

    let mut input_names = HashSet::new();
    for input in &task.inputs {
        if let Some(s) = input.sensitivity() {
            s.parse::<PathSensitivity>()
                .map_err(|e| KilnError::ConfigError(format!("task '{name}', input '{}': {e}", input.name())))?;
        }
        if !input_names.insert(input.name()) {
            return Err(KilnError::ConfigError(format!(
                "task '{name}' declares input '{}' more than once",
                input.name()
            )));
        }
    }
    for property in task.properties.keys() {
        if !input_names.insert(property.as_str()) {
            return Err(KilnError::ConfigError(format!(
                "task '{name}' uses '{property}' both as an input and a property"
            )));
        }
    }
    for (output, spec) in &task.outputs {
        if let Some(s) = spec.sensitivity() {
            s.parse::<PathSensitivity>()
                .map_err(|e| KilnError::ConfigError(format!("task '{name}', output '{output}': {e}")))?;
        }
    }
    Ok(())
}

fn validate_task_dependencies(cfg: &RawBuildFile) -> Result<()> {
    for (name, task) in cfg.task.iter() {
        for dep in task.after.iter() {
            if dep == name {
                return Err(KilnError::ConfigError(format!(
                    "task '{}' cannot depend on itself in `after`",
                    name
                )));
            }
            if !cfg.task.contains_key(dep) {
                return Err(KilnError::Graph(GraphError::UnknownDependency {
                    task: name.clone(),
                    dependency: dep.clone(),
                }));
            }
        }
    }
    Ok(())
}

fn validate_dag(cfg: &RawBuildFile) -> Result<()> {
    // Edge direction: dep -> task.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for name in cfg.task.keys() {
        graph.add_node(name.as_str());
    }
    for (name, task) in cfg.task.iter() {
        for dep in task.after.iter() {
            graph.add_edge(dep.as_str(), name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(KilnError::Graph(GraphError::Cycle {
            path: cycle_through(&graph, cycle.node_id()),
        })),
    }
}

/// A cycle that starts and ends at `start`, which must lie on one.
fn cycle_through<'a>(graph: &DiGraphMap<&'a str, ()>, start: &'a str) -> Vec<String> {
    fn walk<'a>(
        graph: &DiGraphMap<&'a str, ()>,
        current: &'a str,
        start: &str,
        seen: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> bool {
        let mut next: Vec<&str> = graph.neighbors(current).collect();
        next.sort();
        for n in next {
            if n == start {
                return true;
            }
            if seen.insert(n) {
                path.push(n);
                if walk(graph, n, start, seen, path) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    let mut path = vec![start];
    let mut seen = HashSet::from([start]);
    walk(graph, start, start, &mut seen, &mut path);
    path.push(start);
    path.into_iter().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use crate::config::loader::parse_str;
    use crate::config::model::BuildFile;
    use crate::errors::{GraphError, KilnError};

    fn validate(toml: &str) -> Result<BuildFile, KilnError> {
        BuildFile::try_from(parse_str(toml)?)
    }

    #[test]
    fn empty_task_set_is_rejected() {
        let err = validate("[build]\nmax_workers = 2\n").unwrap_err();
        assert!(err.to_string().contains("at least one [task.<id>]"));
    }

    #[test]
    fn unknown_after_reference_is_a_graph_error() {
        let err = validate(
            r#"
[task.b]
cmd = "echo b"
after = ["a"]
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            KilnError::Graph(GraphError::UnknownDependency { ref task, ref dependency })
                if task == "b" && dependency == "a"
        ));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let err = validate("[task.a]\ncmd = \"x\"\nafter = [\"a\"]\n").unwrap_err();
        assert!(err.to_string().contains("cannot depend on itself"));
    }

    #[test]
    fn cycles_report_the_full_path() {
        let err = validate(
            r#"
[task.a]
cmd = "a"
after = ["c"]

[task.b]
cmd = "b"
after = ["a"]

[task.c]
cmd = "c"
after = ["b"]

[task.d]
cmd = "d"
"#,
        )
        .unwrap_err();
        let KilnError::Graph(GraphError::Cycle { path }) = &err else {
            panic!("expected a cycle error, got {err:?}");
        };
        assert_eq!(path.len(), 4);
        assert_eq!(path.first(), path.last());
        for task in ["a", "b", "c"] {
            assert!(path.iter().any(|p| p == task), "{path:?}");
        }
        assert!(!path.iter().any(|p| p == "d"));
    }

    #[test]
    fn bad_sensitivity_and_duration_are_rejected() {
        let err = validate(
            r#"
[task.a]
cmd = "a"
inputs = [{ path = "src", sensitivity = "sideways" }]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid path sensitivity"));

        let err = validate("[build]\ncancel_grace = \"soon\"\n[task.a]\ncmd = \"a\"\n").unwrap_err();
        assert!(err.to_string().contains("cancel_grace"));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = validate("[build]\nmax_workers = 0\n[task.a]\ncmd = \"a\"\n").unwrap_err();
        assert!(err.to_string().contains("max_workers"));
    }

    #[test]
    fn property_name_clash_is_rejected() {
        let err = validate(
            r#"
[task.a]
cmd = "a"
inputs = [{ name = "opt", path = "src" }]
properties = { opt = "-O2" }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("both as an input and a property"));
    }
}
