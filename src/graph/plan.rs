// src/graph/plan.rs

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::errors::GraphError;

use super::node::{TaskId, TaskNode};

/// A validated, acyclic view of the task graph for one build.
///
/// Nodes live in an arena addressed by index; adjacency is explicit in both
/// directions. The plan is immutable once built and shared with workers.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    nodes: Vec<Arc<TaskNode>>,
    index: HashMap<TaskId, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
    waves: Vec<Vec<usize>>,
    locks: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub(crate) fn build(nodes: Vec<Arc<TaskNode>>) -> Result<Self, GraphError> {
        let index: HashMap<TaskId, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        let mut dependencies = vec![Vec::new(); nodes.len()];
        let mut dependents = vec![Vec::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            for dep in &node.depends_on {
                let Some(&d) = index.get(dep) else {
                    return Err(GraphError::UnknownDependency {
                        task: node.id.to_string(),
                        dependency: dep.to_string(),
                    });
                };
                if !dependencies[i].contains(&d) {
                    dependencies[i].push(d);
                    dependents[d].push(i);
                }
            }
        }

        if let Some(cycle) = find_cycle(&dependencies) {
            let path: Vec<String> = cycle.iter().map(|&i| nodes[i].id.to_string()).collect();
            return Err(GraphError::Cycle { path });
        }

        let order = topological_order(&dependencies, &dependents);
        let waves = compute_waves(&dependencies, &order);
        let locks = compute_locks(&nodes);

        info!(
            task_count = nodes.len(),
            wave_count = waves.len(),
            "execution plan built"
        );

        Ok(Self {
            nodes,
            index,
            dependencies,
            dependents,
            order,
            waves,
            locks,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &Arc<TaskNode> {
        &self.nodes[idx]
    }

    pub fn nodes(&self) -> &[Arc<TaskNode>] {
        &self.nodes
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id.as_str() == id)
    }

    pub fn index_of_id(&self, id: &TaskId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn dependencies(&self, idx: usize) -> &[usize] {
        &self.dependencies[idx]
    }

    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    /// A topologically valid order over all nodes.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Groups of mutually independent tasks; wave `n` only depends on
    /// earlier waves.
    pub fn waves(&self) -> &[Vec<usize>] {
        &self.waves
    }

    /// Named resource locks for a node, sorted so every worker acquires them
    /// in the same order.
    pub fn locks(&self, idx: usize) -> &[String] {
        &self.locks[idx]
    }

    /// Human-readable plan, one wave per block.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "execution plan: {} tasks in {} waves",
            self.nodes.len(),
            self.waves.len()
        );
        for (w, wave) in self.waves.iter().enumerate() {
            let _ = writeln!(out, "wave {w}:");
            for &i in wave {
                let node = &self.nodes[i];
                let _ = writeln!(out, "  - {}", node.id);
                let _ = writeln!(out, "      action: {}", node.action.identity());
                if !self.dependencies[i].is_empty() {
                    let deps: Vec<&str> = self.dependencies[i]
                        .iter()
                        .map(|&d| self.nodes[d].id.as_str())
                        .collect();
                    let _ = writeln!(out, "      after: {}", deps.join(", "));
                }
                if !self.locks[i].is_empty() {
                    let _ = writeln!(out, "      locks: {}", self.locks[i].join(", "));
                }
                if !node.cacheable {
                    let _ = writeln!(out, "      cacheable: false");
                }
            }
        }
        out
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Iterative three-colour DFS along dependency edges. Returns the full cycle
/// with the first node repeated at the end.
fn find_cycle(dependencies: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut color = vec![Color::White; dependencies.len()];

    for start in 0..dependencies.len() {
        if color[start] != Color::White {
            continue;
        }
        // (node, next edge to explore)
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        color[start] = Color::Gray;

        while let Some(&(node, edge)) = stack.last() {
            if let Some(&next) = dependencies[node].get(edge) {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                match color[next] {
                    Color::White => {
                        color[next] = Color::Gray;
                        stack.push((next, 0));
                    }
                    Color::Gray => {
                        let from = stack.iter().position(|&(n, _)| n == next).unwrap_or(0);
                        let mut cycle: Vec<usize> = stack[from..].iter().map(|&(n, _)| n).collect();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Color::Black => {}
                }
            } else {
                color[node] = Color::Black;
                stack.pop();
            }
        }
    }
    None
}

/// Kahn's algorithm; ties broken by registration order.
fn topological_order(dependencies: &[Vec<usize>], dependents: &[Vec<usize>]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: BTreeSet<usize> = (0..dependencies.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(dependencies.len());

    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.insert(d);
            }
        }
    }
    order
}

fn compute_waves(dependencies: &[Vec<usize>], order: &[usize]) -> Vec<Vec<usize>> {
    let mut wave_of = vec![0usize; dependencies.len()];
    let mut waves: Vec<Vec<usize>> = Vec::new();
    for &i in order {
        let wave = dependencies[i]
            .iter()
            .map(|&d| wave_of[d] + 1)
            .max()
            .unwrap_or(0);
        wave_of[i] = wave;
        if waves.len() <= wave {
            waves.resize_with(wave + 1, Vec::new);
        }
        waves[wave].push(i);
    }
    waves
}

/// Explicit resources plus one shared lock per output location that more
/// than one task writes into. Each output path maps to the top-most declared
/// output path containing it.
fn compute_locks(nodes: &[Arc<TaskNode>]) -> Vec<Vec<String>> {
    let all_outputs: BTreeSet<&PathBuf> = nodes
        .iter()
        .flat_map(|n| n.outputs.iter().map(|o| &o.path))
        .collect();

    let top_of = |path: &PathBuf| -> PathBuf {
        all_outputs
            .iter()
            .filter(|candidate| path.starts_with(candidate))
            .min_by_key(|candidate| candidate.components().count())
            .map(|p| (*p).clone())
            .unwrap_or_else(|| path.clone())
    };

    let mut users: BTreeMap<PathBuf, BTreeSet<usize>> = BTreeMap::new();
    let mut tops_per_node: Vec<BTreeSet<PathBuf>> = vec![BTreeSet::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for output in &node.outputs {
            let top = top_of(&output.path);
            users.entry(top.clone()).or_default().insert(i);
            tops_per_node[i].insert(top);
        }
    }

    nodes
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let mut locks: BTreeSet<String> = node.resources.iter().cloned().collect();
            for top in &tops_per_node[i] {
                if users.get(top).is_some_and(|u| u.len() > 1) {
                    debug!(task = %node.id, location = ?top, "overlapping outputs; adding shared lock");
                    locks.insert(format!("output:{}", top.display()));
                }
            }
            locks.into_iter().collect()
        })
        .collect()
}
