// src/build/listener.rs

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info, warn};

use super::BuildSummary;
use crate::cache::OriginMetadata;
use crate::graph::{OutputSpec, TaskId};
use crate::types::TaskState;

/// Progress reported back to collaborators while a build runs.
#[derive(Debug, Clone)]
pub enum BuildEvent {
    TaskStarted {
        task: TaskId,
    },
    TaskFinished {
        task: TaskId,
        state: TaskState,
        duration: Duration,
        outputs: Vec<OutputSpec>,
        /// Set for `FromCache`: where the reused entry came from.
        origin: Option<OriginMetadata>,
    },
    /// Not run because an upstream task failed (or the build halted).
    TaskSkipped {
        task: TaskId,
    },
    BuildFinished(BuildSummary),
}

pub trait BuildListener: Send + Sync {
    fn on_event(&self, event: &BuildEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl BuildListener for TracingListener {
    fn on_event(&self, event: &BuildEvent) {
        match event {
            BuildEvent::TaskStarted { task } => info!(task = %task, "task started"),
            BuildEvent::TaskFinished {
                task,
                state: TaskState::Failed,
                duration,
                ..
            } => error!(task = %task, duration_ms = duration.as_millis() as u64, "task FAILED"),
            BuildEvent::TaskFinished {
                task,
                state,
                duration,
                origin: Some(origin),
                ..
            } => info!(
                task = %task,
                state = %state,
                duration_ms = duration.as_millis() as u64,
                origin_build = %origin.build_invocation_id,
                origin_host = %origin.hostname,
                origin_execution_ms = origin.execution_time_ms,
                "task finished"
            ),
            BuildEvent::TaskFinished {
                task,
                state,
                duration,
                ..
            } => info!(
                task = %task,
                state = %state,
                duration_ms = duration.as_millis() as u64,
                "task finished"
            ),
            BuildEvent::TaskSkipped { task } => warn!(task = %task, "task skipped"),
            BuildEvent::BuildFinished(summary) => info!(%summary, "build finished"),
        }
    }
}

/// Records events in memory.
#[derive(Debug, Default)]
pub struct CollectingListener {
    events: Mutex<Vec<BuildEvent>>,
}

impl CollectingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BuildEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Terminal state reported for `task`, if it finished.
    pub fn finished_state(&self, task: &str) -> Option<TaskState> {
        self.events().into_iter().find_map(|e| match e {
            BuildEvent::TaskFinished { task: t, state, .. } if t.as_str() == task => Some(state),
            _ => None,
        })
    }

    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BuildEvent::TaskStarted { task } => Some(task.to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn skipped(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BuildEvent::TaskSkipped { task } => Some(task.to_string()),
                _ => None,
            })
            .collect()
    }
}

impl BuildListener for CollectingListener {
    fn on_event(&self, event: &BuildEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Fan-out to every registered listener.
#[derive(Clone, Default)]
pub(crate) struct Listeners(Arc<Vec<Arc<dyn BuildListener>>>);

impl Listeners {
    pub(crate) fn new(listeners: Vec<Arc<dyn BuildListener>>) -> Self {
        Self(Arc::new(listeners))
    }

    pub(crate) fn emit(&self, event: &BuildEvent) {
        for listener in self.0.iter() {
            listener.on_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_listener_answers_queries() {
        let listener = CollectingListener::new();
        let a = TaskId::new("a").unwrap();
        listener.on_event(&BuildEvent::TaskStarted { task: a.clone() });
        listener.on_event(&BuildEvent::TaskFinished {
            task: a,
            state: TaskState::Executed,
            duration: Duration::from_millis(3),
            outputs: vec![],
            origin: None,
        });
        listener.on_event(&BuildEvent::TaskSkipped {
            task: TaskId::new("b").unwrap(),
        });

        assert_eq!(listener.started(), vec!["a".to_string()]);
        assert_eq!(listener.finished_state("a"), Some(TaskState::Executed));
        assert_eq!(listener.finished_state("b"), None);
        assert_eq!(listener.skipped(), vec!["b".to_string()]);
    }

    #[test]
    fn listeners_fan_out() {
        let first = Arc::new(CollectingListener::new());
        let second = Arc::new(CollectingListener::new());
        let listeners = Listeners::new(vec![first.clone(), second.clone(), Arc::new(TracingListener)]);
        listeners.emit(&BuildEvent::BuildFinished(BuildSummary::default()));
        assert_eq!(first.events().len(), 1);
        assert_eq!(second.events().len(), 1);
    }
}
