use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kiln::action::{ActionFuture, TaskAction, TaskContext, TaskFailure};
use kiln::graph::InputValue;

/// Shared record of action invocations, in start order.
#[derive(Debug, Clone, Default)]
pub struct ActionLog {
    calls: Arc<Mutex<Vec<String>>>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, task: &str) -> usize {
        self.calls().iter().filter(|t| t.as_str() == task).count()
    }

    pub fn total(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of actions observed running at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn enter(&self, task: &str) {
        self.calls.lock().unwrap().push(task.to_string());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Succeeds after an optional delay. Stops early with a failure when the
/// build is cancelled.
#[derive(Debug, Clone)]
pub struct RecordingAction {
    log: ActionLog,
    delay: Duration,
}

impl RecordingAction {
    pub fn new(log: &ActionLog) -> Self {
        Self {
            log: log.clone(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl TaskAction for RecordingAction {
    fn identity(&self) -> String {
        "test:recording".to_string()
    }

    fn execute<'a>(&'a self, ctx: &'a TaskContext) -> ActionFuture<'a> {
        Box::pin(async move {
            self.log.enter(ctx.task_id.as_str());
            let result = tokio::select! {
                _ = tokio::time::sleep(self.delay) => Ok(()),
                _ = ctx.cancel.cancelled() => Err(TaskFailure::new("cancelled")),
            };
            self.log.leave();
            result
        })
    }
}

/// Always fails with the given exit code.
#[derive(Debug, Clone)]
pub struct FailingAction {
    log: ActionLog,
    exit_code: i32,
}

impl FailingAction {
    pub fn new(log: &ActionLog, exit_code: i32) -> Self {
        Self {
            log: log.clone(),
            exit_code,
        }
    }
}

impl TaskAction for FailingAction {
    fn identity(&self) -> String {
        "test:failing".to_string()
    }

    fn execute<'a>(&'a self, ctx: &'a TaskContext) -> ActionFuture<'a> {
        Box::pin(async move {
            self.log.enter(ctx.task_id.as_str());
            self.log.leave();
            Err(TaskFailure::with_exit_code(
                format!("{} failed on purpose", ctx.task_id),
                self.exit_code,
            ))
        })
    }
}

/// Writes every declared output file as `label` followed by the contents of
/// each file input and the value of each property, in input-name order.
///
/// Output content is a pure function of the inputs, like a compiler.
#[derive(Debug, Clone)]
pub struct WriteFileAction {
    log: ActionLog,
    label: String,
}

impl WriteFileAction {
    pub fn new(log: &ActionLog, label: &str) -> Self {
        Self {
            log: log.clone(),
            label: label.to_string(),
        }
    }
}

impl TaskAction for WriteFileAction {
    fn identity(&self) -> String {
        format!("test:write:{}", self.label)
    }

    fn execute<'a>(&'a self, ctx: &'a TaskContext) -> ActionFuture<'a> {
        Box::pin(async move {
            self.log.enter(ctx.task_id.as_str());
            let result = write_outputs(&self.label, ctx).await;
            self.log.leave();
            result
        })
    }
}

async fn write_outputs(label: &str, ctx: &TaskContext) -> Result<(), TaskFailure> {
    let mut inputs: Vec<_> = ctx.inputs.iter().collect();
    inputs.sort_by(|a, b| a.name.cmp(&b.name));

    let mut content = format!("{label}\n").into_bytes();
    for input in inputs {
        match &input.value {
            InputValue::Path(path) => {
                if let Ok(bytes) = tokio::fs::read(path).await {
                    content.extend_from_slice(&bytes);
                }
            }
            InputValue::Scalar(value) => content.extend_from_slice(value.as_bytes()),
        }
    }

    for output in &ctx.outputs {
        if let Some(parent) = output.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TaskFailure::new(format!("creating {parent:?}: {e}")))?;
        }
        tokio::fs::write(&output.path, &content)
            .await
            .map_err(|e| TaskFailure::new(format!("writing {:?}: {e}", output.path)))?;
    }
    Ok(())
}
