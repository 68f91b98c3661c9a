// src/action/mod.rs

//! Task actions: the single capability a collaborator hands the engine.
//!
//! The engine never knows what a task does. It calls
//! [`TaskAction::execute`] on a cache miss and reads the declared outputs
//! back from disk afterwards.

pub mod shell;

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use crate::graph::{InputSpec, InputValue, OutputSpec, TaskId};
use crate::scheduler::CancelToken;

pub use shell::ShellAction;

pub type ActionFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TaskFailure>> + Send + 'a>>;

/// A task action returned failure. Never retried within a build.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TaskFailure {
    pub message: String,
    pub exit_code: Option<i32>,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn with_exit_code(message: impl Into<String>, code: i32) -> Self {
        Self {
            message: message.into(),
            exit_code: Some(code),
        }
    }
}

/// What an action gets to see while it runs.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    /// Project root; the working directory for shell actions.
    pub root: PathBuf,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
    /// Set when the build is cancelled. Long-running actions should poll it
    /// or await [`CancelToken::cancelled`].
    pub cancel: CancelToken,
}

impl TaskContext {
    pub fn output_path(&self, name: &str) -> Option<&Path> {
        self.outputs
            .iter()
            .find(|o| o.name == name)
            .map(|o| o.path.as_path())
    }

    pub fn input_path(&self, name: &str) -> Option<&Path> {
        self.inputs.iter().find(|i| i.name == name).and_then(|i| match &i.value {
            InputValue::Path(p) => Some(p.as_path()),
            InputValue::Scalar(_) => None,
        })
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.inputs.iter().find(|i| i.name == name).and_then(|i| match &i.value {
            InputValue::Scalar(v) => Some(v.as_str()),
            InputValue::Path(_) => None,
        })
    }
}

/// The one capability every task supplies.
pub trait TaskAction: Send + Sync {
    /// Stable identity of the action implementation and its configuration.
    /// Changing it invalidates every fingerprint of tasks using it.
    fn identity(&self) -> String;

    fn execute<'a>(&'a self, ctx: &'a TaskContext) -> ActionFuture<'a>;
}

impl fmt::Debug for dyn TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskAction({})", self.identity())
    }
}

type BlockingFn = dyn Fn(&TaskContext) -> Result<(), TaskFailure> + Send + Sync;

/// Wraps a blocking closure. The closure runs on the blocking thread pool so
/// filesystem-heavy work does not stall the workers.
#[derive(Clone)]
pub struct FnAction {
    identity: String,
    f: Arc<BlockingFn>,
}

impl FnAction {
    pub fn new<F>(identity: impl Into<String>, f: F) -> Self
    where
        F: Fn(&TaskContext) -> Result<(), TaskFailure> + Send + Sync + 'static,
    {
        Self {
            identity: identity.into(),
            f: Arc::new(f),
        }
    }
}

impl fmt::Debug for FnAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAction")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl TaskAction for FnAction {
    fn identity(&self) -> String {
        format!("fn:{}", self.identity)
    }

    fn execute<'a>(&'a self, ctx: &'a TaskContext) -> ActionFuture<'a> {
        let f = Arc::clone(&self.f);
        let ctx = ctx.clone();
        Box::pin(async move {
            match tokio::task::spawn_blocking(move || f(&ctx)).await {
                Ok(result) => result,
                Err(join) if join.is_panic() => Err(TaskFailure::new("task action panicked")),
                Err(join) => Err(TaskFailure::new(format!("task action aborted: {join}"))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TaskContext {
        TaskContext {
            task_id: TaskId::new("t").unwrap(),
            root: PathBuf::from("/p"),
            inputs: vec![InputSpec::scalar("opt", "-O2"), InputSpec::path("src", "/p/src")],
            outputs: vec![OutputSpec::new("obj", "/p/build/a.o")],
            cancel: CancelToken::new(),
        }
    }

    #[tokio::test]
    async fn fn_action_reports_result() {
        let ok = FnAction::new("ok", |_| Ok(()));
        let bad = FnAction::new("bad", |_| Err(TaskFailure::with_exit_code("boom", 2)));
        let c = ctx();
        assert!(ok.execute(&c).await.is_ok());
        assert_eq!(bad.execute(&c).await.unwrap_err().exit_code, Some(2));
    }

    #[tokio::test]
    async fn fn_action_panic_is_a_failure() {
        let action = FnAction::new("panics", |_| panic!("nope"));
        let err = action.execute(&ctx()).await.unwrap_err();
        assert!(err.message.contains("panicked"));
    }

    #[test]
    fn context_lookups() {
        let c = ctx();
        assert_eq!(c.property("opt"), Some("-O2"));
        assert_eq!(c.input_path("src"), Some(Path::new("/p/src")));
        assert_eq!(c.output_path("obj"), Some(Path::new("/p/build/a.o")));
        assert_eq!(c.input_path("opt"), None);
    }
}
