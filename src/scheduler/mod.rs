// src/scheduler/mod.rs

//! Bounded worker pool over an [`ExecutionPlan`].
//!
//! The IO shell around the pure [`ExecutionState`]: workers pull ready nodes
//! from the shared queue, take the node's resource locks, flip it to
//! `Running` and hand it to a [`NodeRunner`]. Completion is recorded back in
//! the state machine, which releases dependents.

pub mod cancel;
pub mod locks;
pub mod state;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::errors::KilnError;
use crate::graph::{ExecutionPlan, TaskNode};
use crate::types::TaskState;

pub use cancel::CancelToken;
pub use locks::KeyedLocks;
pub use state::{ExecutionState, Transition};

pub type NodeFuture = Pin<Box<dyn Future<Output = Result<TaskState, KilnError>> + Send + 'static>>;

/// Decides what happens to one node once it is `Running`.
///
/// Returns the terminal state (`UpToDate`, `FromCache`, `Executed` or
/// `Failed`), or an error. Fatal errors abort the build.
pub trait NodeRunner: Send + Sync + 'static {
    fn run(&self, node: Arc<TaskNode>, cancel: CancelToken) -> NodeFuture;
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_workers: usize,
    pub continue_on_failure: bool,
    /// How long in-flight actions get to wind down after a cancel.
    pub cancel_grace: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_workers: default_parallelism(),
            continue_on_failure: false,
            cancel_grace: Duration::from_secs(5),
        }
    }
}

pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Result of one scheduler run.
#[derive(Debug)]
pub struct ExecutionReport {
    pub states: Vec<TaskState>,
    pub timeline: Vec<Transition>,
    pub failures: usize,
    pub cancelled: bool,
    pub fatal: Option<KilnError>,
}

struct Shared {
    state: Mutex<ExecutionState>,
    notify: Notify,
    fatal: Mutex<Option<KilnError>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ExecutionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_fatal(&self, err: KilnError) {
        let mut fatal = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
        if fatal.is_none() {
            *fatal = Some(err);
        }
    }
}

/// Aborts the wrapped task when dropped, so abandoning a worker also stops
/// the action it was driving.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug)]
pub struct Scheduler {
    plan: Arc<ExecutionPlan>,
    options: SchedulerOptions,
    cancel: CancelToken,
    resource_locks: Arc<KeyedLocks<String>>,
}

impl Scheduler {
    pub fn new(plan: Arc<ExecutionPlan>, options: SchedulerOptions, cancel: CancelToken) -> Self {
        Self {
            plan,
            options,
            cancel,
            resource_locks: Arc::new(KeyedLocks::new()),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Stop dispatching new nodes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn run(&self, runner: Arc<dyn NodeRunner>) -> ExecutionReport {
        let workers = self.options.max_workers.max(1);
        info!(
            tasks = self.plan.len(),
            workers,
            continue_on_failure = self.options.continue_on_failure,
            "scheduler started"
        );

        let shared = Arc::new(Shared {
            state: Mutex::new(ExecutionState::new(
                Arc::clone(&self.plan),
                self.options.continue_on_failure,
            )),
            notify: Notify::new(),
            fatal: Mutex::new(None),
        });

        let mut pool = JoinSet::new();
        for worker in 0..workers {
            pool.spawn(worker_loop(
                worker,
                Arc::clone(&shared),
                Arc::clone(&self.plan),
                Arc::clone(&runner),
                Arc::clone(&self.resource_locks),
                self.cancel.clone(),
            ));
        }

        tokio::select! {
            _ = drain(&mut pool) => {}
            _ = self.cancel.cancelled() => {
                info!("cancellation requested; no new tasks will start");
                shared.lock().cancel();
                shared.notify.notify_waiters();
                let grace = self.options.cancel_grace;
                if tokio::time::timeout(grace, drain(&mut pool)).await.is_err() {
                    warn!(?grace, "in-flight tasks did not finish within the grace period; abandoning them");
                    pool.abort_all();
                    drain(&mut pool).await;
                }
            }
        }

        let fatal = shared
            .fatal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let cancelled = self.cancel.is_cancelled() && fatal.is_none();

        let (states, timeline, failures) = {
            let state = shared.lock();
            (state.states().to_vec(), state.timeline().to_vec(), state.failures())
        };

        info!(failures, cancelled, fatal = fatal.is_some(), "scheduler finished");

        ExecutionReport {
            states,
            timeline,
            failures,
            cancelled,
            fatal,
        }
    }
}

async fn drain(pool: &mut JoinSet<()>) {
    while let Some(res) = pool.join_next().await {
        if let Err(e) = res {
            if e.is_panic() {
                error!("scheduler worker panicked: {e}");
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    shared: Arc<Shared>,
    plan: Arc<ExecutionPlan>,
    runner: Arc<dyn NodeRunner>,
    locks: Arc<KeyedLocks<String>>,
    cancel: CancelToken,
) {
    debug!(worker, "worker started");
    loop {
        // Register for wake-ups before inspecting the queue so a completion
        // between the check and the await is not missed.
        let notified = shared.notify.notified();
        let next = {
            let mut state = shared.lock();
            if state.is_done() {
                break;
            }
            state.claim_next()
        };

        let Some(idx) = next else {
            notified.await;
            continue;
        };
        drop(notified);

        let node = Arc::clone(plan.node(idx));
        let resources = plan.locks(idx);

        // Lock acquisition may block; a cancel while waiting abandons the node.
        let guards = if resources.is_empty() {
            Vec::new()
        } else {
            debug!(worker, task = %node.id, ?resources, "waiting for resource locks");
            tokio::select! {
                guards = locks.acquire_all(resources) => guards,
                _ = cancel.cancelled() => {
                    shared.lock().abandon(idx);
                    shared.notify.notify_waiters();
                    continue;
                }
            }
        };

        let started = {
            let mut state = shared.lock();
            let started = state.start(idx);
            if !started {
                state.abandon(idx);
            }
            started
        };
        if !started {
            shared.notify.notify_waiters();
            continue;
        }

        debug!(worker, task = %node.id, "running task");
        let mut handle = AbortOnDrop(tokio::spawn(runner.run(Arc::clone(&node), cancel.clone())));
        let outcome = match (&mut handle.0).await {
            Ok(Ok(state)) => Some(state),
            Ok(Err(err)) if err.is_fatal() => {
                error!(task = %node.id, error = %err, "fatal error; cancelling build");
                shared.record_fatal(err);
                cancel.cancel();
                Some(TaskState::Failed)
            }
            Ok(Err(err)) => {
                error!(task = %node.id, error = %err, "task errored");
                Some(TaskState::Failed)
            }
            Err(join) if join.is_panic() => {
                error!(task = %node.id, "task runner panicked");
                Some(TaskState::Failed)
            }
            Err(_) => None,
        };
        drop(guards);

        {
            let mut state = shared.lock();
            match outcome {
                // A failure caused by cancellation is not a task failure.
                Some(TaskState::Failed) if cancel.is_cancelled() && shared_fatal_absent(&shared) => {
                    state.abandon(idx)
                }
                Some(outcome) => {
                    state.complete(idx, outcome);
                }
                None => state.abandon(idx),
            }
        }
        shared.notify.notify_waiters();
    }
    debug!(worker, "worker finished");
}

fn shared_fatal_absent(shared: &Shared) -> bool {
    shared
        .fatal
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .is_none()
}
