// src/build/mod.rs

//! One build invocation, wired end to end.
//!
//! [`BuildSession`] is the service object collaborators talk to: they
//! register tasks on it, then call [`execute`](BuildSession::execute). Each
//! execution builds a fresh snapshot store, fingerprint engine and build
//! cache and hands them to the scheduler through an [`IncrementalRunner`].
//! No state is shared between sessions except what is on disk (history and
//! the local cache) or behind the remote tier.

pub mod listener;
mod runner;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::action::TaskAction;
use crate::cache::remote::RemoteCredentials;
use crate::cache::{BuildCache, HttpRemoteCache, LocalBuildCache, RemoteCache};
use crate::config::BuildSettings;
use crate::errors::{KilnError, Result};
use crate::fingerprint::FingerprintEngine;
use crate::fs::{FileSystem, RealFileSystem};
use crate::graph::{ExecutionPlan, InputSpec, OutputSpec, TaskDeclaration, TaskGraph, TaskId};
use crate::history::{FileTaskHistory, MemoryTaskHistory, TaskHistory};
use crate::scheduler::{CancelToken, Scheduler, SchedulerOptions, Transition};
use crate::snapshot::SnapshotStore;
use crate::snapshot::watcher::spawn_invalidator;
use crate::types::{CacheMode, HistoryStorageMode, TaskState};

pub use listener::{BuildEvent, BuildListener, CollectingListener, TracingListener};
use listener::Listeners;
use runner::IncrementalRunner;

/// Exit code for a build stopped by `cancel()` (as for SIGINT).
pub const EXIT_CANCELLED: i32 = 130;

/// Count of nodes per terminal state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSummary {
    pub total: usize,
    pub up_to_date: usize,
    pub from_cache: usize,
    pub executed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Never reached a terminal state (cancelled build).
    pub not_run: usize,
}

impl BuildSummary {
    pub fn from_states(states: impl IntoIterator<Item = TaskState>) -> Self {
        let mut summary = Self::default();
        for state in states {
            summary.total += 1;
            match state {
                TaskState::UpToDate => summary.up_to_date += 1,
                TaskState::FromCache => summary.from_cache += 1,
                TaskState::Executed => summary.executed += 1,
                TaskState::Failed => summary.failed += 1,
                TaskState::Skipped => summary.skipped += 1,
                TaskState::Pending | TaskState::Ready | TaskState::Running => summary.not_run += 1,
            }
        }
        summary
    }
}

impl fmt::Display for BuildSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tasks: {} executed, {} from cache, {} up-to-date, {} failed, {} skipped",
            self.total, self.executed, self.from_cache, self.up_to_date, self.failed, self.skipped
        )?;
        if self.not_run > 0 {
            write!(f, ", {} not run", self.not_run)?;
        }
        Ok(())
    }
}

/// What a finished (or aborted) build reports back.
#[derive(Debug)]
pub struct BuildOutcome {
    pub build_id: String,
    /// Final state per task, in plan order.
    pub states: Vec<(TaskId, TaskState)>,
    pub summary: BuildSummary,
    pub cancelled: bool,
    /// Error that aborted the build mid-way (integrity failures).
    pub fatal: Option<KilnError>,
    pub timeline: Vec<Transition>,
}

impl BuildOutcome {
    pub fn state_of(&self, task: &str) -> Option<TaskState> {
        self.states
            .iter()
            .find(|(id, _)| id.as_str() == task)
            .map(|(_, state)| *state)
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.fatal.is_some() {
            1
        } else if self.cancelled {
            EXIT_CANCELLED
        } else if self.summary.failed > 0 {
            1
        } else {
            0
        }
    }
}

/// Collects tasks and settings for one build and runs it.
pub struct BuildSession {
    settings: BuildSettings,
    graph: TaskGraph,
    fs: Arc<dyn FileSystem>,
    history: Option<Arc<dyn TaskHistory>>,
    remote: Option<(Arc<dyn RemoteCache>, bool)>,
    listeners: Vec<Arc<dyn BuildListener>>,
    cancel: CancelToken,
}

impl fmt::Debug for BuildSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildSession")
            .field("root", &self.graph.root())
            .field("tasks", &self.graph.len())
            .field("settings", &self.settings.redacted())
            .finish_non_exhaustive()
    }
}

impl BuildSession {
    pub fn new(root: impl Into<PathBuf>, settings: BuildSettings) -> Self {
        Self {
            settings,
            graph: TaskGraph::new(root),
            fs: Arc::new(RealFileSystem),
            history: None,
            remote: None,
            listeners: vec![Arc::new(TracingListener)],
            cancel: CancelToken::new(),
        }
    }

    pub fn with_filesystem(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    /// Use this history instead of the one `history_storage` selects.
    pub fn with_history(mut self, history: Arc<dyn TaskHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Use this remote tier instead of an HTTP one built from settings.
    /// Still subject to `offline` and `cache_mode`.
    pub fn with_remote_cache(mut self, remote: Arc<dyn RemoteCache>, push: bool) -> Self {
        self.remote = Some((remote, push));
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn BuildListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    pub fn root(&self) -> &Path {
        self.graph.root()
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Token that stops the build when cancelled, e.g. from a Ctrl-C handler.
    pub fn cancel_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn register_task(
        &mut self,
        id: &str,
        inputs: Vec<InputSpec>,
        outputs: Vec<OutputSpec>,
        depends_on: &[&str],
        action: impl TaskAction + 'static,
    ) -> Result<()> {
        Ok(self.graph.register_task(id, inputs, outputs, depends_on, action)?)
    }

    pub fn register(&mut self, decl: TaskDeclaration) -> Result<()> {
        Ok(self.graph.register(decl)?)
    }

    /// Validate and freeze the task graph.
    pub fn plan(&mut self) -> Result<Arc<ExecutionPlan>> {
        Ok(self.graph.plan()?)
    }

    /// Run the build.
    ///
    /// Graph errors and setup problems (history, remote configuration) are
    /// returned as `Err` before any task runs. Failures during the build are
    /// reported in the returned [`BuildOutcome`].
    pub async fn execute(&mut self) -> Result<BuildOutcome> {
        let plan = self.plan()?;
        let build_id = Uuid::new_v4().simple().to_string();
        info!(
            build_id = %build_id,
            tasks = plan.len(),
            workers = self.settings.max_workers,
            cache = ?self.settings.cache_mode,
            offline = self.settings.offline,
            rerun = self.settings.rerun,
            "starting build"
        );

        let snapshots = Arc::new(
            SnapshotStore::new(Arc::clone(&self.fs)).with_verification(self.settings.verify_snapshots),
        );
        let _invalidator = if self.settings.watch_changes {
            match spawn_invalidator(self.graph.root(), Arc::clone(&snapshots)) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(error = %e, "could not watch the project; snapshots are checked by stamp only");
                    None
                }
            }
        } else {
            None
        };

        let history = self.open_history()?;
        let active: Vec<&str> = plan.nodes().iter().map(|n| n.id.as_str()).collect();
        history.prune(&active)?;

        let cache = Arc::new(self.build_cache(&build_id, &snapshots)?);
        let listeners = Listeners::new(self.listeners.clone());
        let runner = IncrementalRunner::new(
            self.graph.root().to_path_buf(),
            FingerprintEngine::new(Arc::clone(&snapshots)),
            history,
            Arc::clone(&cache),
            listeners.clone(),
            self.settings.rerun,
        );

        let scheduler = Scheduler::new(
            Arc::clone(&plan),
            SchedulerOptions {
                max_workers: self.settings.max_workers,
                continue_on_failure: self.settings.continue_on_failure,
                cancel_grace: self.settings.cancel_grace,
            },
            self.cancel.clone(),
        );
        let report = scheduler.run(Arc::new(runner)).await;
        cache.flush().await;

        let states: Vec<(TaskId, TaskState)> = plan
            .nodes()
            .iter()
            .map(|n| n.id.clone())
            .zip(report.states.iter().copied())
            .collect();
        for (task, state) in &states {
            if *state == TaskState::Skipped {
                listeners.emit(&BuildEvent::TaskSkipped { task: task.clone() });
            }
        }

        let summary = BuildSummary::from_states(states.iter().map(|(_, s)| *s));
        listeners.emit(&BuildEvent::BuildFinished(summary.clone()));
        let stats = snapshots.stats();
        info!(
            build_id = %build_id,
            files_hashed = stats.files_hashed,
            stamp_hits = stats.stamp_hits,
            tree_hits = stats.tree_hits,
            "snapshot statistics"
        );

        Ok(BuildOutcome {
            build_id,
            states,
            summary,
            cancelled: report.cancelled,
            fatal: report.fatal,
            timeline: report.timeline,
        })
    }

    fn open_history(&self) -> Result<Arc<dyn TaskHistory>> {
        if let Some(history) = &self.history {
            return Ok(Arc::clone(history));
        }
        Ok(match self.settings.history_storage {
            HistoryStorageMode::File => {
                Arc::new(FileTaskHistory::open(&self.settings.history_dir, Arc::clone(&self.fs))?)
            }
            HistoryStorageMode::Memory => Arc::new(MemoryTaskHistory::new()),
        })
    }

    fn build_cache(&self, build_id: &str, snapshots: &Arc<SnapshotStore>) -> Result<BuildCache> {
        if self.settings.cache_mode == CacheMode::Off {
            info!("build cache disabled");
            return Ok(BuildCache::disabled(build_id, Arc::clone(snapshots)));
        }

        let local = LocalBuildCache::new(&self.settings.cache_dir, Arc::clone(&self.fs));
        let cache = BuildCache::new(build_id, Arc::clone(snapshots), Some(local));

        let configured = self.remote.is_some() || self.settings.remote.is_some();
        if self.settings.offline {
            if configured {
                info!("offline: remote build cache disabled");
            }
            return Ok(cache);
        }

        if let Some((remote, push)) = &self.remote {
            return Ok(cache.with_remote(Arc::clone(remote), *push));
        }
        let Some(settings) = &self.settings.remote else {
            return Ok(cache);
        };
        let mut http = HttpRemoteCache::new(&settings.url, settings.timeout)
            .map_err(|e| KilnError::ConfigError(format!("remote build cache {}: {e}", settings.url)))?;
        if let Some(username) = &settings.username {
            http = http.with_credentials(RemoteCredentials {
                username: username.clone(),
                password: settings.password.clone(),
            });
        }
        info!(url = %settings.url, push = settings.push, "using remote build cache");
        Ok(cache.with_remote(Arc::new(http), settings.push))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{FnAction, TaskFailure};
    use crate::fs::mock::MockFileSystem;
    use crate::history::TaskRecord;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings() -> BuildSettings {
        let mut s = BuildSettings::defaults(Path::new("/proj"));
        s.max_workers = 2;
        s
    }

    fn counting_copy(calls: Arc<AtomicUsize>, fs: Arc<MockFileSystem>) -> FnAction {
        FnAction::new("copy", move |ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            let src = ctx.input_path("src").ok_or_else(|| TaskFailure::new("no src"))?;
            let out = ctx.output_path("out").ok_or_else(|| TaskFailure::new("no out"))?;
            let bytes = fs.read_bytes(src).ok_or_else(|| TaskFailure::new("missing src"))?;
            fs.add_file(out, bytes);
            Ok(())
        })
    }

    fn session(fs: &Arc<MockFileSystem>, history: &Arc<MemoryTaskHistory>, calls: &Arc<AtomicUsize>) -> BuildSession {
        let mut session = BuildSession::new("/proj", settings())
            .with_filesystem(Arc::clone(fs) as Arc<dyn FileSystem>)
            .with_history(Arc::clone(history) as Arc<dyn TaskHistory>);
        session
            .register_task(
                "copy",
                vec![InputSpec::path("src", "in.txt")],
                vec![OutputSpec::new("out", "out/copy.txt")],
                &[],
                counting_copy(Arc::clone(calls), Arc::clone(fs)),
            )
            .unwrap();
        session
    }

    #[test]
    fn summary_counts_and_exit_codes() {
        use TaskState::*;
        let summary = BuildSummary::from_states([Executed, FromCache, UpToDate, Skipped, Pending]);
        assert_eq!(summary.total, 5);
        assert_eq!(summary.not_run, 1);
        assert!(summary.to_string().contains("1 executed, 1 from cache, 1 up-to-date"));

        let outcome = |failed, cancelled| BuildOutcome {
            build_id: "b".into(),
            states: vec![],
            summary: BuildSummary {
                failed,
                ..BuildSummary::default()
            },
            cancelled,
            fatal: None,
            timeline: vec![],
        };
        assert_eq!(outcome(0, false).exit_code(), 0);
        assert_eq!(outcome(1, false).exit_code(), 1);
        assert_eq!(outcome(0, true).exit_code(), EXIT_CANCELLED);
    }

    #[tokio::test]
    async fn second_build_is_up_to_date_then_cached_after_output_loss() {
        let fs = Arc::new(MockFileSystem::new());
        fs.add_file("/proj/in.txt", "hello");
        let history = Arc::new(MemoryTaskHistory::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let first = session(&fs, &history, &calls).execute().await.unwrap();
        assert_eq!(first.state_of("copy"), Some(TaskState::Executed));
        assert_eq!(fs.read_bytes("/proj/out/copy.txt").unwrap(), b"hello");

        let second = session(&fs, &history, &calls).execute().await.unwrap();
        assert_eq!(second.state_of("copy"), Some(TaskState::UpToDate));

        fs.remove_all(Path::new("/proj/out")).unwrap();
        let third = session(&fs, &history, &calls).execute().await.unwrap();
        assert_eq!(third.state_of("copy"), Some(TaskState::FromCache));
        assert_eq!(fs.read_bytes("/proj/out/copy.txt").unwrap(), b"hello");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(third.exit_code(), 0);
    }

    #[tokio::test]
    async fn rerun_executes_even_when_cached() {
        let fs = Arc::new(MockFileSystem::new());
        fs.add_file("/proj/in.txt", "hello");
        let history = Arc::new(MemoryTaskHistory::new());
        let calls = Arc::new(AtomicUsize::new(0));

        session(&fs, &history, &calls).execute().await.unwrap();

        let mut forced = settings();
        forced.rerun = true;
        let mut again = session(&fs, &history, &calls);
        again.settings = forced;
        let outcome = again.execute().await.unwrap();
        assert_eq!(outcome.state_of("copy"), Some(TaskState::Executed));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn listeners_see_every_task() {
        let fs = Arc::new(MockFileSystem::new());
        fs.add_file("/proj/in.txt", "hello");
        let history = Arc::new(MemoryTaskHistory::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let events = Arc::new(CollectingListener::new());

        let mut s = session(&fs, &history, &calls).with_listener(events.clone());
        s.execute().await.unwrap();
        assert_eq!(events.started(), vec!["copy".to_string()]);
        assert_eq!(events.finished_state("copy"), Some(TaskState::Executed));
        assert!(matches!(events.events().last(), Some(BuildEvent::BuildFinished(s)) if s.executed == 1));
    }

    #[tokio::test]
    async fn graph_errors_surface_before_execution() {
        let mut s = BuildSession::new("/proj", settings())
            .with_filesystem(Arc::new(MockFileSystem::new()))
            .with_history(Arc::new(MemoryTaskHistory::new()));
        s.register_task("link", vec![], vec![], &["compile"], FnAction::new("noop", |_| Ok(())))
            .unwrap();
        let err = s.execute().await.unwrap_err();
        assert!(matches!(err, KilnError::Graph(_)));
    }

    /// Memory history that records which threads wrote to it.
    #[derive(Default)]
    struct ThreadRecordingHistory {
        inner: MemoryTaskHistory,
        writers: std::sync::Mutex<Vec<std::thread::ThreadId>>,
    }

    impl ThreadRecordingHistory {
        fn record(&self) {
            self.writers.lock().unwrap().push(std::thread::current().id());
        }
    }

    impl TaskHistory for ThreadRecordingHistory {
        fn load(&self, task: &str) -> anyhow::Result<Option<TaskRecord>> {
            self.inner.load(task)
        }
        fn save(&self, task: &str, record: TaskRecord) -> anyhow::Result<()> {
            self.record();
            self.inner.save(task, record)
        }
        fn remove(&self, task: &str) -> anyhow::Result<()> {
            self.record();
            self.inner.remove(task)
        }
        fn prune(&self, active_tasks: &[&str]) -> anyhow::Result<()> {
            self.inner.prune(active_tasks)
        }
    }

    #[tokio::test]
    async fn history_writes_run_on_the_blocking_pool() {
        let fs = Arc::new(MockFileSystem::new());
        fs.add_file("/proj/in.txt", "hello");
        let history = Arc::new(ThreadRecordingHistory::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut s = BuildSession::new("/proj", settings())
            .with_filesystem(Arc::clone(&fs) as Arc<dyn FileSystem>)
            .with_history(Arc::clone(&history) as Arc<dyn TaskHistory>);
        s.register_task(
            "copy",
            vec![InputSpec::path("src", "in.txt")],
            vec![OutputSpec::new("out", "out/copy.txt")],
            &[],
            counting_copy(Arc::clone(&calls), Arc::clone(&fs)),
        )
        .unwrap();
        s.execute().await.unwrap();

        assert!(history.inner.load("copy").unwrap().is_some());
        let writers = history.writers.lock().unwrap().clone();
        assert_eq!(writers.len(), 1);
        assert!(!writers.contains(&std::thread::current().id()));
    }
}
