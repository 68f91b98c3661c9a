// src/build/runner.rs

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use tracing::{debug, error, info, warn};

use super::listener::{BuildEvent, Listeners};
use crate::action::TaskContext;
use crate::cache::{BuildCache, CacheOutcome, CacheRequest, OriginMetadata};
use crate::errors::KilnError;
use crate::fingerprint::{Fingerprint, FingerprintEngine};
use crate::graph::TaskNode;
use crate::hash::ContentHash;
use crate::history::{TaskHistory, TaskRecord};
use crate::scheduler::{CancelToken, NodeFuture, NodeRunner};
use crate::snapshot::SnapshotError;
use crate::types::TaskState;

/// Decides per node between up-to-date, cache hit and execution.
#[derive(Clone)]
pub(crate) struct IncrementalRunner {
    root: PathBuf,
    fingerprints: FingerprintEngine,
    history: Arc<dyn TaskHistory>,
    cache: Arc<BuildCache>,
    listeners: Listeners,
    rerun: bool,
}

impl IncrementalRunner {
    pub(crate) fn new(
        root: PathBuf,
        fingerprints: FingerprintEngine,
        history: Arc<dyn TaskHistory>,
        cache: Arc<BuildCache>,
        listeners: Listeners,
        rerun: bool,
    ) -> Self {
        Self {
            root,
            fingerprints,
            history,
            cache,
            listeners,
            rerun,
        }
    }

    async fn run_node(self, node: Arc<TaskNode>, cancel: CancelToken) -> Result<TaskState, KilnError> {
        let started = Instant::now();
        self.listeners.emit(&BuildEvent::TaskStarted { task: node.id.clone() });

        let (state, origin, result) = match self.decide(&node, cancel).await {
            Ok((state, origin)) => (state, origin, Ok(state)),
            Err(err) => (TaskState::Failed, None, Err(err)),
        };

        self.listeners.emit(&BuildEvent::TaskFinished {
            task: node.id.clone(),
            state,
            duration: started.elapsed(),
            outputs: node.outputs.clone(),
            origin,
        });
        result
    }

    async fn decide(
        &self,
        node: &Arc<TaskNode>,
        cancel: CancelToken,
    ) -> Result<(TaskState, Option<OriginMetadata>), KilnError> {
        let fingerprint = {
            let engine = self.fingerprints.clone();
            let task = Arc::clone(node);
            match snapshot_blocking(move || engine.fingerprint_of(&task)).await? {
                Ok(fp) => fp,
                Err(message) => {
                    error!(task = %node.id, error = %message, "failed to fingerprint inputs");
                    self.forget(node).await;
                    return Ok((TaskState::Failed, None));
                }
            }
        };

        if self.is_up_to_date(node, &fingerprint).await? {
            info!(task = %node.id, fingerprint = %fingerprint, "task is up to date");
            return Ok((TaskState::UpToDate, None));
        }

        let ctx = TaskContext {
            task_id: node.id.clone(),
            root: self.root.clone(),
            inputs: node.inputs.clone(),
            outputs: node.outputs.clone(),
            cancel,
        };

        if !(node.cacheable && node.has_outputs()) {
            let result = node.action.execute(&ctx).await;
            for output in &node.outputs {
                self.fingerprints.snapshots().invalidate(&output.path);
            }
            return match result {
                Ok(()) => {
                    self.remember(node, fingerprint).await?;
                    Ok((TaskState::Executed, None))
                }
                Err(failure) => {
                    error!(task = %node.id, exit_code = ?failure.exit_code, "{failure}");
                    self.forget(node).await;
                    Ok((TaskState::Failed, None))
                }
            };
        }

        let request = CacheRequest {
            key: fingerprint,
            task: node,
            read: !self.rerun,
            write: true,
        };
        match self
            .cache
            .load_or_compute(request, || node.action.execute(&ctx))
            .await?
        {
            CacheOutcome::Loaded { source, origin } => {
                debug!(task = %node.id, %source, origin_build = %origin.build_invocation_id, "loaded from cache");
                self.remember(node, fingerprint).await?;
                Ok((TaskState::FromCache, Some(origin)))
            }
            CacheOutcome::Computed { duration, stored } => {
                debug!(task = %node.id, duration_ms = duration.as_millis() as u64, stored, "executed task");
                self.remember(node, fingerprint).await?;
                Ok((TaskState::Executed, None))
            }
            CacheOutcome::Failed(failure) => {
                error!(task = %node.id, exit_code = ?failure.exit_code, "{failure}");
                self.forget(node).await;
                Ok((TaskState::Failed, None))
            }
        }
    }

    /// Same fingerprint as the last successful run and untouched outputs.
    async fn is_up_to_date(&self, node: &Arc<TaskNode>, fingerprint: &Fingerprint) -> Result<bool, KilnError> {
        if self.rerun || !node.has_outputs() {
            return Ok(false);
        }
        let record = match self.history.load(node.id.as_str()) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!(task = %node.id, error = %e, "failed to read task history");
                return Ok(false);
            }
        };
        if record.fingerprint != *fingerprint {
            debug!(task = %node.id, previous = %record.fingerprint, current = %fingerprint, "fingerprint changed");
            return Ok(false);
        }
        match self.outputs_hash(node).await? {
            Some(hash) if hash == record.outputs_hash => Ok(true),
            Some(_) => {
                debug!(task = %node.id, "outputs changed since last run");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn outputs_hash(&self, node: &Arc<TaskNode>) -> Result<Option<ContentHash>, KilnError> {
        let engine = self.fingerprints.clone();
        let task = Arc::clone(node);
        match snapshot_blocking(move || engine.outputs_hash(&task)).await? {
            Ok(hash) => Ok(Some(hash)),
            Err(message) => {
                warn!(task = %node.id, error = %message, "failed to snapshot outputs");
                Ok(None)
            }
        }
    }

    /// Record a successful run. Tasks without outputs are never up to date,
    /// so nothing is kept for them.
    async fn remember(&self, node: &Arc<TaskNode>, fingerprint: Fingerprint) -> Result<(), KilnError> {
        if !node.has_outputs() {
            return Ok(());
        }
        let Some(outputs_hash) = self.outputs_hash(node).await? else {
            self.forget(node).await;
            return Ok(());
        };
        let record = TaskRecord {
            fingerprint,
            outputs_hash,
        };
        let history = Arc::clone(&self.history);
        let task = node.id.to_string();
        if let Err(e) = history_blocking(move || history.save(&task, record)).await {
            warn!(task = %node.id, error = %e, "failed to save task history");
        }
        Ok(())
    }

    async fn forget(&self, node: &TaskNode) {
        let history = Arc::clone(&self.history);
        let task = node.id.to_string();
        if let Err(e) = history_blocking(move || history.remove(&task)).await {
            warn!(task = %node.id, error = %e, "failed to clear task history");
        }
    }
}

impl NodeRunner for IncrementalRunner {
    fn run(&self, node: Arc<TaskNode>, cancel: CancelToken) -> NodeFuture {
        Box::pin(self.clone().run_node(node, cancel))
    }
}

/// Run snapshot work on the blocking pool. Integrity errors are fatal; other
/// snapshot failures come back as `Ok(Err(message))` and fail only the task.
async fn snapshot_blocking<T, F>(f: F) -> Result<Result<T, String>, KilnError>
where
    F: FnOnce() -> Result<T, SnapshotError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(Ok(value)),
        Ok(Err(err)) if err.is_integrity() => Err(KilnError::SnapshotIntegrity(err)),
        Ok(Err(err)) => Ok(Err(err.to_string())),
        Err(join) => Err(KilnError::Other(anyhow!("snapshot worker failed: {join}"))),
    }
}

/// Run a history write on the blocking pool.
async fn history_blocking<F>(f: F) -> anyhow::Result<()>
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|join| anyhow!("history worker failed: {join}"))?
}
