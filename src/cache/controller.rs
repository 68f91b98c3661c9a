// src/cache/controller.rs

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::entry::{CacheEntry, OriginMetadata};
use super::local::LocalBuildCache;
use super::packer;
use super::remote::RemoteCache;
use super::CacheError;
use crate::action::TaskFailure;
use crate::errors::KilnError;
use crate::fingerprint::Fingerprint;
use crate::fs::FileSystem;
use crate::graph::TaskNode;
use crate::scheduler::KeyedLocks;
use crate::snapshot::SnapshotStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Local,
    Remote,
}

impl std::fmt::Display for CacheSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheSource::Local => f.write_str("local"),
            CacheSource::Remote => f.write_str("remote"),
        }
    }
}

#[derive(Debug)]
pub enum CacheOutcome {
    /// Outputs were restored from a cache entry.
    Loaded {
        source: CacheSource,
        origin: OriginMetadata,
    },
    /// The action ran and succeeded. `stored` tells whether the local tier
    /// holds an entry for this result.
    Computed { duration: Duration, stored: bool },
    /// The action ran and failed. Nothing was stored.
    Failed(TaskFailure),
}

#[derive(Debug, Clone, Copy)]
pub struct CacheRequest<'a> {
    pub key: Fingerprint,
    pub task: &'a TaskNode,
    /// Whether existing entries may be used. Off for forced reruns.
    pub read: bool,
    /// Whether a fresh result may be stored.
    pub write: bool,
}

/// Two-tier build cache for one build invocation.
///
/// Reads go local, then remote (populating local on a hit). Writes go to the
/// local tier before the task finishes and to the remote tier in the
/// background. Disk work runs on the blocking pool. Failures only cost the
/// cache hit, except an integrity failure that repeats for the same key and
/// a fresh result that differs from the entry already stored under its key.
/// Both are fatal.
pub struct BuildCache {
    build_id: String,
    fs: Arc<dyn FileSystem>,
    snapshots: Arc<SnapshotStore>,
    local: Option<LocalBuildCache>,
    remote: Option<Arc<dyn RemoteCache>>,
    push: bool,
    remote_disabled: Arc<AtomicBool>,
    key_locks: KeyedLocks<Fingerprint>,
    integrity_failures: Mutex<HashMap<Fingerprint, u32>>,
    pending_pushes: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for BuildCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildCache")
            .field("build_id", &self.build_id)
            .field("local", &self.local.as_ref().map(|l| l.root().to_path_buf()))
            .field("remote", &self.remote.as_ref().map(|r| r.describe()))
            .field("push", &self.push)
            .finish_non_exhaustive()
    }
}

impl BuildCache {
    pub fn new(build_id: impl Into<String>, snapshots: Arc<SnapshotStore>, local: Option<LocalBuildCache>) -> Self {
        Self {
            build_id: build_id.into(),
            fs: Arc::clone(snapshots.filesystem()),
            snapshots,
            local,
            remote: None,
            push: false,
            remote_disabled: Arc::new(AtomicBool::new(false)),
            key_locks: KeyedLocks::new(),
            integrity_failures: Mutex::new(HashMap::new()),
            pending_pushes: Mutex::new(Vec::new()),
        }
    }

    /// A cache with no tiers: every request computes.
    pub fn disabled(build_id: impl Into<String>, snapshots: Arc<SnapshotStore>) -> Self {
        Self::new(build_id, snapshots, None)
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteCache>, push: bool) -> Self {
        self.remote = Some(remote);
        self.push = push;
        self
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn is_enabled(&self) -> bool {
        self.local.is_some() || self.remote.is_some()
    }

    pub fn local(&self) -> Option<&LocalBuildCache> {
        self.local.as_ref()
    }

    /// `false` once the circuit breaker has tripped.
    pub fn remote_available(&self) -> bool {
        self.active_remote().is_some()
    }

    fn active_remote(&self) -> Option<&Arc<dyn RemoteCache>> {
        if self.remote_disabled.load(Ordering::SeqCst) {
            None
        } else {
            self.remote.as_ref()
        }
    }

    /// Restore the task's outputs from the cache, or run `compute` and store
    /// the result.
    ///
    /// Requests for the same key are serialised, so a second task with the
    /// same fingerprint observes the entry the first one stored.
    pub async fn load_or_compute<F, Fut>(&self, request: CacheRequest<'_>, compute: F) -> Result<CacheOutcome, KilnError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), TaskFailure>>,
    {
        let key = request.key;
        let task = request.task;
        let _guard = self.key_locks.acquire(&key).await;

        if request.read && self.is_enabled() {
            if let Some(origin) = self.try_local(key, task).await? {
                return Ok(CacheOutcome::Loaded {
                    source: CacheSource::Local,
                    origin,
                });
            }
            if let Some(origin) = self.try_remote(key, task).await? {
                return Ok(CacheOutcome::Loaded {
                    source: CacheSource::Remote,
                    origin,
                });
            }
        }

        let started = Instant::now();
        let result = compute().await;
        let duration = started.elapsed();
        self.invalidate_outputs(task);

        if let Err(failure) = result {
            return Ok(CacheOutcome::Failed(failure));
        }
        let stored = if request.write {
            self.store(key, task, duration).await?
        } else {
            false
        };
        Ok(CacheOutcome::Computed { duration, stored })
    }

    async fn try_local(&self, key: Fingerprint, task: &TaskNode) -> Result<Option<OriginMetadata>, KilnError> {
        let Some(local) = self.local.clone() else {
            return Ok(None);
        };
        let archive = match blocking(move || local.load(&key)).await {
            Ok(Some(archive)) => archive,
            Ok(None) => return Ok(None),
            Err(err) => {
                self.read_failed(key, task, CacheSource::Local, err).await?;
                return Ok(None);
            }
        };
        match self.restore(key, task, archive).await {
            Ok((origin, _)) => {
                info!(task = %task.id, key = %key, "restored outputs from local cache");
                Ok(Some(origin))
            }
            Err(err) => {
                self.read_failed(key, task, CacheSource::Local, err).await?;
                Ok(None)
            }
        }
    }

    async fn try_remote(&self, key: Fingerprint, task: &TaskNode) -> Result<Option<OriginMetadata>, KilnError> {
        let Some(remote) = self.active_remote() else {
            return Ok(None);
        };
        let archive = match remote.load(&key).await {
            Ok(Some(archive)) => archive,
            Ok(None) => return Ok(None),
            Err(err) => {
                self.read_failed(key, task, CacheSource::Remote, err).await?;
                return Ok(None);
            }
        };
        let (origin, archive) = match self.restore(key, task, archive).await {
            Ok(restored) => restored,
            Err(err) if err.is_integrity() => {
                self.read_failed(key, task, CacheSource::Remote, err).await?;
                return Ok(None);
            }
            Err(err) => {
                // The download worked; writing the outputs did not.
                warn!(task = %task.id, key = %key, error = %err, "failed to restore remote cache entry; treating as a miss");
                return Ok(None);
            }
        };
        if let Some(local) = self.local.clone() {
            if let Err(e) = blocking(move || local.store(&key, &archive)).await {
                warn!(task = %task.id, key = %key, error = %e, "failed to populate local cache from remote");
            }
        }
        info!(task = %task.id, key = %key, remote = %remote.describe(), "restored outputs from remote cache");
        Ok(Some(origin))
    }

    /// Verify and unpack `archive` into the task's outputs. Hands the archive
    /// back on success.
    async fn restore(
        &self,
        key: Fingerprint,
        task: &TaskNode,
        archive: Vec<u8>,
    ) -> Result<(OriginMetadata, Vec<u8>), CacheError> {
        let fs = Arc::clone(&self.fs);
        let outputs = task.outputs.clone();
        let result = blocking(move || {
            packer::unpack(&key, &archive, &outputs, fs.as_ref()).map(|(_, origin)| (origin, archive))
        })
        .await;
        // Outputs may have been rewritten even if a late write failed.
        self.invalidate_outputs(task);
        result
    }

    /// Degrade a read failure to a miss. Integrity failures evict the local
    /// entry; the second one for the same key is fatal. Transport failures
    /// from the remote trip the breaker.
    async fn read_failed(
        &self,
        key: Fingerprint,
        task: &TaskNode,
        source: CacheSource,
        err: CacheError,
    ) -> Result<(), KilnError> {
        if !err.is_integrity() {
            warn!(task = %task.id, key = %key, %source, error = %err, "cache read failed; treating as a miss");
            if source == CacheSource::Remote {
                trip_breaker(&self.remote_disabled, &err);
            }
            return Ok(());
        }

        if source == CacheSource::Local {
            if let Some(local) = self.local.clone() {
                if let Err(e) = blocking(move || local.evict(&key)).await {
                    warn!(key = %key, error = %e, "failed to evict corrupt cache entry");
                }
            }
        }

        let failures = {
            let mut map = self
                .integrity_failures
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let count = map.entry(key).or_insert(0);
            *count += 1;
            *count
        };
        if failures >= 2 {
            return Err(KilnError::CacheIntegrity {
                key: key.to_hex(),
                reason: err.to_string(),
            });
        }
        warn!(task = %task.id, key = %key, %source, error = %err, "corrupt cache entry; recomputing");
        Ok(())
    }

    /// Pack and store fresh outputs. Returns whether the local tier now
    /// holds an entry for them. Only a key collision fails the task.
    async fn store(&self, key: Fingerprint, task: &TaskNode, duration: Duration) -> Result<bool, KilnError> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let origin = OriginMetadata::new(&self.build_id, task.id.as_str(), &key, duration);
        let fs = Arc::clone(&self.fs);
        let outputs = task.outputs.clone();
        let entry = match blocking(move || packer::pack(&key, &outputs, &origin, fs.as_ref())).await {
            Ok(entry) => Arc::new(entry),
            Err(e) => {
                warn!(task = %task.id, key = %key, error = %e, "failed to pack outputs; result not cached");
                return Ok(false);
            }
        };

        let stored = match self.local.clone() {
            Some(local) => {
                let pending = Arc::clone(&entry);
                match blocking(move || commit_local(&local, &pending)).await {
                    Ok(()) => true,
                    Err(err) if err.is_integrity() => {
                        error!(task = %task.id, key = %key, error = %err, "cache key collision");
                        return Err(KilnError::CacheIntegrity {
                            key: key.to_hex(),
                            reason: err.to_string(),
                        });
                    }
                    Err(err) => {
                        warn!(task = %task.id, key = %key, error = %err, "failed to store local cache entry");
                        false
                    }
                }
            }
            None => false,
        };

        if self.push {
            if let Some(remote) = self.active_remote() {
                let packed = Arc::try_unwrap(entry)
                    .map(|entry| entry.packed)
                    .unwrap_or_else(|shared| shared.packed.clone());
                self.spawn_push(Arc::clone(remote), key, packed);
            }
        }
        debug!(task = %task.id, key = %key, stored, "cache store finished");
        Ok(stored)
    }

    fn spawn_push(&self, remote: Arc<dyn RemoteCache>, key: Fingerprint, archive: Vec<u8>) {
        let breaker = Arc::clone(&self.remote_disabled);
        let handle = tokio::spawn(async move {
            if breaker.load(Ordering::SeqCst) {
                return;
            }
            match remote.store(&key, archive).await {
                Ok(()) => debug!(key = %key, "pushed cache entry"),
                Err(err) => {
                    warn!(key = %key, error = %err, "failed to push cache entry");
                    trip_breaker(&breaker, &err);
                }
            }
        });
        self.pending_pushes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Wait for background pushes to finish.
    pub async fn flush(&self) {
        let handles = std::mem::take(
            &mut *self
                .pending_pushes
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        if handles.is_empty() {
            return;
        }
        debug!(pending = handles.len(), "waiting for remote cache pushes");
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "remote cache push task failed");
            }
        }
    }

    fn invalidate_outputs(&self, task: &TaskNode) {
        for output in &task.outputs {
            self.snapshots.invalidate(&output.path);
        }
    }
}

/// Write `entry` to the local tier. An entry already stored under the key
/// must describe the same output content; otherwise the key collided and
/// the existing entry is left alone.
fn commit_local(local: &LocalBuildCache, entry: &CacheEntry) -> Result<(), CacheError> {
    let key = &entry.key;
    match local.load(key) {
        Ok(None) => {}
        Ok(Some(existing)) => match packer::read_manifest(key, &existing) {
            Ok(manifest) if manifest == entry.manifest => {
                debug!(key = %key, "identical local cache entry already present");
                return Ok(());
            }
            Ok(_) => {
                return Err(CacheError::integrity(
                    key,
                    "stored entry holds different output content for the same key",
                ));
            }
            Err(err) => {
                warn!(key = %key, error = %err, "replacing unreadable local cache entry");
                local.evict(key)?;
            }
        },
        Err(err) if err.is_integrity() => {
            warn!(key = %key, error = %err, "replacing corrupt local cache entry");
            local.evict(key)?;
        }
        Err(err) => return Err(err),
    }
    local.store(key, &entry.packed)
}

/// Run cache disk work on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, CacheError>
where
    F: FnOnce() -> Result<T, CacheError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(join) => Err(CacheError::Io(format!("cache worker failed: {join}"))),
    }
}

/// Disable the remote for the rest of the build after a transport failure.
fn trip_breaker(flag: &AtomicBool, err: &CacheError) {
    if matches!(err, CacheError::Io(_) | CacheError::Timeout(_)) && !flag.swap(true, Ordering::SeqCst) {
        warn!(error = %err, "remote cache unreachable; disabling it for the rest of this build");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::FnAction;
    use crate::fs::mock::MockFileSystem;
    use crate::graph::{OutputSpec, TaskDeclaration, TaskId};
    use crate::hash::ContentHash;
    use crate::cache::RemoteFuture;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    fn key(seed: &[u8]) -> Fingerprint {
        Fingerprint::from_hash(ContentHash::of_bytes(seed))
    }

    fn task() -> TaskNode {
        TaskDeclaration::new(TaskId::new("compile").unwrap(), FnAction::new("c", |_| Ok(())))
            .output(OutputSpec::new("obj", "/p/out/main.o"))
            .into_node()
    }

    fn setup() -> (Arc<MockFileSystem>, BuildCache) {
        let mock = Arc::new(MockFileSystem::new());
        let fs: Arc<dyn FileSystem> = mock.clone();
        let snapshots = Arc::new(SnapshotStore::new(Arc::clone(&fs)));
        let local = LocalBuildCache::new("/cache", fs);
        (mock, BuildCache::new("build-1", snapshots, Some(local)))
    }

    fn request(task: &TaskNode, k: Fingerprint) -> CacheRequest<'_> {
        CacheRequest {
            key: k,
            task,
            read: true,
            write: true,
        }
    }

    #[tokio::test]
    async fn second_request_loads_from_local() {
        let (fs, cache) = setup();
        let task = task();
        let calls = AtomicUsize::new(0);
        let compute = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            fs.add_file("/p/out/main.o", "obj");
            Ok(())
        };

        let first = cache.load_or_compute(request(&task, key(b"k")), compute).await.unwrap();
        assert!(matches!(first, CacheOutcome::Computed { stored: true, .. }));

        fs.remove_all(Path::new("/p/out/main.o")).unwrap();
        let second = cache
            .load_or_compute(request(&task, key(b"k")), || async { Ok(()) })
            .await
            .unwrap();
        match second {
            CacheOutcome::Loaded { source, origin } => {
                assert_eq!(source, CacheSource::Local);
                assert_eq!(origin.task_id, "compile");
                assert_eq!(origin.build_invocation_id, "build-1");
            }
            other => panic!("expected a cache hit, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fs.read_bytes("/p/out/main.o").unwrap(), b"obj");
    }

    #[tokio::test]
    async fn failures_are_not_stored() {
        let (_fs, cache) = setup();
        let task = task();
        let outcome = cache
            .load_or_compute(request(&task, key(b"k")), || async { Err(TaskFailure::new("boom")) })
            .await
            .unwrap();
        assert!(matches!(outcome, CacheOutcome::Failed(_)));
        assert!(!cache.local().unwrap().contains(&key(b"k")));
    }

    #[tokio::test]
    async fn rerun_skips_reads_but_still_stores() {
        let (fs, cache) = setup();
        let task = task();
        fs.add_file("/p/out/main.o", "obj");
        cache
            .load_or_compute(request(&task, key(b"k")), || async { Ok(()) })
            .await
            .unwrap();

        let mut rerun = request(&task, key(b"k"));
        rerun.read = false;
        let outcome = cache.load_or_compute(rerun, || async { Ok(()) }).await.unwrap();
        assert!(matches!(outcome, CacheOutcome::Computed { stored: true, .. }));
    }

    #[tokio::test]
    async fn different_content_under_a_stored_key_is_fatal() {
        let (fs, cache) = setup();
        let task = task();
        let k = key(b"k");
        fs.add_file("/p/out/main.o", "first");
        let first = cache.load_or_compute(request(&task, k), || async { Ok(()) }).await.unwrap();
        assert!(matches!(first, CacheOutcome::Computed { stored: true, .. }));

        let mut rerun = request(&task, k);
        rerun.read = false;
        let err = cache
            .load_or_compute(rerun, || async {
                fs.add_file("/p/out/main.o", "SECOND-different");
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::CacheIntegrity { .. }), "{err}");
        assert!(err.is_fatal());

        let kept = cache.local().unwrap().load(&k).unwrap().unwrap();
        let manifest = packer::read_manifest(&k, &kept).unwrap();
        assert_eq!(manifest.outputs["obj"].files[0].hash, ContentHash::of_bytes(b"first"));
    }

    #[tokio::test]
    async fn corrupt_local_entry_is_evicted_then_recomputed() {
        let (fs, cache) = setup();
        let task = task();
        let k = key(b"k");
        let local = cache.local().unwrap().clone();
        local.store(&k, b"not an archive").unwrap();

        fs.add_file("/p/out/main.o", "fresh");
        let outcome = cache
            .load_or_compute(request(&task, k), || async { Ok(()) })
            .await
            .unwrap();
        assert!(matches!(outcome, CacheOutcome::Computed { stored: true, .. }));
        assert!(local.load(&k).unwrap().is_some());
    }

    #[tokio::test]
    async fn repeated_integrity_failure_is_fatal() {
        let (_fs, cache) = setup();
        let task = task();
        let k = key(b"k");
        let local = cache.local().unwrap().clone();

        local.store(&k, b"garbage").unwrap();
        cache
            .load_or_compute(request(&task, k), || async { Err(TaskFailure::new("x")) })
            .await
            .unwrap();

        local.store(&k, b"garbage again").unwrap();
        let err = cache
            .load_or_compute(request(&task, k), || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::CacheIntegrity { .. }), "{err}");
    }

    struct UnreachableRemote {
        calls: AtomicUsize,
    }

    impl RemoteCache for UnreachableRemote {
        fn load<'a>(&'a self, _key: &'a Fingerprint) -> RemoteFuture<'a, Option<Vec<u8>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(CacheError::Timeout(Duration::from_millis(1))) })
        }

        fn store<'a>(&'a self, _key: &'a Fingerprint, _archive: Vec<u8>) -> RemoteFuture<'a, ()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(CacheError::Io("connection refused".into())) })
        }

        fn describe(&self) -> String {
            "unreachable".into()
        }
    }

    #[tokio::test]
    async fn remote_failure_trips_breaker() {
        let (fs, cache) = setup();
        let remote = Arc::new(UnreachableRemote {
            calls: AtomicUsize::new(0),
        });
        let cache = cache.with_remote(remote.clone(), true);
        let task = task();
        fs.add_file("/p/out/main.o", "obj");

        let outcome = cache
            .load_or_compute(request(&task, key(b"a")), || async { Ok(()) })
            .await
            .unwrap();
        assert!(matches!(outcome, CacheOutcome::Computed { stored: true, .. }));
        cache.flush().await;
        assert!(!cache.remote_available());

        cache
            .load_or_compute(request(&task, key(b"b")), || async { Ok(()) })
            .await
            .unwrap();
        cache.flush().await;
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    }

    /// Serves one fixed archive for every key.
    struct ArchiveRemote {
        archive: Vec<u8>,
        loads: AtomicUsize,
    }

    impl RemoteCache for ArchiveRemote {
        fn load<'a>(&'a self, _key: &'a Fingerprint) -> RemoteFuture<'a, Option<Vec<u8>>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let archive = self.archive.clone();
            Box::pin(async move { Ok(Some(archive)) })
        }

        fn store<'a>(&'a self, _key: &'a Fingerprint, _archive: Vec<u8>) -> RemoteFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn describe(&self) -> String {
            "fixed".into()
        }
    }

    /// Mock filesystem that records the calling thread and can refuse
    /// every write.
    #[derive(Debug)]
    struct InspectingFs {
        inner: MockFileSystem,
        read_only: bool,
        threads: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl InspectingFs {
        fn new(read_only: bool) -> Self {
            Self {
                inner: MockFileSystem::new(),
                read_only,
                threads: Mutex::new(Vec::new()),
            }
        }

        fn seen(&self) {
            self.threads.lock().unwrap().push(std::thread::current().id());
        }

        fn check_writable(&self, path: &Path) -> anyhow::Result<()> {
            self.seen();
            if self.read_only {
                return Err(anyhow::anyhow!("read-only file system: {path:?}"));
            }
            Ok(())
        }
    }

    impl FileSystem for InspectingFs {
        fn read_to_string(&self, path: &Path) -> anyhow::Result<String> {
            self.seen();
            self.inner.read_to_string(path)
        }
        fn open_read(&self, path: &Path) -> anyhow::Result<Box<dyn std::io::Read + Send>> {
            self.seen();
            self.inner.open_read(path)
        }
        fn write(&self, path: &Path, contents: &[u8]) -> anyhow::Result<()> {
            self.check_writable(path)?;
            self.inner.write(path, contents)
        }
        fn exists(&self, path: &Path) -> bool {
            self.seen();
            self.inner.exists(path)
        }
        fn is_file(&self, path: &Path) -> bool {
            self.seen();
            self.inner.is_file(path)
        }
        fn is_dir(&self, path: &Path) -> bool {
            self.seen();
            self.inner.is_dir(path)
        }
        fn canonicalize(&self, path: &Path) -> anyhow::Result<std::path::PathBuf> {
            self.inner.canonicalize(path)
        }
        fn read_dir(&self, path: &Path) -> anyhow::Result<Vec<std::path::PathBuf>> {
            self.seen();
            self.inner.read_dir(path)
        }
        fn metadata(&self, path: &Path) -> anyhow::Result<Option<crate::fs::FileStamp>> {
            self.seen();
            self.inner.metadata(path)
        }
        fn create_dir_all(&self, path: &Path) -> anyhow::Result<()> {
            self.check_writable(path)?;
            self.inner.create_dir_all(path)
        }
        fn remove_all(&self, path: &Path) -> anyhow::Result<()> {
            self.seen();
            self.inner.remove_all(path)
        }
        fn rename(&self, from: &Path, to: &Path) -> anyhow::Result<()> {
            self.check_writable(to)?;
            self.inner.rename(from, to)
        }
    }

    #[tokio::test]
    async fn cache_disk_work_stays_off_the_runtime_thread() {
        let fs = Arc::new(InspectingFs::new(false));
        let shared: Arc<dyn FileSystem> = fs.clone();
        let snapshots = Arc::new(SnapshotStore::new(Arc::clone(&shared)));
        let cache = BuildCache::new("build-1", snapshots, Some(LocalBuildCache::new("/cache", shared)));
        let task = task();

        fs.inner.add_file("/p/out/main.o", "obj");
        cache
            .load_or_compute(request(&task, key(b"k")), || async { Ok(()) })
            .await
            .unwrap();
        fs.inner.remove_all(Path::new("/p/out/main.o")).unwrap();
        let hit = cache
            .load_or_compute(request(&task, key(b"k")), || async { Ok(()) })
            .await
            .unwrap();
        assert!(matches!(hit, CacheOutcome::Loaded { .. }));

        let threads = fs.threads.lock().unwrap().clone();
        assert!(!threads.is_empty());
        assert!(!threads.contains(&std::thread::current().id()));
    }

    #[tokio::test]
    async fn failed_restore_of_a_remote_entry_keeps_the_remote() {
        let source = MockFileSystem::new();
        source.add_file("/p/out/main.o", "obj");
        let task = task();
        let origin = OriginMetadata::new("build-0", "compile", &key(b"a"), Duration::from_millis(5));
        let archive = packer::pack(&key(b"a"), &task.outputs, &origin, &source)
            .unwrap()
            .packed;

        let fs: Arc<dyn FileSystem> = Arc::new(InspectingFs::new(true));
        let snapshots = Arc::new(SnapshotStore::new(fs));
        let remote = Arc::new(ArchiveRemote {
            archive,
            loads: AtomicUsize::new(0),
        });
        let cache = BuildCache::new("build-1", snapshots, None).with_remote(remote.clone(), false);

        for seed in [&b"a"[..], &b"b"[..]] {
            let outcome = cache
                .load_or_compute(request(&task, key(seed)), || async { Ok(()) })
                .await
                .unwrap();
            assert!(matches!(outcome, CacheOutcome::Computed { stored: false, .. }), "{outcome:?}");
            assert!(cache.remote_available());
        }
        assert_eq!(remote.loads.load(Ordering::SeqCst), 2);
    }
}
