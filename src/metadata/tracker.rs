//! Correlates engine-issued mutations with the watch events that confirm them.
//!
//! Each tracked path gets a fallback job: a timer that, unless cancelled by a
//! matching event first, reconciles the path straight from disk. Metadata
//! captured at issue time (a rename's tag, say) rides along with the record
//! and is applied by whichever side resolves it.
//!
//! A fallback job takes its path's [`PathTaskQueue`] key before it claims
//! the record, so it never interleaves with a mutation still in flight.

use crate::error::EngineError;
use crate::metadata::reconcile::{reconcile_path, Reconciled, Trigger};
use crate::metadata::path_queue::PathTaskQueue;
use crate::metadata::record::CarriedMeta;
use crate::metadata::store::MetadataStore;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Options for [`OperationTracker::track`].
#[derive(Debug, Clone, Default)]
pub struct TrackOptions {
    /// Overrides the tracker's default deadline.
    pub timeout: Option<Duration>,
    /// Metadata to apply to each path once it is confirmed.
    pub meta_by_path: HashMap<PathBuf, CarriedMeta>,
}

impl TrackOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn carry(mut self, path: impl AsRef<Path>, meta: CarriedMeta) -> Self {
        self.meta_by_path.insert(normalize(path.as_ref()), meta);
        self
    }
}

/// A pending mutation awaiting confirmation.
#[derive(Debug)]
pub struct TrackedOperation {
    id: u64,
    pub operation: String,
    pub path: PathBuf,
    pub meta: Option<CarriedMeta>,
    pub deadline: Instant,
    cancel: CancellationToken,
}

struct TrackerInner {
    store: Arc<MetadataStore>,
    queue: Arc<PathTaskQueue>,
    default_timeout: Duration,
    records: Mutex<HashMap<PathBuf, TrackedOperation>>,
    next_id: AtomicU64,
}

impl TrackerInner {
    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, TrackedOperation>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove the record for `path` only if it is still the one with `id`.
    fn take_if_current(&self, path: &Path, id: u64) -> Option<TrackedOperation> {
        let mut records = self.records();
        match records.get(path) {
            Some(op) if op.id == id => records.remove(path),
            _ => None,
        }
    }

    async fn reconcile(&self, op: TrackedOperation) -> Result<Reconciled, EngineError> {
        let meta = op.meta;
        reconcile_path(&self.store, &op.path, move || meta, Trigger::Fallback).await
    }
}

/// Short-lived registry of engine-initiated mutations.
///
/// Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct OperationTracker {
    inner: Arc<TrackerInner>,
}

impl std::fmt::Debug for OperationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationTracker")
            .field("default_timeout", &self.inner.default_timeout)
            .field("pending", &self.pending())
            .finish()
    }
}

impl OperationTracker {
    pub fn new(store: Arc<MetadataStore>, queue: Arc<PathTaskQueue>) -> Self {
        Self::with_timeout(store, queue, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        store: Arc<MetadataStore>,
        queue: Arc<PathTaskQueue>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                store,
                queue,
                default_timeout,
                records: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `operation` on every path, replacing any earlier record for
    /// the same path, and arm a fallback job per path.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn track<I, P>(&self, operation: &str, paths: I, options: TrackOptions)
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let timeout = options.timeout.unwrap_or(self.inner.default_timeout);
        for path in paths {
            let path = normalize(path.as_ref());
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let cancel = CancellationToken::new();
            let deadline = Instant::now() + timeout;
            let op = TrackedOperation {
                id,
                operation: operation.to_string(),
                path: path.clone(),
                meta: options.meta_by_path.get(&path).copied(),
                deadline,
                cancel: cancel.clone(),
            };

            if let Some(prev) = self.inner.records().insert(path.clone(), op) {
                prev.cancel.cancel();
            }
            tracing::debug!(path = %path.display(), operation, ?timeout, "tracking operation");

            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {
                        let key = inner.queue.key_for(&path);
                        let (inner, path) = (&inner, &path);
                        inner.queue.run(key, move || async move {
                            let Some(op) = inner.take_if_current(path, id) else {
                                return;
                            };
                            tracing::debug!(
                                path = %op.path.display(),
                                operation = %op.operation,
                                "no confirming event before deadline; reconciling from disk"
                            );
                            if let Err(err) = inner.reconcile(op).await {
                                tracing::error!(path = %path.display(), error = %err, "timeout reconciliation failed");
                            }
                        })
                        .await;
                    }
                }
            });
        }
    }

    /// Resolve the record for `path` from a matching watch event.
    ///
    /// Cancels its fallback job and hands back any carried metadata.
    pub fn take_meta_and_clear(&self, path: &Path) -> Option<CarriedMeta> {
        let op = self.inner.records().remove(&normalize(path))?;
        op.cancel.cancel();
        op.meta
    }

    /// Drop the record for `path` without reconciling it.
    pub fn clear(&self, path: &Path) -> bool {
        match self.inner.records().remove(&normalize(path)) {
            Some(op) => {
                op.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn clear_many<I, P>(&self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        for path in paths {
            self.clear(path.as_ref());
        }
    }

    /// Run the fallback reconciliation now for every tracked path in `paths`.
    ///
    /// Untracked paths are ignored. Every path is attempted; the first
    /// failure, if any, is returned after the rest have run. Takes no path
    /// keys: the engine calls this while already holding them.
    pub async fn sync_now<I, P>(&self, paths: I) -> Result<usize, EngineError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let due: Vec<TrackedOperation> = {
            let mut records = self.inner.records();
            paths
                .into_iter()
                .filter_map(|p| records.remove(&normalize(p.as_ref())))
                .collect()
        };

        let mut first_err = None;
        let mut synced = 0;
        for op in due {
            op.cancel.cancel();
            let path = op.path.clone();
            match self.inner.reconcile(op).await {
                Ok(_) => synced += 1,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "sync_now reconciliation failed");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(synced),
        }
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.inner.records().contains_key(&normalize(path))
    }

    pub fn pending(&self) -> usize {
        self.inner.records().len()
    }
}

/// Lexical normalisation so `a/./b` and `a/b/` address the same record.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
