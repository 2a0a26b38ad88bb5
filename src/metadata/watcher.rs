//! Per-root file watching with write stabilization.
//!
//! [`DebouncedFileWatcher`] collects raw notify events and holds each path
//! back until it has been quiet for the stabilization delay, so a file still
//! being written is reconciled once rather than on every chunk. Native
//! watching is tried first; paths the native backend rejects (network
//! mounts, some container filesystems) fall back to polling.
//!
//! [`WatcherManager`] runs one such watcher per registered root and feeds
//! every settled path through [`reconcile_path`], publishing the outcome on
//! the change feed. The raw event kind is never consulted: a settled path
//! is stat'ed afresh, under its [`PathTaskQueue`] key.

use crate::config::RootConfig;
use crate::error::WatcherError;
use crate::feed::{relative_to, ChangeKind, ChangeNotification};
use crate::metadata::path_queue::{PathLockKey, PathTaskQueue};
use crate::metadata::reconcile::{reconcile_path, Reconciled, Trigger};
use crate::metadata::store::MetadataStore;
use crate::metadata::tracker::{normalize, OperationTracker};
use notify::{Config, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A path with raw events pending.
#[derive(Debug, Clone, PartialEq)]
pub struct FileChangeEvent {
    pub path: PathBuf,
    /// Time of the most recent raw event for this path.
    pub timestamp: Instant,
}

/// Timing knobs shared by every root's watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    /// Quiet period before a path is reconciled.
    pub stabilization: Duration,
    /// Loop tick, also the interval of the polling fallback.
    pub poll_interval: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            stabilization: Duration::from_millis(200),
            poll_interval: Duration::from_millis(100),
        }
    }
}

type RawEvent = Result<Event, notify::Error>;

/// A recursive watcher that releases paths only after they settle.
pub struct DebouncedFileWatcher {
    native: Option<RecommendedWatcher>,
    poll: Option<PollWatcher>,
    event_tx: Sender<RawEvent>,
    event_rx: Receiver<RawEvent>,
    use_polling_for: HashSet<PathBuf>,
    pending: HashMap<PathBuf, FileChangeEvent>,
    settings: WatchSettings,
}

impl DebouncedFileWatcher {
    pub fn new(settings: WatchSettings) -> Result<Self, WatcherError> {
        let (tx, rx) = channel();
        let native_tx = tx.clone();
        let native = match RecommendedWatcher::new(
            move |res: RawEvent| {
                let _ = native_tx.send(res);
            },
            Config::default().with_compare_contents(false),
        ) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                tracing::warn!(error = %err, "native watcher unavailable, polling only");
                None
            }
        };

        Ok(Self {
            native,
            poll: None,
            event_tx: tx,
            event_rx: rx,
            use_polling_for: HashSet::new(),
            pending: HashMap::new(),
            settings,
        })
    }

    /// Start watching `path` recursively.
    pub fn watch(&mut self, path: &Path) -> Result<(), WatcherError> {
        if let Some(ref mut native) = self.native {
            match native.watch(path, RecursiveMode::Recursive) {
                Ok(()) => {
                    tracing::debug!("Using native watcher for {}", path.display());
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        "Native watcher failed for {}: {}, falling back to polling",
                        path.display(),
                        e
                    );
                }
            }
        }

        tracing::debug!("Using poll watcher for {}", path.display());
        let poll = self.poll_watcher()?;
        poll.watch(path, RecursiveMode::Recursive)
            .map_err(|e| WatcherError::WatchPath {
                path: path.to_path_buf(),
                source: e,
            })?;
        self.use_polling_for.insert(path.to_path_buf());
        Ok(())
    }

    /// Stop watching `path`.
    pub fn unwatch(&mut self, path: &Path) -> Result<(), WatcherError> {
        let result = if self.use_polling_for.remove(path) {
            match self.poll {
                Some(ref mut poll) => poll.unwatch(path),
                None => Ok(()),
            }
        } else if let Some(ref mut native) = self.native {
            native.unwatch(path)
        } else {
            Ok(())
        };
        result.map_err(|e| WatcherError::WatchPath {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn is_using_polling(&self, path: &Path) -> bool {
        self.use_polling_for.contains(path)
    }

    fn poll_watcher(&mut self) -> Result<&mut PollWatcher, WatcherError> {
        let poll = match self.poll.take() {
            Some(poll) => poll,
            None => {
                let tx = self.event_tx.clone();
                PollWatcher::new(
                    move |res: RawEvent| {
                        let _ = tx.send(res);
                    },
                    Config::default()
                        .with_poll_interval(self.settings.poll_interval)
                        .with_compare_contents(false),
                )?
            }
        };
        Ok(self.poll.insert(poll))
    }

    /// Drain raw events into the pending set. Returns how many were read.
    pub fn poll_events(&mut self) -> usize {
        let now = Instant::now();
        let mut count = 0;
        while let Ok(result) = self.event_rx.try_recv() {
            match result {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        continue;
                    }
                    count += 1;
                    for path in event.paths {
                        self.record(path, now);
                    }
                }
                Err(err) => tracing::warn!(error = %err, "watch backend error"),
            }
        }
        count
    }

    /// Fold one raw event into the pending set, restarting the path's quiet period.
    pub fn record(&mut self, path: PathBuf, at: Instant) {
        let path = normalize(&path);
        self.pending
            .entry(path.clone())
            .and_modify(|existing| existing.timestamp = at)
            .or_insert(FileChangeEvent {
                path,
                timestamp: at,
            });
    }

    /// Remove and return every path quiet for at least the stabilization
    /// delay, parents before children.
    pub fn take_settled(&mut self, now: Instant) -> Vec<FileChangeEvent> {
        let stabilization = self.settings.stabilization;
        let ready: Vec<PathBuf> = self
            .pending
            .values()
            .filter(|e| now.saturating_duration_since(e.timestamp) >= stabilization)
            .map(|e| e.path.clone())
            .collect();
        let mut settled: Vec<FileChangeEvent> = ready
            .into_iter()
            .filter_map(|p| self.pending.remove(&p))
            .collect();
        settled.sort_by(|a, b| a.path.cmp(&b.path));
        settled
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

struct RootWatch {
    root: RootConfig,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct ManagerInner {
    store: Arc<MetadataStore>,
    queue: Arc<PathTaskQueue>,
    tracker: OperationTracker,
    feed: broadcast::Sender<ChangeNotification>,
    settings: WatchSettings,
    roots: Mutex<HashMap<String, RootWatch>>,
}

/// Owns one watch loop per registered root.
#[derive(Clone)]
pub struct WatcherManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for WatcherManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherManager")
            .field("settings", &self.inner.settings)
            .field("roots", &self.watched_roots())
            .finish()
    }
}

impl WatcherManager {
    pub fn new(
        store: Arc<MetadataStore>,
        queue: Arc<PathTaskQueue>,
        tracker: OperationTracker,
        feed: broadcast::Sender<ChangeNotification>,
        settings: WatchSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                queue,
                tracker,
                feed,
                settings,
                roots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.inner.feed.subscribe()
    }

    /// Start watching `root`. A root id already being watched is left as is.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_for_root(&self, root: RootConfig) -> Result<(), WatcherError> {
        let mut roots = self.roots();
        if roots.contains_key(&root.id) {
            tracing::debug!(root = %root.id, "watcher already running");
            return Ok(());
        }

        let mut watcher = DebouncedFileWatcher::new(self.inner.settings)?;
        watcher.watch(&root.path)?;
        let polling = watcher.is_using_polling(&root.path);

        let cancel = CancellationToken::new();
        let manager = self.clone();
        let loop_root = root.clone();
        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            manager.watch_loop(watcher, loop_root, loop_cancel).await;
        });

        tracing::info!(root = %root.id, path = %root.path.display(), polling, "watcher started");
        roots.insert(root.id.clone(), RootWatch { root, cancel, task });
        Ok(())
    }

    /// Stop the watcher for `root_id` and wait for its loop to exit.
    /// Returns whether one was running.
    ///
    /// Once this returns no reconciliation for the root is in flight, so
    /// it must not be awaited while holding any of the root's path keys.
    pub async fn stop_for_root(&self, root_id: &str) -> bool {
        let Some(watch) = self.roots().remove(root_id) else {
            return false;
        };
        watch.cancel.cancel();
        if let Err(err) = watch.task.await {
            tracing::warn!(root = %root_id, error = %err, "watch loop ended abnormally");
        }
        tracing::info!(root = %root_id, path = %watch.root.path.display(), "watcher stopped");
        true
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.roots().keys().cloned().collect();
        for id in ids {
            self.stop_for_root(&id).await;
        }
    }

    pub fn is_watching(&self, root_id: &str) -> bool {
        self.roots()
            .get(root_id)
            .is_some_and(|watch| !watch.task.is_finished())
    }

    pub fn watched_roots(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.roots().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn roots(&self) -> std::sync::MutexGuard<'_, HashMap<String, RootWatch>> {
        self.inner.roots.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn watch_loop(
        &self,
        mut watcher: DebouncedFileWatcher,
        root: RootConfig,
        cancel: CancellationToken,
    ) {
        let tick = self.inner.settings.poll_interval;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(tick) => {
                    watcher.poll_events();
                    for event in watcher.take_settled(Instant::now()) {
                        tracing::trace!(path = %event.path.display(), "path settled");
                        self.handle_path(&root, &event.path).await;
                    }
                }
            }
        }
        if let Err(err) = watcher.unwatch(&root.path) {
            tracing::debug!(root = %root.id, error = %err, "unwatch on shutdown failed");
        }
    }

    /// Reconcile one path under `root` and publish the outcome.
    ///
    /// Failures are logged, never returned: one bad path must not stop the
    /// loop for the rest of the tree.
    pub async fn handle_path(&self, root: &RootConfig, path: &Path) -> Option<ChangeNotification> {
        let path = normalize(path);
        let root_path = normalize(&root.path);
        if path == root_path || !path.starts_with(&root_path) {
            return None;
        }
        let rel = relative_to(&root_path, &path)?;
        let key = PathLockKey::for_path(&root.id, &root_path, &path);

        let (tracker, store, path) = (&self.inner.tracker, &self.inner.store, &path);
        let outcome = self
            .inner
            .queue
            .run(key, move || async move {
                let outcome = reconcile_path(
                    store,
                    path,
                    || tracker.take_meta_and_clear(path),
                    Trigger::Event,
                )
                .await;
                if matches!(outcome, Ok(Reconciled::Removed)) {
                    tracker.clear(path);
                }
                outcome
            })
            .await;

        let kind = match outcome {
            Ok(Reconciled::Present { existed: false, .. }) => ChangeKind::Add,
            Ok(Reconciled::Present { existed: true, .. }) => ChangeKind::Change,
            Ok(Reconciled::Removed) => ChangeKind::Delete,
            Ok(Reconciled::Skipped) => return None,
            Err(err) => {
                tracing::warn!(root = %root.id, path = %path.display(), error = %err, "reconciliation failed");
                return None;
            }
        };

        let note = ChangeNotification::new(root.id.clone(), kind, rel);
        // No subscribers is fine.
        let _ = self.inner.feed.send(note.clone());
        Some(note)
    }
}
