//! The engine: one owned instance of each component, wired together, and
//! the tree mutations the UI layer issues through it.
//!
//! Every mutation follows the same shape. Resolve root-relative input to
//! absolute paths inside the root, take the path keys of everything it
//! touches, register the affected paths with the tracker (carrying any
//! metadata the destination should inherit), perform the filesystem work,
//! then reconcile the tracked paths immediately instead of waiting for the
//! watcher or the fallback timer.

use crate::config::{EngineConfig, RootConfig};
use crate::error::EngineError;
use crate::feed::{relative_to, ChangeNotification};
use crate::metadata::reconcile::created_at;
use crate::metadata::scan::{self, DirEntry};
use crate::metadata::tracker::normalize;
use crate::metadata::{
    LevelTag, MetadataRecord, MetadataStore, OperationTracker, PathLockKey, PathTaskQueue,
    RecordWrite, TrackOptions, WatchSettings, WatcherManager, WriteMode,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

/// `rename(2)` across filesystems.
const EXDEV: i32 = 18;

/// A source and destination pair from a move or copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relocation {
    pub from: PathBuf,
    pub to: PathBuf,
}

/// One stored path and the time it sorts under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimedEntry {
    pub full_path: PathBuf,
    pub relative_path: String,
    pub time: DateTime<Utc>,
}

pub struct MetadataEngine {
    config: EngineConfig,
    store: Arc<MetadataStore>,
    queue: Arc<PathTaskQueue>,
    tracker: OperationTracker,
    watchers: WatcherManager,
    roots: RwLock<HashMap<String, RootConfig>>,
}

impl std::fmt::Debug for MetadataEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataEngine")
            .field("store", &self.store)
            .field("tracker", &self.tracker)
            .field("watchers", &self.watchers)
            .finish_non_exhaustive()
    }
}

impl MetadataEngine {
    /// Open the store named by `config` and build the engine around it.
    ///
    /// No root is registered yet; see [`MetadataEngine::start`].
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let store = if config.database_path == Path::new(":memory:") {
            MetadataStore::open_in_memory()?
        } else {
            MetadataStore::open(&config.database_path)?
        };
        Ok(Self::with_store(Arc::new(store), config))
    }

    pub fn with_store(store: Arc<MetadataStore>, config: EngineConfig) -> Self {
        let queue = Arc::new(PathTaskQueue::new());
        let tracker = OperationTracker::with_timeout(
            Arc::clone(&store),
            Arc::clone(&queue),
            config.tracker_timeout(),
        );
        let (feed, _) = broadcast::channel(config.feed_buffer.max(1));
        let settings = WatchSettings {
            stabilization: config.stabilization(),
            poll_interval: config.poll_interval(),
        };
        let watchers = WatcherManager::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            tracker.clone(),
            feed,
            settings,
        );
        Self {
            config,
            store,
            queue,
            tracker,
            watchers,
            roots: RwLock::new(HashMap::new()),
        }
    }

    /// Register every configured root. A root that fails to register is
    /// logged and skipped; returns how many succeeded.
    pub async fn start(&self) -> usize {
        let mut started = 0;
        for root in self.config.roots.clone() {
            let id = root.id.clone();
            match self.register_root(root).await {
                Ok(_) => started += 1,
                Err(err) => tracing::error!(root = %id, error = %err, "failed to register root"),
            }
        }
        started
    }

    /// Stop every watcher and wait for in-flight reconciliations to end.
    pub async fn shutdown(&self) {
        self.watchers.stop_all().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.watchers.subscribe()
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn tracker(&self) -> &OperationTracker {
        &self.tracker
    }

    pub fn queue(&self) -> &Arc<PathTaskQueue> {
        &self.queue
    }

    pub fn watchers(&self) -> &WatcherManager {
        &self.watchers
    }

    // ---- roots ----

    /// Scan `root` into the store and start watching it. The root becomes
    /// visible to other operations only once both have succeeded.
    pub async fn register_root(&self, mut root: RootConfig) -> Result<RootConfig, EngineError> {
        let meta = tokio::fs::metadata(&root.path)
            .await
            .map_err(|e| EngineError::io(&root.path, e))?;
        if !meta.is_dir() {
            return Err(EngineError::NotADirectory { path: root.path });
        }
        root.path = normalize(&root.path);
        if root.name.is_empty() {
            root.name = RootConfig::new(&root.id, &root.path).name;
        }

        scan::scan_root(&self.store, &root.path).await?;
        self.queue.add_root(&root.id, &root.path);
        if let Err(err) = self.watchers.start_for_root(root.clone()) {
            self.queue.remove_root(&root.id);
            return Err(err.into());
        }
        self.roots_mut().insert(root.id.clone(), root.clone());
        tracing::info!(root = %root.id, path = %root.path.display(), "root registered");
        Ok(root)
    }

    /// Stop watching the root and drop its rows. Returns the rows removed.
    pub async fn unregister_root(&self, root_id: &str) -> Result<usize, EngineError> {
        let root = self
            .roots_mut()
            .remove(root_id)
            .ok_or_else(|| EngineError::UnknownRoot(root_id.to_string()))?;
        // Stopped before taking keys: the loop may be waiting on one.
        self.watchers.stop_for_root(root_id).await;
        let keys = lock_keys(&root, [root.path.as_path()]);
        let purged = self
            .queue
            .run(keys, || self.store.purge_root(&root.path))
            .await?;
        self.queue.remove_root(root_id);
        tracing::info!(root = %root_id, purged, "root unregistered");
        Ok(purged)
    }

    pub fn roots(&self) -> Vec<RootConfig> {
        let mut roots: Vec<RootConfig> = self.roots_ref().values().cloned().collect();
        roots.sort_by(|a, b| a.id.cmp(&b.id));
        roots
    }

    pub fn root(&self, root_id: &str) -> Result<RootConfig, EngineError> {
        self.roots_ref()
            .get(root_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownRoot(root_id.to_string()))
    }

    fn roots_ref(&self) -> RwLockReadGuard<'_, HashMap<String, RootConfig>> {
        self.roots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn roots_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, RootConfig>> {
        self.roots.write().unwrap_or_else(|e| e.into_inner())
    }

    // ---- reads ----

    /// Re-scan a registered root on demand.
    pub async fn scan_root(&self, root_id: &str) -> Result<usize, EngineError> {
        let root = self.root(root_id)?;
        scan::scan_root(&self.store, &root.path).await
    }

    pub async fn list_directory(
        &self,
        root_id: &str,
        rel: impl AsRef<Path>,
    ) -> Result<Vec<DirEntry>, EngineError> {
        let root = self.root(root_id)?;
        let dir = resolve(&root, rel)?;
        let keys = lock_keys(&root, [dir.as_path()]);
        self.queue
            .run(keys, || scan::list_directory(&self.store, &root.path, &dir))
            .await
    }

    /// Every stored entry under the root with the time it is bucketed by:
    /// its custom time, else its creation time. Entries no longer on disk
    /// are left out.
    pub async fn time_buckets(&self, root_id: &str) -> Result<Vec<TimedEntry>, EngineError> {
        let root = self.root(root_id)?;
        let rows = self.store.list_by_root(&root.path).await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            if row.path == root.path {
                continue;
            }
            let time = match row.custom_time {
                Some(time) => time,
                None => match tokio::fs::metadata(&row.path).await {
                    Ok(meta) => match created_at(&meta) {
                        Some(time) => time,
                        None => continue,
                    },
                    Err(err) => {
                        tracing::debug!(path = %row.path.display(), error = %err, "skipping bucket entry");
                        continue;
                    }
                },
            };
            let Some(relative_path) = relative_to(&root.path, &row.path) else {
                continue;
            };
            entries.push(TimedEntry {
                full_path: row.path,
                relative_path,
                time,
            });
        }
        Ok(entries)
    }

    // ---- explicit metadata ----

    pub async fn set_level_tag<P: AsRef<Path>>(
        &self,
        root_id: &str,
        rels: &[P],
        tag: Option<LevelTag>,
    ) -> Result<(), EngineError> {
        let root = self.root(root_id)?;
        let paths = resolve_all(&root, rels)?;
        let keys = lock_keys(&root, paths.iter().map(PathBuf::as_path));
        self.queue
            .run(keys, || self.store.set_level_tag(&paths, tag))
            .await?;
        Ok(())
    }

    pub async fn set_custom_time<P: AsRef<Path>>(
        &self,
        root_id: &str,
        rels: &[P],
        time: Option<DateTime<Utc>>,
    ) -> Result<(), EngineError> {
        let root = self.root(root_id)?;
        let paths = resolve_all(&root, rels)?;
        let keys = lock_keys(&root, paths.iter().map(PathBuf::as_path));
        self.queue
            .run(keys, || self.store.set_custom_time(&paths, time))
            .await?;
        Ok(())
    }

    // ---- tree mutations ----

    pub async fn create_folder(
        &self,
        root_id: &str,
        rel: impl AsRef<Path>,
        name: &str,
    ) -> Result<PathBuf, EngineError> {
        let root = self.root(root_id)?;
        validate_name(name)?;
        let parent = resolve(&root, rel)?;
        let target = resolve_entry(&root, parent.join(name))?;
        let keys = lock_keys(&root, [target.as_path()]);
        self.queue
            .run(keys, || self.create_folder_locked(&target))
            .await?;
        Ok(target)
    }

    async fn create_folder_locked(&self, target: &Path) -> Result<(), EngineError> {
        if tokio::fs::symlink_metadata(target).await.is_ok() {
            return Err(EngineError::AlreadyExists {
                path: target.to_path_buf(),
            });
        }
        self.tracker.track("create", [target], TrackOptions::default());
        if let Err(err) = tokio::fs::create_dir_all(target).await {
            self.tracker.clear(target);
            return Err(EngineError::io(target, err));
        }
        let touched = [target.to_path_buf()];
        self.finish(1, 1, &touched, Vec::new(), None).await
    }

    /// Rename one entry in place, carrying its tag and time to the new name.
    pub async fn rename(
        &self,
        root_id: &str,
        rel: impl AsRef<Path>,
        new_name: &str,
    ) -> Result<PathBuf, EngineError> {
        let root = self.root(root_id)?;
        validate_name(new_name)?;
        let source = resolve_entry(&root, rel)?;
        let parent = source.parent().unwrap_or(root.path.as_path());
        let target = resolve_entry(&root, parent.join(new_name))?;
        if target == source {
            return Ok(target);
        }

        let keys = lock_keys(&root, [source.as_path(), target.as_path()]);
        let pair = [Relocation {
            from: source,
            to: target.clone(),
        }];
        self.queue
            .run(keys, || self.relocate_all("rename", &pair))
            .await?;
        Ok(target)
    }

    /// Move entries into `dest_rel`, keeping their names and metadata.
    pub async fn move_entries<P: AsRef<Path>>(
        &self,
        root_id: &str,
        rels: &[P],
        dest_rel: impl AsRef<Path>,
    ) -> Result<Vec<Relocation>, EngineError> {
        let root = self.root(root_id)?;
        let dest_base = resolve(&root, dest_rel)?;
        let pairs = plan_relocations(&root, rels, &dest_base)?;
        let keys = relocation_keys(&root, &dest_base, &pairs);
        self.queue
            .run(keys, || self.move_locked(&dest_base, &pairs))
            .await?;
        Ok(pairs)
    }

    async fn move_locked(&self, dest_base: &Path, pairs: &[Relocation]) -> Result<(), EngineError> {
        tokio::fs::create_dir_all(dest_base)
            .await
            .map_err(|e| EngineError::io(dest_base, e))?;
        self.relocate_all("move", pairs).await
    }

    /// Move each pair in order. Stops at the first failure; if anything
    /// moved before it, the caller gets `SyncRequired`.
    async fn relocate_all(&self, operation: &str, pairs: &[Relocation]) -> Result<(), EngineError> {
        let mut done = 0;
        let mut failure = None;
        for pair in pairs {
            if pair.from == pair.to {
                done += 1;
                continue;
            }
            match self.relocate(operation, &pair.from, &pair.to).await {
                Ok(()) => done += 1,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        let touched: Vec<PathBuf> = pairs[..done]
            .iter()
            .flat_map(|p| [p.from.clone(), p.to.clone()])
            .collect();
        let pending = pairs[done..].iter().map(|p| p.from.clone()).collect();
        self.finish(pairs.len(), done, &touched, pending, failure)
            .await
    }

    async fn relocate(&self, operation: &str, from: &Path, to: &Path) -> Result<(), EngineError> {
        if tokio::fs::symlink_metadata(to).await.is_ok() {
            return Err(EngineError::AlreadyExists {
                path: to.to_path_buf(),
            });
        }
        // Read before the move: `from` is purged once the move is reconciled.
        let snapshot = self.store.list_by_root(from).await?;
        let carried = snapshot
            .iter()
            .find(|row| row.path == from)
            .map(MetadataRecord::carried)
            .unwrap_or_default();

        self.tracker
            .track(operation, [from, to], TrackOptions::default().carry(to, carried));
        if let Err(err) = move_path(from, to).await {
            self.tracker.clear_many([from, to]);
            return Err(EngineError::io(from, err));
        }
        self.carry_descendants(&snapshot, from, to).await
    }

    /// Re-key the rows below a moved directory onto its new location.
    async fn carry_descendants(
        &self,
        snapshot: &[MetadataRecord],
        from: &Path,
        to: &Path,
    ) -> Result<(), EngineError> {
        let mut writes = Vec::new();
        let mut stale = Vec::new();
        for row in snapshot {
            let Ok(rel) = row.path.strip_prefix(from) else {
                continue;
            };
            if rel.as_os_str().is_empty() {
                continue;
            }
            let mut write =
                RecordWrite::new(to.join(rel)).level_tag(WriteMode::Overwrite, row.level_tag);
            if let Some(kind) = row.kind {
                write = write.kind(WriteMode::Overwrite, Some(kind));
            }
            if let Some(time) = row.custom_time {
                write = write.custom_time(WriteMode::Overwrite, Some(time));
            }
            writes.push(write);
            stale.push(row.path.clone());
        }
        if stale.is_empty() {
            return Ok(());
        }
        tracing::debug!(from = %from.display(), to = %to.display(), rows = stale.len(), "carrying descendant rows");
        self.store.merge(writes).await?;
        self.store.delete_records(&stale).await?;
        Ok(())
    }

    /// Copy entries into `dest_rel`. Copies start without tag or time.
    pub async fn copy_entries<P: AsRef<Path>>(
        &self,
        root_id: &str,
        rels: &[P],
        dest_rel: impl AsRef<Path>,
    ) -> Result<Vec<Relocation>, EngineError> {
        let root = self.root(root_id)?;
        let dest_base = resolve(&root, dest_rel)?;
        let pairs = plan_relocations(&root, rels, &dest_base)?;
        let keys = relocation_keys(&root, &dest_base, &pairs);
        self.queue
            .run(keys, || self.copy_locked(&dest_base, &pairs))
            .await?;
        Ok(pairs)
    }

    async fn copy_locked(&self, dest_base: &Path, pairs: &[Relocation]) -> Result<(), EngineError> {
        tokio::fs::create_dir_all(dest_base)
            .await
            .map_err(|e| EngineError::io(dest_base, e))?;

        let mut done = 0;
        let mut failure = None;
        for pair in pairs {
            match self.copy_one(&pair.from, &pair.to).await {
                Ok(()) => done += 1,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        let touched: Vec<PathBuf> = pairs[..done].iter().map(|p| p.to.clone()).collect();
        let pending = pairs[done..].iter().map(|p| p.from.clone()).collect();
        self.finish(pairs.len(), done, &touched, pending, failure)
            .await
    }

    async fn copy_one(&self, from: &Path, to: &Path) -> Result<(), EngineError> {
        if tokio::fs::symlink_metadata(to).await.is_ok() {
            return Err(EngineError::AlreadyExists {
                path: to.to_path_buf(),
            });
        }
        self.tracker.track("copy", [to], TrackOptions::default());
        let (src, dst) = (from.to_path_buf(), to.to_path_buf());
        let copied = tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
            .await
            .map_err(io::Error::other)
            .and_then(|res| res);
        if let Err(err) = copied {
            self.tracker.clear(to);
            return Err(EngineError::io(from, err));
        }
        // Only the top entry is tracked; record what landed below it.
        if tokio::fs::metadata(to).await.is_ok_and(|m| m.is_dir()) {
            scan::scan_root(&self.store, to).await?;
        }
        Ok(())
    }

    /// Delete entries and everything below them.
    pub async fn delete_entries<P: AsRef<Path>>(
        &self,
        root_id: &str,
        rels: &[P],
    ) -> Result<Vec<PathBuf>, EngineError> {
        let root = self.root(root_id)?;
        let targets = resolve_all(&root, rels)?;
        if targets.iter().any(|t| *t == root.path) {
            return Err(EngineError::OutsideRoot {
                path: root.path.clone(),
            });
        }
        let keys = lock_keys(&root, targets.iter().map(PathBuf::as_path));
        self.queue
            .run(keys, || self.delete_locked("delete", &targets))
            .await?;
        Ok(targets)
    }

    /// Delete every entry under the root tagged `tag`, deepest first.
    pub async fn clean_by_level(
        &self,
        root_id: &str,
        tag: LevelTag,
    ) -> Result<Vec<PathBuf>, EngineError> {
        let root = self.root(root_id)?;
        let mut targets: Vec<PathBuf> = self
            .store
            .list_by_level(tag, &root.path)
            .await?
            .into_iter()
            .map(|row| row.path)
            .filter(|path| *path != root.path && path.starts_with(&root.path))
            .collect();
        targets.sort_by(|a, b| {
            b.components()
                .count()
                .cmp(&a.components().count())
                .then_with(|| a.cmp(b))
        });
        tracing::info!(root = %root_id, %tag, count = targets.len(), "cleaning by level");

        let keys = lock_keys(&root, targets.iter().map(PathBuf::as_path));
        self.queue
            .run(keys, || self.delete_locked("clean", &targets))
            .await?;
        Ok(targets)
    }

    async fn delete_locked(&self, operation: &str, targets: &[PathBuf]) -> Result<(), EngineError> {
        let mut done = 0;
        let mut failure = None;
        for target in targets {
            self.tracker
                .track(operation, [target], TrackOptions::default());
            match remove_path(target).await {
                Ok(()) => done += 1,
                Err(err) => {
                    self.tracker.clear(target);
                    failure = Some(EngineError::io(target, err));
                    break;
                }
            }
        }
        let pending = targets[done..].to_vec();
        self.finish(targets.len(), done, &targets[..done], pending, failure)
            .await
    }

    /// Reconcile what completed, then decide what the caller sees.
    async fn finish(
        &self,
        total: usize,
        completed: usize,
        touched: &[PathBuf],
        pending: Vec<PathBuf>,
        failure: Option<EngineError>,
    ) -> Result<(), EngineError> {
        let synced = self.tracker.sync_now(touched).await;
        match (failure, synced) {
            (None, Ok(_)) => Ok(()),
            (Some(err), _) if completed == 0 => Err(err),
            (Some(err), _) => Err(EngineError::SyncRequired {
                completed,
                total,
                pending,
                source: Box::new(err),
            }),
            (None, Err(err)) => Err(EngineError::SyncRequired {
                completed,
                total,
                pending: touched.to_vec(),
                source: Box::new(err),
            }),
        }
    }
}

/// Join `rel` onto the root and reject anything that lands outside it.
fn resolve(root: &RootConfig, rel: impl AsRef<Path>) -> Result<PathBuf, EngineError> {
    let path = normalize(&root.path.join(rel));
    if path.starts_with(&root.path) {
        Ok(path)
    } else {
        Err(EngineError::OutsideRoot { path })
    }
}

/// Like [`resolve`], but the root itself is not an entry.
fn resolve_entry(root: &RootConfig, rel: impl AsRef<Path>) -> Result<PathBuf, EngineError> {
    let path = resolve(root, rel)?;
    if path == root.path {
        return Err(EngineError::OutsideRoot { path });
    }
    Ok(path)
}

fn resolve_all<P: AsRef<Path>>(root: &RootConfig, rels: &[P]) -> Result<Vec<PathBuf>, EngineError> {
    rels.iter().map(|rel| resolve(root, rel)).collect()
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(EngineError::InvalidName(name.to_string())),
    }
}

fn plan_relocations<P: AsRef<Path>>(
    root: &RootConfig,
    rels: &[P],
    dest_base: &Path,
) -> Result<Vec<Relocation>, EngineError> {
    rels.iter()
        .map(|rel| {
            let from = resolve_entry(root, rel)?;
            let name = from
                .file_name()
                .ok_or_else(|| EngineError::InvalidName(from.display().to_string()))?;
            let to = resolve_entry(root, dest_base.join(name))?;
            if to != from && to.starts_with(&from) {
                return Err(EngineError::IntoItself { from, to });
            }
            Ok(Relocation { from, to })
        })
        .collect()
}

fn relocation_keys(root: &RootConfig, dest_base: &Path, pairs: &[Relocation]) -> Vec<PathLockKey> {
    let paths = pairs
        .iter()
        .flat_map(|p| [p.from.as_path(), p.to.as_path()])
        .chain([dest_base]);
    lock_keys(root, paths)
}

fn lock_keys<'a>(root: &RootConfig, paths: impl IntoIterator<Item = &'a Path>) -> Vec<PathLockKey> {
    paths
        .into_iter()
        .filter_map(|p| PathLockKey::for_path(&root.id, &root.path, p))
        .collect()
}

async fn move_path(from: &Path, to: &Path) -> io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Err(err) if err.raw_os_error() == Some(EXDEV) => {
            let (src, dst) = (from.to_path_buf(), to.to_path_buf());
            tokio::task::spawn_blocking(move || {
                copy_tree(&src, &dst)?;
                remove_tree(&src)
            })
            .await
            .map_err(io::Error::other)?
        }
        other => other,
    }
}

/// Remove a file or tree; an already-absent path is not an error.
async fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn remove_tree(path: &Path) -> io::Result<()> {
    if std::fs::symlink_metadata(path)?.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

/// Recursive copy that never overwrites an existing directory.
fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    if !std::fs::symlink_metadata(from)?.is_dir() {
        std::fs::copy(from, to)?;
        return Ok(());
    }
    let mut stack = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((src, dst)) = stack.pop() {
        std::fs::create_dir(&dst)?;
        for entry in std::fs::read_dir(&src)? {
            let entry = entry?;
            let target = dst.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                stack.push((entry.path(), target));
            } else {
                std::fs::copy(entry.path(), &target)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::metadata::EntryKind;
    use chrono::TimeZone;
    use std::fs;
    use std::time::Duration;

    /// Lay out the tree first so the live watcher sees no setup events.
    async fn engine_with(setup: impl FnOnce(&Path)) -> (MetadataEngine, tempfile::TempDir) {
        let temp = tempfile::tempdir().unwrap();
        setup(temp.path());
        let engine = MetadataEngine::open(EngineConfig::in_memory()).unwrap();
        engine
            .register_root(RootConfig::new("r", temp.path()))
            .await
            .unwrap();
        (engine, temp)
    }

    #[test]
    fn resolve_rejects_escapes() {
        let root = RootConfig::new("r", "/data/root");
        assert_eq!(
            resolve(&root, "a/./b").unwrap(),
            PathBuf::from("/data/root/a/b")
        );
        assert_eq!(resolve(&root, ".").unwrap(), PathBuf::from("/data/root"));
        assert!(matches!(
            resolve(&root, "../other"),
            Err(EngineError::OutsideRoot { .. })
        ));
        assert!(matches!(
            resolve(&root, "/etc/passwd"),
            Err(EngineError::OutsideRoot { .. })
        ));
        assert!(resolve_entry(&root, "a/..").is_err());
    }

    #[test]
    fn names_are_single_components() {
        assert!(validate_name("photo.jpg").is_ok());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("").is_err());
    }

    #[tokio::test]
    async fn register_root_scans_and_watches() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir(temp.path().join("a")).unwrap();
        fs::write(temp.path().join("a/x.txt"), "x").unwrap();
        let engine = MetadataEngine::open(EngineConfig::in_memory()).unwrap();

        let root = engine
            .register_root(RootConfig::new("r", temp.path()))
            .await
            .unwrap();
        assert!(!root.name.is_empty());
        assert!(engine.watchers().is_watching("r"));
        assert_eq!(engine.store().row_count().await.unwrap(), 2);

        let purged = engine.unregister_root("r").await.unwrap();
        assert_eq!(purged, 2);
        assert!(!engine.watchers().is_watching("r"));
        assert_eq!(
            engine.unregister_root("r").await.unwrap_err().class(),
            ErrorClass::NotFound
        );
    }

    #[tokio::test]
    async fn register_rejects_files() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("f");
        fs::write(&file, "").unwrap();
        let engine = MetadataEngine::open(EngineConfig::in_memory()).unwrap();
        let err = engine
            .register_root(RootConfig::new("r", &file))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotADirectory { .. }));
    }

    #[tokio::test]
    async fn rename_refuses_to_overwrite() {
        let (engine, temp) = engine_with(|dir| {
            fs::write(dir.join("a"), "a").unwrap();
            fs::write(dir.join("b"), "b").unwrap();
        })
        .await;

        let err = engine.rename("r", "a", "b").await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert_eq!(fs::read_to_string(temp.path().join("b")).unwrap(), "b");
        assert_eq!(engine.tracker().pending(), 0);
    }

    #[tokio::test]
    async fn renaming_a_directory_carries_descendant_rows() {
        let (engine, temp) = engine_with(|dir| {
            fs::create_dir_all(dir.join("album/raw")).unwrap();
            fs::write(dir.join("album/raw/p.jpg"), "p").unwrap();
        })
        .await;
        engine.scan_root("r").await.unwrap();
        engine
            .set_level_tag("r", &["album/raw/p.jpg"], Some(LevelTag::Important))
            .await
            .unwrap();

        let target = engine.rename("r", "album", "trip").await.unwrap();
        assert_eq!(target, temp.path().join("trip"));

        let moved = engine
            .store()
            .get_one(&temp.path().join("trip/raw/p.jpg"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.level_tag, Some(LevelTag::Important));
        assert_eq!(moved.kind, Some(EntryKind::File));
        assert!(engine
            .store()
            .get_one(&temp.path().join("album/raw/p.jpg"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn move_reports_partial_failure_as_sync_required() {
        let (engine, temp) = engine_with(|dir| {
            fs::create_dir(dir.join("dest")).unwrap();
            fs::write(dir.join("one"), "1").unwrap();
            fs::write(dir.join("two"), "2").unwrap();
            fs::write(dir.join("dest/two"), "clash").unwrap();
        })
        .await;

        let err = engine
            .move_entries("r", &["one", "two"], "dest")
            .await
            .unwrap_err();
        match err {
            EngineError::SyncRequired {
                completed,
                total,
                ref pending,
                ..
            } => {
                assert_eq!(completed, 1);
                assert_eq!(total, 2);
                assert_eq!(pending, &vec![temp.path().join("two")]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(temp.path().join("dest/one").exists());
        assert!(temp.path().join("two").exists());
    }

    #[tokio::test]
    async fn move_with_first_failure_is_plain_error() {
        let (engine, temp) = engine_with(|_| {}).await;
        let err = engine
            .move_entries("r", &["missing"], "dest")
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotFound);
        assert!(temp.path().join("dest").is_dir());
    }

    #[tokio::test]
    async fn copy_starts_without_user_metadata() {
        let (engine, temp) = engine_with(|dir| {
            fs::create_dir_all(dir.join("src/inner")).unwrap();
            fs::write(dir.join("src/inner/f.txt"), "f").unwrap();
        })
        .await;
        engine
            .set_level_tag("r", &["src"], Some(LevelTag::Temp))
            .await
            .unwrap();

        let pairs = engine.copy_entries("r", &["src"], "backup").await.unwrap();
        assert_eq!(pairs[0].to, temp.path().join("backup/src"));
        assert_eq!(
            fs::read_to_string(temp.path().join("backup/src/inner/f.txt")).unwrap(),
            "f"
        );

        let copy = engine.store().get_one(&pairs[0].to).await.unwrap().unwrap();
        assert_eq!(copy.kind, Some(EntryKind::Dir));
        assert_eq!(copy.level_tag, None);
        let nested = engine
            .store()
            .get_one(&temp.path().join("backup/src/inner/f.txt"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(nested.kind, Some(EntryKind::File));
        let original = engine
            .store()
            .get_one(&temp.path().join("src"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(original.level_tag, Some(LevelTag::Temp));
    }

    #[tokio::test]
    async fn delete_removes_rows_below_targets() {
        let (engine, temp) = engine_with(|dir| {
            fs::create_dir_all(dir.join("old/deep")).unwrap();
            fs::write(dir.join("old/deep/f"), "").unwrap();
            fs::write(dir.join("keep"), "").unwrap();
        })
        .await;
        engine.scan_root("r").await.unwrap();

        let deleted = engine.delete_entries("r", &["old", "old/deep"]).await.unwrap();
        assert_eq!(deleted.len(), 2);
        assert!(!temp.path().join("old").exists());
        assert_eq!(engine.store().row_count().await.unwrap(), 1);
        assert!(engine.delete_entries("r", &["."]).await.is_err());
    }

    #[tokio::test]
    async fn clean_by_level_deletes_tagged_entries_only() {
        let (engine, temp) = engine_with(|dir| {
            fs::create_dir_all(dir.join("tmp/cache")).unwrap();
            fs::write(dir.join("tmp/cache/blob"), "").unwrap();
            fs::write(dir.join("notes.md"), "").unwrap();
        })
        .await;
        engine
            .set_level_tag("r", &["tmp", "tmp/cache/blob", "ghost"], Some(LevelTag::Temp))
            .await
            .unwrap();

        let cleaned = engine.clean_by_level("r", LevelTag::Temp).await.unwrap();
        assert_eq!(
            cleaned,
            vec![
                temp.path().join("tmp/cache/blob"),
                temp.path().join("ghost"),
                temp.path().join("tmp"),
            ]
        );
        assert!(!temp.path().join("tmp").exists());
        assert!(temp.path().join("notes.md").exists());
        let left = engine
            .store()
            .list_by_level(LevelTag::Temp, temp.path())
            .await
            .unwrap();
        assert!(left.is_empty());
    }

    #[tokio::test]
    async fn create_folder_records_directory() {
        let (engine, temp) = engine_with(|_| {}).await;
        let dir = engine.create_folder("r", ".", "new").await.unwrap();
        assert!(dir.is_dir());
        let row = engine.store().get_one(&dir).await.unwrap().unwrap();
        assert_eq!(row.kind, Some(EntryKind::Dir));

        let err = engine.create_folder("r", ".", "new").await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert!(engine.create_folder("r", ".", "../x").await.is_err());
        drop(temp);
    }

    #[tokio::test]
    async fn time_buckets_prefer_custom_time() {
        let (engine, _temp) = engine_with(|dir| {
            fs::write(dir.join("a"), "").unwrap();
            fs::write(dir.join("b"), "").unwrap();
        })
        .await;
        engine.scan_root("r").await.unwrap();
        let fixed = Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();
        engine.set_custom_time("r", &["a"], Some(fixed)).await.unwrap();
        engine
            .set_level_tag("r", &["vanished"], Some(LevelTag::Normal))
            .await
            .unwrap();

        let buckets = engine.time_buckets("r").await.unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].relative_path, "a");
        assert_eq!(buckets[0].time, fixed);
        assert_eq!(buckets[1].relative_path, "b");
    }

    #[tokio::test]
    async fn list_directory_resolves_relative_paths() {
        let (engine, _temp) = engine_with(|dir| {
            fs::create_dir(dir.join("d")).unwrap();
            fs::write(dir.join("d/e.txt"), "").unwrap();
        })
        .await;

        let entries = engine.list_directory("r", "d").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].relative_path, "d/e.txt");
        assert!(matches!(
            engine.list_directory("r", "..").await,
            Err(EngineError::OutsideRoot { .. })
        ));
        assert!(matches!(
            engine.list_directory("nope", ".").await,
            Err(EngineError::UnknownRoot(_))
        ));
    }

    #[tokio::test]
    async fn clean_by_level_stays_inside_its_root() {
        let temp = tempfile::tempdir().unwrap();
        let upper = temp.path().join("Work");
        let lower = temp.path().join("work");
        fs::create_dir(&upper).unwrap();
        fs::create_dir(&lower).unwrap();
        fs::write(lower.join("draft.txt"), "").unwrap();
        let engine = MetadataEngine::open(EngineConfig::in_memory()).unwrap();
        engine.register_root(RootConfig::new("U", &upper)).await.unwrap();
        engine.register_root(RootConfig::new("L", &lower)).await.unwrap();
        engine
            .set_level_tag("L", &["draft.txt"], Some(LevelTag::Temp))
            .await
            .unwrap();

        let cleaned = engine.clean_by_level("U", LevelTag::Temp).await.unwrap();
        assert!(cleaned.is_empty());
        assert!(lower.join("draft.txt").exists());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn copy_or_move_into_own_subtree_is_rejected() {
        let (engine, temp) = engine_with(|dir| {
            fs::create_dir_all(dir.join("src/sub")).unwrap();
            fs::write(dir.join("src/f.txt"), "f").unwrap();
        })
        .await;

        let err = engine.copy_entries("r", &["src"], "src/sub").await.unwrap_err();
        assert!(matches!(err, EngineError::IntoItself { .. }));
        assert_eq!(err.class(), ErrorClass::InvalidInput);
        let err = engine.move_entries("r", &["src"], "src").await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::InvalidInput);

        assert!(!temp.path().join("src/sub/src").exists());
        assert!(!temp.path().join("src/src").exists());
        assert!(temp.path().join("src/f.txt").exists());
        assert_eq!(engine.tracker().pending(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_register_leaves_no_root_behind() {
        let temp = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("loop", temp.path().join("loop")).unwrap();
        let engine = MetadataEngine::open(EngineConfig::in_memory()).unwrap();

        assert!(engine
            .register_root(RootConfig::new("r", temp.path()))
            .await
            .is_err());
        assert!(engine.roots().is_empty());
        assert!(!engine.watchers().is_watching("r"));
        assert!(engine.queue().key_for(temp.path()).is_none());
    }

    #[tokio::test]
    async fn unregister_waits_out_the_watch_loop() {
        let (engine, temp) = engine_with(|_| {}).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        fs::write(temp.path().join("late.txt"), "x").unwrap();

        engine.unregister_root("r").await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(engine.store().row_count().await.unwrap(), 0);
        assert!(engine.queue().key_for(temp.path()).is_none());
    }
}
