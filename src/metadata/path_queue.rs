//! Path-keyed mutual exclusion for tree mutations.
//!
//! Operations name the top-level entries of the roots they touch. Two
//! operations sharing any key run one after the other in arrival order;
//! operations with disjoint keys run concurrently.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Coarse lock identity: a root id plus the first path segment below it.
///
/// The root itself maps to an empty segment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathLockKey {
    root_id: String,
    segment: String,
}

impl PathLockKey {
    pub fn new(root_id: impl Into<String>, segment: impl Into<String>) -> Self {
        Self {
            root_id: root_id.into(),
            segment: segment.into(),
        }
    }

    /// Key for `path` under `root`, or `None` when `path` is not inside it.
    pub fn for_path(root_id: &str, root: &Path, path: &Path) -> Option<Self> {
        let relative = path.strip_prefix(root).ok()?;
        let segment = relative
            .components()
            .find_map(|c| match c {
                Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
                _ => None,
            })
            .unwrap_or_default();
        Some(Self::new(root_id, segment))
    }

    pub fn segment(&self) -> &str {
        &self.segment
    }
}

impl fmt::Display for PathLockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.root_id, self.segment)
    }
}

/// Held locks for one [`PathTaskQueue::run`] call. Dropping it releases
/// every key, newest first, and forgets keys nobody else is waiting on.
struct HeldKeys<'a> {
    queue: &'a PathTaskQueue,
    guards: Vec<(PathLockKey, OwnedMutexGuard<()>)>,
}

impl Drop for HeldKeys<'_> {
    fn drop(&mut self) {
        while let Some((key, guard)) = self.guards.pop() {
            drop(guard);
            self.queue.forget_if_idle(&key);
        }
    }
}

/// FIFO scheduler over [`PathLockKey`]s.
#[derive(Default)]
pub struct PathTaskQueue {
    locks: Mutex<HashMap<PathLockKey, Arc<AsyncMutex<()>>>>,
    roots: Mutex<Vec<(String, PathBuf)>>,
}

impl fmt::Debug for PathTaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathTaskQueue")
            .field("active_keys", &self.active_keys())
            .finish()
    }
}

impl PathTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once every key in `keys` is held.
    ///
    /// Keys are deduplicated and taken in sorted order, so two callers that
    /// need the same pair can never each hold one and wait on the other.
    /// Locks are released on every exit path, including an error or a
    /// cancelled caller; the task's output is returned unchanged.
    pub async fn run<I, F, Fut, T>(&self, keys: I, task: F) -> T
    where
        I: IntoIterator<Item = PathLockKey>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let ordered: BTreeSet<PathLockKey> = keys.into_iter().collect();
        let mut held = HeldKeys {
            queue: self,
            guards: Vec::with_capacity(ordered.len()),
        };
        for key in ordered {
            let lock = self.lock_for(&key);
            let guard = lock.lock_owned().await;
            tracing::trace!(key = %key, "path key acquired");
            held.guards.push((key, guard));
        }
        let output = task().await;
        drop(held);
        output
    }

    /// Make `root` resolvable through [`PathTaskQueue::key_for`].
    pub fn add_root(&self, root_id: &str, root: &Path) {
        let mut roots = self.roots.lock().unwrap_or_else(|e| e.into_inner());
        roots.retain(|(id, _)| id != root_id);
        roots.push((root_id.to_string(), root.to_path_buf()));
    }

    pub fn remove_root(&self, root_id: &str) {
        let mut roots = self.roots.lock().unwrap_or_else(|e| e.into_inner());
        roots.retain(|(id, _)| id != root_id);
    }

    /// Key for `path` under the deepest registered root containing it.
    pub fn key_for(&self, path: &Path) -> Option<PathLockKey> {
        let roots = self.roots.lock().unwrap_or_else(|e| e.into_inner());
        roots
            .iter()
            .filter(|(_, root)| path.starts_with(root))
            .max_by_key(|(_, root)| root.components().count())
            .and_then(|(id, root)| PathLockKey::for_path(id, root, path))
    }

    /// Number of keys currently held or waited on.
    pub fn active_keys(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    fn lock_for(&self, key: &PathLockKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    fn forget_if_idle(&self, key: &PathLockKey) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = locks.get(key) {
            // Only the map still refers to it: no holder and no waiter.
            if Arc::strong_count(lock) == 1 {
                locks.remove(key);
            }
        }
    }
}
