//! Change feed emitted by the watchers, and a listener that turns it into
//! directory-tree invalidations.
//!
//! The feed is a `tokio::sync::broadcast` channel of [`ChangeNotification`]s.
//! [`TreeInvalidation`] subscribes to it and tracks, per root, which
//! directory listings are stale.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Kind of a reconciled change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Change,
    Delete,
}

/// One reconciled path, relative to its root (`.` for the root itself).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub root_id: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub path: String,
}

impl ChangeNotification {
    pub fn new(root_id: impl Into<String>, kind: ChangeKind, path: impl Into<String>) -> Self {
        Self {
            root_id: root_id.into(),
            kind,
            path: path.into(),
        }
    }

    /// Root-relative directory whose listing this change affects.
    pub fn parent_dir(&self) -> PathBuf {
        match Path::new(&self.path).parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// Render `path` relative to `root`, `.` when they are equal.
pub fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let rel = rel.to_string_lossy();
    Some(if rel.is_empty() {
        ".".to_string()
    } else {
        rel.into_owned()
    })
}

/// Callback invoked with every notification after its directory is marked stale.
pub type InvalidateCallback = Box<dyn Fn(&ChangeNotification) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct InvalidationState {
    /// Stale directories per root id.
    pub dirty_dirs: HashMap<String, HashSet<PathBuf>>,
    /// Set when notifications were dropped; every listing is stale.
    pub needs_full_refresh: bool,
}

/// Listens on the change feed and accumulates stale directory listings.
pub struct TreeInvalidation {
    state: Arc<RwLock<InvalidationState>>,
    callback: Option<Arc<InvalidateCallback>>,
    listener_handle: Option<tokio::task::JoinHandle<()>>,
}

impl TreeInvalidation {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(InvalidationState::default())),
            callback: None,
            listener_handle: None,
        }
    }

    pub fn on_invalidate(mut self, cb: InvalidateCallback) -> Self {
        self.callback = Some(Arc::new(cb));
        self
    }

    /// Spawn the listener loop on `rx`.
    pub fn listen(&mut self, rx: broadcast::Receiver<ChangeNotification>) {
        let state = Arc::clone(&self.state);
        let callback = self.callback.clone();
        let handle = tokio::spawn(async move {
            Self::listener_loop(state, callback, rx).await;
        });
        self.listener_handle = Some(handle);
    }

    async fn listener_loop(
        state: Arc<RwLock<InvalidationState>>,
        callback: Option<Arc<InvalidateCallback>>,
        mut rx: broadcast::Receiver<ChangeNotification>,
    ) {
        loop {
            match rx.recv().await {
                Ok(note) => {
                    tracing::debug!(root = %note.root_id, kind = ?note.kind, path = %note.path, "change received");
                    Self::mark(&state, &note).await;
                    if let Some(ref cb) = callback {
                        cb(&note);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    tracing::warn!(count, "change feed lagged, requesting full refresh");
                    state.write().await.needs_full_refresh = true;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("change feed closed, stopping listener");
                    break;
                }
            }
        }
    }

    async fn mark(state: &RwLock<InvalidationState>, note: &ChangeNotification) {
        let mut state = state.write().await;
        let dirs = state.dirty_dirs.entry(note.root_id.clone()).or_default();
        dirs.insert(note.parent_dir());
        // A deleted or re-created directory also invalidates its own listing.
        if note.kind != ChangeKind::Change {
            dirs.insert(PathBuf::from(&note.path));
        }
    }

    pub async fn is_dirty(&self, root_id: &str, dir: &Path) -> bool {
        self.state
            .read()
            .await
            .dirty_dirs
            .get(root_id)
            .is_some_and(|dirs| dirs.contains(dir))
    }

    pub async fn needs_full_refresh(&self) -> bool {
        self.state.read().await.needs_full_refresh
    }

    /// Take and reset the accumulated state.
    pub async fn drain(&self) -> InvalidationState {
        std::mem::take(&mut *self.state.write().await)
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.listener_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listener_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Default for TreeInvalidation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn notification_serializes_with_wire_names() {
        let note = ChangeNotification::new("r1", ChangeKind::Delete, "photos/a.jpg");
        let json = serde_json::to_value(&note).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "rootId": "r1", "type": "delete", "path": "photos/a.jpg" })
        );
    }

    #[test]
    fn parent_dir_of_top_level_entry_is_root() {
        let note = ChangeNotification::new("r", ChangeKind::Add, "a.txt");
        assert_eq!(note.parent_dir(), PathBuf::from("."));
        let nested = ChangeNotification::new("r", ChangeKind::Add, "x/y/z.txt");
        assert_eq!(nested.parent_dir(), PathBuf::from("x/y"));
    }

    #[test]
    fn relative_paths() {
        let root = Path::new("/data/root");
        assert_eq!(relative_to(root, root).as_deref(), Some("."));
        assert_eq!(
            relative_to(root, Path::new("/data/root/a/b")).as_deref(),
            Some("a/b")
        );
        assert_eq!(relative_to(root, Path::new("/other")), None);
    }

    #[tokio::test]
    async fn listener_marks_parent_dirs() {
        let (tx, rx) = broadcast::channel(16);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let mut tree = TreeInvalidation::new().on_invalidate(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        tree.listen(rx);
        assert!(tree.is_listening());

        tx.send(ChangeNotification::new("r", ChangeKind::Change, "docs/readme.md"))
            .unwrap();
        tx.send(ChangeNotification::new("r", ChangeKind::Delete, "old"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(tree.is_dirty("r", Path::new("docs")).await);
        assert!(tree.is_dirty("r", Path::new(".")).await);
        assert!(tree.is_dirty("r", Path::new("old")).await);
        assert!(!tree.is_dirty("r", Path::new("docs/readme.md")).await);
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        let drained = tree.drain().await;
        assert_eq!(drained.dirty_dirs["r"].len(), 3);
        assert!(!tree.is_dirty("r", Path::new("docs")).await);

        tree.stop().await;
        assert!(!tree.is_listening());
    }

    #[tokio::test]
    async fn lagging_requests_full_refresh() {
        let (tx, rx) = broadcast::channel(1);
        for i in 0..4 {
            tx.send(ChangeNotification::new("r", ChangeKind::Add, format!("f{i}")))
                .unwrap();
        }
        let mut tree = TreeInvalidation::new();
        tree.listen(rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tree.needs_full_refresh().await);
        tree.stop().await;
    }

    #[tokio::test]
    async fn listener_stops_when_feed_closes() {
        let (tx, rx) = broadcast::channel::<ChangeNotification>(4);
        let mut tree = TreeInvalidation::new();
        tree.listen(rx);
        drop(tx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!tree.is_listening());
    }
}
