//! Metadata consistency core.
//!
//! - `store`: durable path metadata with an explicit merge policy
//! - `path_queue`: per-subtree mutual exclusion for mutations
//! - `tracker`: engine-issued operations awaiting confirmation
//! - `watcher`: per-root watch loops that reconcile settled paths
//! - `scan`: full-tree scans and directory listings

pub mod path_queue;
pub mod reconcile;
pub mod record;
pub mod scan;
pub mod store;
pub mod tracker;
pub mod watcher;

pub use path_queue::{PathLockKey, PathTaskQueue};
pub use reconcile::{reconcile_path, Reconciled, Trigger};
pub use record::{CarriedMeta, EntryKind, LevelTag, MetadataRecord};
pub use scan::{list_directory, scan_root, DirEntry};
pub use store::{Field, MetadataStore, RecordWrite, ScannedEntry, WriteMode};
pub use tracker::{OperationTracker, TrackOptions, TrackedOperation};
pub use watcher::{DebouncedFileWatcher, FileChangeEvent, WatchSettings, WatcherManager};
