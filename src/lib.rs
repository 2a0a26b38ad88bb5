//! Filesystem Metadata Engine
//!
//! Keeps user-assigned metadata (an importance tag and a user-chosen time)
//! attached to files and directories while they are renamed, moved, copied
//! and deleted, both through the engine and behind its back.
//!
//! ## Guarantees
//!
//! - **Sticky metadata**: once a user sets a tag or time, filesystem-driven
//!   writes never overwrite it.
//! - **Carried metadata**: a rename or move through the engine transplants
//!   the source's tag and time onto the destination.
//! - **Self-healing**: every engine-issued mutation is reconciled from disk
//!   even if the watcher never reports it.
//! - **Subtree concurrency**: mutations under different top-level entries
//!   run in parallel; mutations under the same one run in arrival order.
//!
//! ## Flow
//!
//! ```text
//! UI command ──► MetadataEngine ──► PathTaskQueue (per top-level key)
//!                      │
//!                      ├─► OperationTracker.track (carry meta, arm timer)
//!                      ├─► filesystem mutation
//!                      └─► OperationTracker.sync_now ─┐
//!                                                     ▼
//! Filesystem ──► DebouncedFileWatcher ──► reconcile_path ──► MetadataStore
//!                 (stabilization)              │
//!                                              ▼
//!                                  broadcast::send(ChangeNotification)
//!                                              │
//!                                              ▼
//!                                     TreeInvalidation
//! ```
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use fs_metadata_engine::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = MetadataEngine::open(EngineConfig::default())?;
//!     engine
//!         .register_root(RootConfig::new("photos", "/data/photos"))
//!         .await?;
//!
//!     engine
//!         .set_level_tag("photos", &["2024/beach.jpg"], Some(LevelTag::Important))
//!         .await?;
//!     engine.rename("photos", "2024/beach.jpg", "sunset.jpg").await?;
//!
//!     let info = engine
//!         .store()
//!         .get_one(std::path::Path::new("/data/photos/2024/sunset.jpg"))
//!         .await?;
//!     assert_eq!(info.and_then(|r| r.level_tag), Some(LevelTag::Important));
//!     Ok(())
//! }
//! ```
//!
//! ## Module Structure
//!
//! - [`metadata`]: the consistency core
//!   - [`metadata::store`]: SQLite-backed metadata table
//!   - [`metadata::path_queue`]: per-subtree mutual exclusion
//!   - [`metadata::tracker`]: operations awaiting confirmation
//!   - [`metadata::watcher`]: debounced per-root watchers
//!   - [`metadata::scan`]: tree scans and directory listings
//! - [`engine`]: the wired-up engine and its mutations
//! - [`feed`]: change notifications and tree invalidation
//! - [`config`]: engine configuration
//! - [`error`]: error types and classification

#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod metadata;

/// Re-exports for convenience.
pub mod prelude {
    pub use crate::config::{EngineConfig, RootConfig};
    pub use crate::engine::{MetadataEngine, Relocation, TimedEntry};
    pub use crate::error::{EngineError, ErrorClass, StoreError, WatcherError};
    pub use crate::feed::{ChangeKind, ChangeNotification, TreeInvalidation};
    pub use crate::metadata::{
        CarriedMeta, DirEntry, EntryKind, LevelTag, MetadataRecord, MetadataStore,
        OperationTracker, PathLockKey, PathTaskQueue, TrackOptions, WatcherManager,
    };
}

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Forward every change notification to `on_change` until `shutdown` fires,
/// then stop all watchers.
///
/// Lagging behind the feed is logged and skipped; the loop ends early if
/// the feed closes.
///
/// # Example
///
/// ```rust,no_run
/// use fs_metadata_engine::{prelude::*, run_until_shutdown};
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let engine = MetadataEngine::open(EngineConfig::default())?;
///     engine.start().await;
///
///     let shutdown = CancellationToken::new();
///     run_until_shutdown(&engine, shutdown, |note| {
///         println!("{:?} {}", note.kind, note.path);
///     })
///     .await;
///     Ok(())
/// }
/// ```
pub async fn run_until_shutdown<F>(
    engine: &engine::MetadataEngine,
    shutdown: CancellationToken,
    mut on_change: F,
) where
    F: FnMut(&feed::ChangeNotification),
{
    let mut rx = engine.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => match received {
                Ok(note) => on_change(&note),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    tracing::warn!(count, "change feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    engine.shutdown().await;
}
