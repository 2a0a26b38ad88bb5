//! Re-derive one path's row from disk.
//!
//! Both the watcher and the tracker's fallback jobs end up here: stat the
//! path, then either merge what was found into the store or drop the row.
//! The triggering event is never trusted, only the stat result.

use crate::error::{is_transient, EngineError};
use crate::metadata::record::{CarriedMeta, EntryKind};
use crate::metadata::store::{MetadataStore, RecordWrite, WriteMode};
use chrono::{DateTime, Utc};
use std::fs::Metadata;
use std::io;
use std::path::Path;

/// Who asked for the reconciliation. Decides how `custom_time` is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A tracker fallback job or `sync_now`: a carried time is written as
    /// is, and nothing else fills the column.
    Fallback,
    /// A settled watch event: the carried time, else the creation time,
    /// only fills an empty column.
    Event,
}

/// Outcome of reconciling one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The path exists; `existed` tells whether a typed row was already stored.
    Present { kind: EntryKind, existed: bool },
    /// The path is gone; its row and any rows below it were deleted.
    Removed,
    /// A transient error hid the path's state; nothing was written.
    Skipped,
}

/// Stat `path` and write the result through to `store`.
///
/// `carried` is only consulted once the stat has succeeded, so a caller can
/// hand over a tracked record's metadata without losing it on a failed stat.
pub async fn reconcile_path<C>(
    store: &MetadataStore,
    path: &Path,
    carried: C,
    trigger: Trigger,
) -> Result<Reconciled, EngineError>
where
    C: FnOnce() -> Option<CarriedMeta>,
{
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            // Nothing can exist below a vanished path either.
            let purged = store.purge_root(path).await?;
            tracing::debug!(path = %path.display(), purged, "reconciled as removed");
            return Ok(Reconciled::Removed);
        }
        Err(err) if is_transient(&err) => {
            tracing::debug!(path = %path.display(), error = %err, "skipping path during reconcile");
            return Ok(Reconciled::Skipped);
        }
        Err(err) => return Err(EngineError::io(path, err)),
    };

    let kind = EntryKind::from_metadata(&meta);
    let existed = store
        .get_one(path)
        .await?
        .is_some_and(|row| row.kind.is_some());

    let carried = carried().unwrap_or_default();
    let mut write = RecordWrite::new(path).kind(WriteMode::Overwrite, Some(kind));
    if let Some(tag) = carried.level_tag {
        write = write.level_tag(WriteMode::Overwrite, tag);
    }
    let time = match trigger {
        Trigger::Fallback => carried.custom_time.map(|t| (WriteMode::Overwrite, t)),
        Trigger::Event => carried
            .custom_time
            .or_else(|| created_at(&meta))
            .map(|t| (WriteMode::FillIfEmpty, t)),
    };
    if let Some((mode, time)) = time {
        write = write.custom_time(mode, Some(time));
    }
    store.merge(vec![write]).await?;

    tracing::debug!(path = %path.display(), ?kind, existed, "reconciled as present");
    Ok(Reconciled::Present { kind, existed })
}

/// Creation time, falling back to modification time where the platform
/// or filesystem does not record birth times.
pub fn created_at(meta: &Metadata) -> Option<DateTime<Utc>> {
    meta.created()
        .or_else(|_| meta.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}
