//! Directory walking: full-root scans and single-directory listings.
//!
//! Both write what they observe back to the store. Entries that vanish or
//! become unreadable between `read_dir` and `stat` are skipped.

use crate::error::{is_transient, EngineError};
use crate::feed::relative_to;
use crate::metadata::reconcile::created_at;
use crate::metadata::record::{EntryKind, LevelTag};
use crate::metadata::store::{MetadataStore, ScannedEntry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::Metadata;
use std::path::{Path, PathBuf};

/// One child of a listed directory, with its stored metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub full_path: PathBuf,
    pub relative_path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    /// Extension without the dot; empty for directories.
    pub ext: String,
    pub level_tag: Option<LevelTag>,
    pub custom_time: Option<DateTime<Utc>>,
}

/// Stat `path`, mapping transient races to `None`.
async fn stat_entry(path: &Path) -> Result<Option<Metadata>, EngineError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta)),
        Err(err) if is_transient(&err) => {
            tracing::debug!(path = %path.display(), error = %err, "skipping entry");
            Ok(None)
        }
        Err(err) => Err(EngineError::io(path, err)),
    }
}

/// Read the names in `dir`, or `None` if it went away mid-walk.
async fn read_children(dir: &Path) -> Result<Option<Vec<(PathBuf, bool)>>, EngineError> {
    let mut reader = match tokio::fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(err) if is_transient(&err) => {
            tracing::debug!(dir = %dir.display(), error = %err, "skipping directory");
            return Ok(None);
        }
        Err(err) => return Err(EngineError::io(dir, err)),
    };
    let mut children = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .map_err(|e| EngineError::io(dir, e))?
    {
        let path = entry.path();
        if path.to_str().is_none() {
            tracing::debug!(path = %path.display(), "skipping non-UTF-8 name");
            continue;
        }
        // Symlinked directories are recorded but not descended into.
        let is_real_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        children.push((path, is_real_dir));
    }
    children.sort();
    Ok(Some(children))
}

/// Walk every entry below `root` and record its type.
///
/// Existing tags and times are left alone. A missing root scans nothing.
/// Returns the number of entries written.
pub async fn scan_root(store: &MetadataStore, root: &Path) -> Result<usize, EngineError> {
    if tokio::fs::metadata(root).await.is_err() {
        tracing::warn!(root = %root.display(), "root missing, nothing to scan");
        return Ok(0);
    }

    let mut records = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Some(children) = read_children(&dir).await? else {
            continue;
        };
        for (path, descend) in children {
            let Some(meta) = stat_entry(&path).await? else {
                continue;
            };
            if descend {
                stack.push(path.clone());
            }
            records.push(ScannedEntry::new(path, EntryKind::from_metadata(&meta)));
        }
        tokio::task::yield_now().await;
    }

    store.upsert_files(&records).await?;
    tracing::info!(root = %root.display(), entries = records.len(), "scan complete");
    Ok(records.len())
}

/// List the direct children of `dir`, enriched with stored tag and time.
pub async fn list_directory(
    store: &MetadataStore,
    root: &Path,
    dir: &Path,
) -> Result<Vec<DirEntry>, EngineError> {
    let children = match read_children(dir).await? {
        Some(children) => children,
        None => {
            return Err(EngineError::io(
                dir,
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ))
        }
    };

    let mut entries = Vec::with_capacity(children.len());
    for (path, _) in children {
        let Some(meta) = stat_entry(&path).await? else {
            continue;
        };
        let kind = EntryKind::from_metadata(&meta);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = match kind {
            EntryKind::Dir => String::new(),
            EntryKind::File => path
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        entries.push(DirEntry {
            relative_path: relative_to(root, &path).unwrap_or_else(|| name.clone()),
            name,
            kind,
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            created: created_at(&meta),
            ext,
            level_tag: None,
            custom_time: None,
            full_path: path,
        });
    }

    let paths: Vec<PathBuf> = entries.iter().map(|e| e.full_path.clone()).collect();
    let stored = store.get_info(&paths).await?;
    for entry in &mut entries {
        if let Some(row) = stored.get(&entry.full_path) {
            entry.level_tag = row.level_tag;
            entry.custom_time = row.custom_time;
        }
    }

    let records: Vec<ScannedEntry> = entries
        .iter()
        .map(|e| ScannedEntry {
            path: e.full_path.clone(),
            kind: e.kind,
            level_tag: e.level_tag,
            custom_time: e.custom_time,
        })
        .collect();
    store.upsert_files(&records).await?;

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;

    fn tree() -> tempfile::TempDir {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("docs/notes")).unwrap();
        fs::write(temp.path().join("docs/notes/a.md"), "a").unwrap();
        fs::write(temp.path().join("docs/b.txt"), "bb").unwrap();
        fs::write(temp.path().join("top.rs"), "").unwrap();
        temp
    }

    #[tokio::test]
    async fn scan_records_every_entry() {
        let store = MetadataStore::open_in_memory().unwrap();
        let temp = tree();

        let count = scan_root(&store, temp.path()).await.unwrap();
        assert_eq!(count, 5);
        assert_eq!(store.row_count().await.unwrap(), 5);

        let notes = store.get_one(&temp.path().join("docs/notes")).await.unwrap().unwrap();
        assert_eq!(notes.kind, Some(EntryKind::Dir));
        assert_eq!(notes.custom_time, None);
    }

    #[tokio::test]
    async fn rescan_keeps_user_metadata() {
        let store = MetadataStore::open_in_memory().unwrap();
        let temp = tree();
        let file = temp.path().join("top.rs");
        store.set_level_tag(&[file.clone()], Some(LevelTag::Important)).await.unwrap();

        scan_root(&store, temp.path()).await.unwrap();
        scan_root(&store, temp.path()).await.unwrap();

        let row = store.get_one(&file).await.unwrap().unwrap();
        assert_eq!(row.level_tag, Some(LevelTag::Important));
        assert_eq!(row.kind, Some(EntryKind::File));
        assert_eq!(store.row_count().await.unwrap(), 5);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn scan_skips_names_the_store_cannot_key() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let store = MetadataStore::open_in_memory().unwrap();
        let temp = tree();
        fs::write(temp.path().join(OsStr::from_bytes(b"raw\xff")), "").unwrap();

        let count = scan_root(&store, temp.path()).await.unwrap();
        assert_eq!(count, 5);
        let listed = list_directory(&store, temp.path(), temp.path()).await.unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn missing_root_scans_nothing() {
        let store = MetadataStore::open_in_memory().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let count = scan_root(&store, &temp.path().join("absent")).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn listing_merges_stored_metadata() {
        let store = MetadataStore::open_in_memory().unwrap();
        let temp = tree();
        let docs = temp.path().join("docs");
        let fixed = Utc.with_ymd_and_hms(2022, 2, 2, 2, 2, 2).unwrap();
        store.set_custom_time(&[docs.join("b.txt")], Some(fixed)).await.unwrap();

        let entries = list_directory(&store, temp.path(), &docs).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b.txt", "notes"]);

        let b = &entries[0];
        assert_eq!(b.kind, EntryKind::File);
        assert_eq!(b.ext, "txt");
        assert_eq!(b.size, 2);
        assert_eq!(b.relative_path, "docs/b.txt");
        assert_eq!(b.custom_time, Some(fixed));
        assert_eq!(entries[1].ext, "");

        let row = store.get_one(&docs.join("notes")).await.unwrap().unwrap();
        assert_eq!(row.kind, Some(EntryKind::Dir));
    }

    #[tokio::test]
    async fn listing_missing_dir_is_not_found() {
        let store = MetadataStore::open_in_memory().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let err = list_directory(&store, temp.path(), &temp.path().join("nope"))
            .await
            .unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::NotFound);
    }
}
