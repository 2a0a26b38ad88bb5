//! Durable `path -> {type, level_tag, custom_time}` table backed by SQLite.
//!
//! Every write funnels through [`MetadataStore::merge`], which takes one
//! [`WriteMode`] per field. The public write methods only differ in the
//! policy they hand to it:
//!
//! | method                    | type        | level_tag   | custom_time |
//! |---------------------------|-------------|-------------|-------------|
//! | `upsert_files`            | Overwrite   | FillIfEmpty | FillIfEmpty |
//! | `upsert_file_types`       | Overwrite   | -           | -           |
//! | `set_level_tag`           | -           | Overwrite   | -           |
//! | `set_custom_time`         | -           | -           | Overwrite   |
//! | `set_custom_time_if_null` | FillIfEmpty | -           | FillIfEmpty |
//!
//! Calls touching more than one row run inside a single transaction, and all
//! transactions pass through one FIFO queue so at most one is open at a time.

use crate::error::StoreError;
use crate::metadata::record::{format_time, EntryKind, LevelTag, MetadataRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params_from_iter, Connection};
use std::collections::HashMap;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::{Arc, Mutex};

/// Upper bound on bound parameters per `IN (...)` statement.
const MAX_PARAMS: usize = 500;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS files (
        path TEXT PRIMARY KEY,
        type TEXT,
        level_tag TEXT,
        custom_time TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_files_level ON files(level_tag);
";

/// How an incoming value is merged with the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace the stored value, including with an absent value.
    Overwrite,
    /// Write only when the stored value is absent or empty.
    FillIfEmpty,
}

/// What a [`RecordWrite`] does to one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field<T> {
    Untouched,
    Write(WriteMode, Option<T>),
}

impl<T> Field<T> {
    fn value(&self) -> Option<&T> {
        match self {
            Field::Untouched => None,
            Field::Write(_, value) => value.as_ref(),
        }
    }

    fn clause(&self, column: &str) -> Option<String> {
        match self {
            Field::Untouched => None,
            Field::Write(WriteMode::Overwrite, _) => Some(format!("{column} = excluded.{column}")),
            Field::Write(WriteMode::FillIfEmpty, _) => Some(format!(
                "{column} = CASE WHEN files.{column} IS NULL OR files.{column} = '' \
                 THEN excluded.{column} ELSE files.{column} END"
            )),
        }
    }
}

/// A single-row write request for [`MetadataStore::merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordWrite {
    pub path: PathBuf,
    pub kind: Field<EntryKind>,
    pub level_tag: Field<LevelTag>,
    pub custom_time: Field<DateTime<Utc>>,
}

impl RecordWrite {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: Field::Untouched,
            level_tag: Field::Untouched,
            custom_time: Field::Untouched,
        }
    }

    pub fn kind(mut self, mode: WriteMode, kind: Option<EntryKind>) -> Self {
        self.kind = Field::Write(mode, kind);
        self
    }

    pub fn level_tag(mut self, mode: WriteMode, tag: Option<LevelTag>) -> Self {
        self.level_tag = Field::Write(mode, tag);
        self
    }

    pub fn custom_time(mut self, mode: WriteMode, time: Option<DateTime<Utc>>) -> Self {
        self.custom_time = Field::Write(mode, time);
        self
    }

    fn sql(&self) -> String {
        let clauses: Vec<String> = [
            self.kind.clause("type"),
            self.level_tag.clause("level_tag"),
            self.custom_time.clause("custom_time"),
        ]
        .into_iter()
        .flatten()
        .collect();

        let on_conflict = if clauses.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", clauses.join(", "))
        };

        format!(
            "INSERT INTO files(path, type, level_tag, custom_time) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(path) {on_conflict}"
        )
    }

    fn apply(&self, key: &str, conn: &Connection) -> rusqlite::Result<()> {
        let mut stmt = conn.prepare_cached(&self.sql())?;
        stmt.execute(rusqlite::params![
            key,
            self.kind.value(),
            self.level_tag.value(),
            self.custom_time.value().map(format_time),
        ])?;
        Ok(())
    }
}

/// Scan-side input: a path and what it was observed to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub level_tag: Option<LevelTag>,
    pub custom_time: Option<DateTime<Utc>>,
}

impl ScannedEntry {
    pub fn new(path: impl Into<PathBuf>, kind: EntryKind) -> Self {
        Self {
            path: path.into(),
            kind,
            level_tag: None,
            custom_time: None,
        }
    }
}

/// The metadata table and its single connection.
pub struct MetadataStore {
    conn: Arc<Mutex<Connection>>,
    tx_queue: tokio::sync::Mutex<()>,
    location: PathBuf,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl MetadataStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let location = path.as_ref().to_path_buf();
        let conn = Connection::open(&location)?;
        Self::init(conn, location)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, location: PathBuf) -> Result<Self, StoreError> {
        tracing::debug!(path = %location.display(), "opening metadata store");
        // In-memory databases answer "memory" here, which is fine.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            tx_queue: tokio::sync::Mutex::new(()),
            location,
        })
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&guard).map_err(StoreError::from)
        })
        .await?
    }

    /// Run `f` inside `BEGIN IMMEDIATE .. COMMIT`, rolling back on error.
    ///
    /// Transactions queue behind each other in arrival order. A failed
    /// rollback is logged and the original error is returned.
    async fn in_transaction<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _turn = self.tx_queue.lock().await;
        self.with_conn(move |conn| {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let outcome = f(conn).and_then(|value| conn.execute_batch("COMMIT").map(|_| value));
            match outcome {
                Ok(value) => Ok(value),
                Err(err) => {
                    if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                        tracing::warn!(
                            error = %rollback_err,
                            original = %err,
                            "metadata store rollback failed"
                        );
                    }
                    Err(err)
                }
            }
        })
        .await
    }

    /// Apply a batch of writes: one transaction for several rows, a plain
    /// statement for a single row.
    ///
    /// A path that is not valid UTF-8 fails the whole batch with
    /// [`StoreError::NonUtf8Path`] before anything is written.
    pub async fn merge(&self, writes: Vec<RecordWrite>) -> Result<(), StoreError> {
        let keyed = writes
            .into_iter()
            .map(|write| Ok((path_key(&write.path)?, write)))
            .collect::<Result<Vec<(String, RecordWrite)>, StoreError>>()?;
        match keyed.len() {
            0 => Ok(()),
            1 => {
                self.with_conn(move |conn| {
                    let (key, write) = &keyed[0];
                    write.apply(key, conn)
                })
                .await
            }
            _ => {
                self.in_transaction(move |conn| {
                    for (key, write) in &keyed {
                        write.apply(key, conn)?;
                    }
                    Ok(())
                })
                .await
            }
        }
    }

    /// Full-tree scan write: type wins, tag and time only fill gaps.
    pub async fn upsert_files(&self, records: &[ScannedEntry]) -> Result<(), StoreError> {
        let writes = records
            .iter()
            .map(|r| {
                RecordWrite::new(&r.path)
                    .kind(WriteMode::Overwrite, Some(r.kind))
                    .level_tag(WriteMode::FillIfEmpty, r.level_tag)
                    .custom_time(WriteMode::FillIfEmpty, r.custom_time)
            })
            .collect();
        self.merge(writes).await
    }

    /// Record existence and kind only.
    pub async fn upsert_file_types(
        &self,
        records: &[(PathBuf, EntryKind)],
    ) -> Result<(), StoreError> {
        let writes = records
            .iter()
            .map(|(path, kind)| RecordWrite::new(path).kind(WriteMode::Overwrite, Some(*kind)))
            .collect();
        self.merge(writes).await
    }

    /// Explicit user intent: overwrite (or clear) the tag, creating rows as needed.
    pub async fn set_level_tag(
        &self,
        paths: &[PathBuf],
        tag: Option<LevelTag>,
    ) -> Result<(), StoreError> {
        let writes = paths
            .iter()
            .map(|p| RecordWrite::new(p).level_tag(WriteMode::Overwrite, tag))
            .collect();
        self.merge(writes).await
    }

    /// Explicit user intent: the only unconditional writer of `custom_time`.
    pub async fn set_custom_time(
        &self,
        paths: &[PathBuf],
        time: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let writes = paths
            .iter()
            .map(|p| RecordWrite::new(p).custom_time(WriteMode::Overwrite, time))
            .collect();
        self.merge(writes).await
    }

    /// Filesystem-driven write that never displaces an existing time or type.
    pub async fn set_custom_time_if_null(
        &self,
        records: &[(PathBuf, Option<EntryKind>, DateTime<Utc>)],
    ) -> Result<(), StoreError> {
        let writes = records
            .iter()
            .map(|(path, kind, time)| {
                RecordWrite::new(path)
                    .kind(WriteMode::FillIfEmpty, *kind)
                    .custom_time(WriteMode::FillIfEmpty, Some(*time))
            })
            .collect();
        self.merge(writes).await
    }

    /// Point lookup; paths without a row are left out of the result.
    /// Non-UTF-8 paths never have a row.
    pub async fn get_info(
        &self,
        paths: &[PathBuf],
    ) -> Result<HashMap<PathBuf, MetadataRecord>, StoreError> {
        let keys: Vec<String> = paths.iter().filter_map(|p| path_key(p).ok()).collect();
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        self.with_conn(move |conn| {
            let mut found = HashMap::new();
            for chunk in keys.chunks(MAX_PARAMS) {
                let sql = format!(
                    "SELECT path, type, level_tag, custom_time FROM files WHERE path IN ({})",
                    placeholders(chunk.len())
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(chunk.iter()), MetadataRecord::from_row)?;
                for row in rows {
                    let record = row?;
                    found.insert(record.path.clone(), record);
                }
            }
            Ok(found)
        })
        .await
    }

    pub async fn get_one(&self, path: &Path) -> Result<Option<MetadataRecord>, StoreError> {
        let mut info = self.get_info(&[path.to_path_buf()]).await?;
        Ok(info.remove(path))
    }

    /// Unconditional removal.
    pub async fn delete_records(&self, paths: &[PathBuf]) -> Result<(), StoreError> {
        let keys: Vec<String> = paths.iter().filter_map(|p| path_key(p).ok()).collect();
        if keys.is_empty() {
            return Ok(());
        }
        let batched = keys.len() > 1;
        let delete = move |conn: &Connection| -> rusqlite::Result<()> {
            for chunk in keys.chunks(MAX_PARAMS) {
                let sql = format!(
                    "DELETE FROM files WHERE path IN ({})",
                    placeholders(chunk.len())
                );
                conn.execute(&sql, params_from_iter(chunk.iter()))?;
            }
            Ok(())
        };
        if batched {
            self.in_transaction(delete).await
        } else {
            self.with_conn(delete).await
        }
    }

    /// Every row at or below `prefix`, earliest custom time first; rows
    /// without a time come last.
    pub async fn list_by_root(&self, prefix: &Path) -> Result<Vec<MetadataRecord>, StoreError> {
        let (exact, below) = prefix_params(prefix)?;
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT path, type, level_tag, custom_time FROM files \
                 WHERE (path = ?1 OR substr(path, 1, length(?2)) = ?2) \
                 ORDER BY (custom_time IS NULL OR custom_time = ''), custom_time, path",
            )?;
            let rows = stmt.query_map([exact, below], MetadataRecord::from_row)?;
            let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    /// Rows at or below `prefix` carrying `tag`, ordered by path.
    pub async fn list_by_level(
        &self,
        tag: LevelTag,
        prefix: &Path,
    ) -> Result<Vec<MetadataRecord>, StoreError> {
        let (exact, below) = prefix_params(prefix)?;
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT path, type, level_tag, custom_time FROM files \
                 WHERE level_tag = ?1 AND (path = ?2 OR substr(path, 1, length(?3)) = ?3) \
                 ORDER BY path",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![tag.as_str(), exact, below],
                MetadataRecord::from_row,
            )?;
            let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    /// Drop every row at or below `prefix`. Returns the number removed.
    pub async fn purge_root(&self, prefix: &Path) -> Result<usize, StoreError> {
        let (exact, below) = prefix_params(prefix)?;
        self.in_transaction(move |conn| {
            conn.execute(
                "DELETE FROM files WHERE path = ?1 OR substr(path, 1, length(?2)) = ?2",
                [exact, below],
            )
        })
        .await
    }

    pub async fn row_count(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0)))
            .await
    }
}

/// The stored form of a path. Rows are keyed by exact text, so a lossy
/// conversion would let two distinct names share one row.
pub(crate) fn path_key(path: &Path) -> Result<String, StoreError> {
    path.to_str()
        .map(str::to_owned)
        .ok_or_else(|| StoreError::NonUtf8Path(path.to_path_buf()))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

/// `(exact, prefix)` matching `prefix` and anything beneath it on a
/// separator boundary. Compared with `substr`, which is case-sensitive,
/// unlike `LIKE`.
fn prefix_params(prefix: &Path) -> Result<(String, String), StoreError> {
    let exact = path_key(prefix)?;
    let mut below = exact.trim_end_matches(MAIN_SEPARATOR).to_string();
    below.push(MAIN_SEPARATOR);
    Ok((exact, below))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 8, 0, 0).unwrap()
    }

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[tokio::test]
    async fn upsert_files_coalesces_tag_and_time() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.set_level_tag(&[p("/r/a")], Some(LevelTag::Important)).await.unwrap();
        store.set_custom_time(&[p("/r/a")], Some(t(1))).await.unwrap();

        let mut entry = ScannedEntry::new("/r/a", EntryKind::File);
        entry.level_tag = Some(LevelTag::Temp);
        entry.custom_time = Some(t(9));
        store.upsert_files(&[entry, ScannedEntry::new("/r/b", EntryKind::Dir)]).await.unwrap();

        let a = store.get_one(&p("/r/a")).await.unwrap().unwrap();
        assert_eq!(a.kind, Some(EntryKind::File));
        assert_eq!(a.level_tag, Some(LevelTag::Important));
        assert_eq!(a.custom_time, Some(t(1)));

        let b = store.get_one(&p("/r/b")).await.unwrap().unwrap();
        assert_eq!(b.kind, Some(EntryKind::Dir));
        assert_eq!(b.level_tag, None);
    }

    #[tokio::test]
    async fn upsert_files_twice_keeps_one_row_per_path() {
        let store = MetadataStore::open_in_memory().unwrap();
        let batch = vec![
            ScannedEntry::new("/r/a", EntryKind::File),
            ScannedEntry::new("/r/b", EntryKind::Dir),
            ScannedEntry::new("/r/b/c", EntryKind::File),
        ];
        store.upsert_files(&batch).await.unwrap();
        let first = store.list_by_root(&p("/r")).await.unwrap();
        store.upsert_files(&batch).await.unwrap();
        let second = store.list_by_root(&p("/r")).await.unwrap();

        assert_eq!(store.row_count().await.unwrap(), 3);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn upsert_file_types_leaves_tags_alone() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.set_level_tag(&[p("/r/a")], Some(LevelTag::Temp)).await.unwrap();
        store.upsert_file_types(&[(p("/r/a"), EntryKind::Dir)]).await.unwrap();

        let a = store.get_one(&p("/r/a")).await.unwrap().unwrap();
        assert_eq!(a.kind, Some(EntryKind::Dir));
        assert_eq!(a.level_tag, Some(LevelTag::Temp));
    }

    #[tokio::test]
    async fn set_level_tag_materialises_row_without_type() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.set_level_tag(&[p("/r/new")], Some(LevelTag::Normal)).await.unwrap();

        let row = store.get_one(&p("/r/new")).await.unwrap().unwrap();
        assert_eq!(row.kind, None);
        assert_eq!(row.level_tag, Some(LevelTag::Normal));

        store.set_level_tag(&[p("/r/new")], None).await.unwrap();
        let row = store.get_one(&p("/r/new")).await.unwrap().unwrap();
        assert_eq!(row.level_tag, None);
    }

    #[tokio::test]
    async fn custom_time_is_sticky_against_fill_writes() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.set_custom_time(&[p("/r/x")], Some(t(3))).await.unwrap();
        store
            .set_custom_time_if_null(&[
                (p("/r/x"), Some(EntryKind::File), t(20)),
                (p("/r/y"), Some(EntryKind::File), t(21)),
            ])
            .await
            .unwrap();

        let info = store.get_info(&[p("/r/x"), p("/r/y")]).await.unwrap();
        assert_eq!(info[&p("/r/x")].custom_time, Some(t(3)));
        assert_eq!(info[&p("/r/x")].kind, Some(EntryKind::File));
        assert_eq!(info[&p("/r/y")].custom_time, Some(t(21)));

        store.set_custom_time(&[p("/r/x")], Some(t(5))).await.unwrap();
        let x = store.get_one(&p("/r/x")).await.unwrap().unwrap();
        assert_eq!(x.custom_time, Some(t(5)));
    }

    #[tokio::test]
    async fn fill_if_empty_does_not_replace_existing_type() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.upsert_file_types(&[(p("/r/d"), EntryKind::Dir)]).await.unwrap();
        store
            .set_custom_time_if_null(&[(p("/r/d"), Some(EntryKind::File), t(2))])
            .await
            .unwrap();
        let d = store.get_one(&p("/r/d")).await.unwrap().unwrap();
        assert_eq!(d.kind, Some(EntryKind::Dir));
    }

    #[tokio::test]
    async fn get_info_omits_missing_and_delete_removes() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.upsert_file_types(&[(p("/r/a"), EntryKind::File)]).await.unwrap();

        let info = store.get_info(&[p("/r/a"), p("/r/missing")]).await.unwrap();
        assert_eq!(info.len(), 1);

        store.delete_records(&[p("/r/a"), p("/r/missing")]).await.unwrap();
        assert!(store.get_info(&[p("/r/a")]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listing_respects_path_boundaries() {
        let store = MetadataStore::open_in_memory().unwrap();
        store
            .upsert_file_types(&[
                (p("/r/a"), EntryKind::Dir),
                (p("/r/a/one"), EntryKind::File),
                (p("/r/ab"), EntryKind::File),
                (p("/r/a_c"), EntryKind::File),
            ])
            .await
            .unwrap();
        store
            .set_level_tag(&[p("/r/a/one"), p("/r/ab")], Some(LevelTag::Temp))
            .await
            .unwrap();

        let under_a: Vec<PathBuf> = store
            .list_by_root(&p("/r/a"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(under_a.len(), 2);
        assert!(under_a.contains(&p("/r/a")));
        assert!(under_a.contains(&p("/r/a/one")));

        let temp = store.list_by_level(LevelTag::Temp, &p("/r")).await.unwrap();
        let temp: Vec<PathBuf> = temp.into_iter().map(|r| r.path).collect();
        assert_eq!(temp, vec![p("/r/a/one"), p("/r/ab")]);
    }

    #[tokio::test]
    async fn list_by_root_orders_by_custom_time() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.upsert_file_types(&[(p("/r/none"), EntryKind::File)]).await.unwrap();
        store.set_custom_time(&[p("/r/late")], Some(t(9))).await.unwrap();
        store.set_custom_time(&[p("/r/early")], Some(t(1))).await.unwrap();

        let order: Vec<PathBuf> = store
            .list_by_root(&p("/r"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(order, vec![p("/r/early"), p("/r/late"), p("/r/none")]);
    }

    #[tokio::test]
    async fn failed_transaction_rolls_back() {
        let store = MetadataStore::open_in_memory().unwrap();
        let result: Result<(), StoreError> = store
            .in_transaction(|conn| {
                RecordWrite::new("/r/rolled")
                    .kind(WriteMode::Overwrite, Some(EntryKind::File))
                    .apply("/r/rolled", conn)?;
                conn.execute("INSERT INTO no_such_table VALUES (1)", [])?;
                Ok(())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.row_count().await.unwrap(), 0);

        // The queue is free again after a failure.
        store
            .upsert_file_types(&[(p("/r/a"), EntryKind::File), (p("/r/b"), EntryKind::File)])
            .await
            .unwrap();
        assert_eq!(store.row_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn purge_root_removes_subtree_only() {
        let store = MetadataStore::open_in_memory().unwrap();
        store
            .upsert_file_types(&[
                (p("/r1/a"), EntryKind::File),
                (p("/r1/b/c"), EntryKind::File),
                (p("/r10/a"), EntryKind::File),
            ])
            .await
            .unwrap();
        assert_eq!(store.purge_root(&p("/r1")).await.unwrap(), 2);
        assert_eq!(store.row_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn prefixes_are_case_sensitive() {
        let store = MetadataStore::open_in_memory().unwrap();
        store
            .upsert_file_types(&[
                (p("/r/a"), EntryKind::Dir),
                (p("/r/a/x"), EntryKind::File),
                (p("/r/A"), EntryKind::Dir),
                (p("/r/A/x"), EntryKind::File),
            ])
            .await
            .unwrap();
        store
            .set_level_tag(&[p("/r/a/x"), p("/r/A/x")], Some(LevelTag::Temp))
            .await
            .unwrap();

        let upper: Vec<PathBuf> = store
            .list_by_root(&p("/r/A"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(upper, vec![p("/r/A"), p("/r/A/x")]);

        let tagged = store.list_by_level(LevelTag::Temp, &p("/r/A")).await.unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].path, p("/r/A/x"));

        assert_eq!(store.purge_root(&p("/r/A")).await.unwrap(), 2);
        let lower = store.get_one(&p("/r/a/x")).await.unwrap().unwrap();
        assert_eq!(lower.level_tag, Some(LevelTag::Temp));
    }

    #[tokio::test]
    async fn concurrent_batches_all_commit() {
        let store = Arc::new(MetadataStore::open_in_memory().unwrap());
        let mut handles = Vec::new();
        for batch in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let records: Vec<(PathBuf, EntryKind)> = (0..25)
                    .map(|i| (PathBuf::from(format!("/r/{batch}/{i}")), EntryKind::File))
                    .collect();
                store.upsert_file_types(&records).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.row_count().await.unwrap(), 200);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_utf8_paths_are_rejected_not_merged() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let store = MetadataStore::open_in_memory().unwrap();
        let first = Path::new("/r").join(OsStr::from_bytes(b"bad\xff"));
        let second = Path::new("/r").join(OsStr::from_bytes(b"bad\xfe"));

        let err = store
            .upsert_file_types(&[(p("/r/ok"), EntryKind::File), (first.clone(), EntryKind::File)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NonUtf8Path(_)));
        assert_eq!(store.row_count().await.unwrap(), 0);

        assert!(store.get_info(&[first, second]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("metadata.db");
        {
            let store = MetadataStore::open(&db).unwrap();
            store.set_level_tag(&[p("/r/keep")], Some(LevelTag::Important)).await.unwrap();
        }
        let store = MetadataStore::open(&db).unwrap();
        let row = store.get_one(&p("/r/keep")).await.unwrap().unwrap();
        assert_eq!(row.level_tag, Some(LevelTag::Important));
    }
}
