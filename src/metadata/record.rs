//! Row types shared by the store, the tracker and the watcher.

use chrono::{DateTime, Utc};
use rusqlite::types::{ToSql, ToSqlOutput};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::Metadata;
use std::path::PathBuf;
use std::str::FromStr;

/// Whether a path is a regular file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Dir => "dir",
        }
    }

    pub fn from_metadata(meta: &Metadata) -> Self {
        if meta.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        }
    }

    /// Lenient parse used when reading rows: unknown text is "no kind".
    fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(EntryKind::File),
            "dir" => Some(EntryKind::Dir),
            _ => None,
        }
    }
}

impl ToSql for EntryKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

/// User-assigned importance. A missing tag means "never classified",
/// which is different from [`LevelTag::Normal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelTag {
    Important,
    Normal,
    Temp,
}

impl LevelTag {
    pub fn as_str(self) -> &'static str {
        match self {
            LevelTag::Important => "important",
            LevelTag::Normal => "normal",
            LevelTag::Temp => "temp",
        }
    }
}

impl fmt::Display for LevelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLevelTag(pub String);

impl fmt::Display for UnknownLevelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown level tag {:?}", self.0)
    }
}

impl std::error::Error for UnknownLevelTag {}

impl FromStr for LevelTag {
    type Err = UnknownLevelTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "important" => Ok(LevelTag::Important),
            "normal" => Ok(LevelTag::Normal),
            "temp" => Ok(LevelTag::Temp),
            other => Err(UnknownLevelTag(other.to_string())),
        }
    }
}

impl ToSql for LevelTag {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

/// One row of the `files` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub path: PathBuf,
    pub kind: Option<EntryKind>,
    pub level_tag: Option<LevelTag>,
    pub custom_time: Option<DateTime<Utc>>,
}

impl MetadataRecord {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let path: String = row.get(0)?;
        let kind: Option<String> = row.get(1)?;
        let level_tag: Option<String> = row.get(2)?;
        let custom_time: Option<String> = row.get(3)?;
        Ok(Self {
            path: PathBuf::from(path),
            kind: kind.as_deref().and_then(EntryKind::parse),
            level_tag: level_tag
                .as_deref()
                .filter(|s| !s.is_empty())
                .and_then(|s| s.parse().ok()),
            custom_time: custom_time.as_deref().and_then(parse_time),
        })
    }

    /// Metadata to transplant onto the destination of a rename or move.
    ///
    /// The tag is always carried explicitly, so an untagged source clears
    /// whatever tag the destination may already hold.
    pub fn carried(&self) -> CarriedMeta {
        CarriedMeta {
            level_tag: Some(self.level_tag),
            custom_time: self.custom_time,
        }
    }
}

/// Metadata captured when an operation is issued, applied once the
/// destination path is confirmed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CarriedMeta {
    /// `None`: leave the tag alone. `Some(None)`: clear it.
    pub level_tag: Option<Option<LevelTag>>,
    pub custom_time: Option<DateTime<Utc>>,
}

impl CarriedMeta {
    pub fn with_level_tag(tag: Option<LevelTag>) -> Self {
        Self {
            level_tag: Some(tag),
            custom_time: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.level_tag.is_none() && self.custom_time.is_none()
    }
}

/// Render a time the way the `custom_time` column stores it.
pub(crate) fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Parse a stored time. Accepts RFC 3339 and SQLite's own datetime text;
/// an empty or malformed value reads as no time at all.
pub(crate) fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
