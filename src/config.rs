//! Engine configuration.
//!
//! Read from a JSON file, then overridden from the environment. Nothing here
//! is ever written back; registering roots at runtime does not persist.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A user-registered top-level directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub path: PathBuf,
}

impl RootConfig {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            id: id.into(),
            name,
            path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite file; `:memory:` keeps everything in process.
    pub database_path: PathBuf,
    pub roots: Vec<RootConfig>,
    /// Deadline before a tracked operation is reconciled without an event.
    pub tracker_timeout_ms: u64,
    /// Quiet period a path must see before the watcher reconciles it.
    pub stabilization_ms: u64,
    /// Watcher loop tick.
    pub poll_interval_ms: u64,
    /// Capacity of the change feed channel.
    pub feed_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("metadata.db"),
            roots: Vec::new(),
            tracker_timeout_ms: 5_000,
            stabilization_ms: 200,
            poll_interval_ms: 100,
            feed_buffer: 256,
        }
    }
}

impl EngineConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Apply `FSMETA_DB_PATH` and `FSMETA_TRACKER_TIMEOUT_MS` overrides.
    pub fn apply_env(mut self) -> Self {
        if let Ok(db) = env::var("FSMETA_DB_PATH") {
            self.database_path = PathBuf::from(db);
        }
        if let Some(ms) = env::var("FSMETA_TRACKER_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.tracker_timeout_ms = ms;
        }
        self
    }

    pub fn tracker_timeout(&self) -> Duration {
        Duration::from_millis(self.tracker_timeout_ms)
    }

    pub fn stabilization(&self) -> Duration {
        Duration::from_millis(self.stabilization_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Settings tuned for tests: in-memory store, short delays.
    pub fn in_memory() -> Self {
        Self {
            database_path: PathBuf::from(":memory:"),
            tracker_timeout_ms: 500,
            stabilization_ms: 20,
            poll_interval_ms: 10,
            ..Self::default()
        }
    }
}
