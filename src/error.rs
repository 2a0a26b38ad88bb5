//! Error types for every layer of the engine.
//!
//! Reconciliation-layer failures are logged and swallowed by their callers;
//! the types here are what reaches an operation caller.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by [`crate::metadata::MetadataStore`].
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("store connection mutex poisoned")]
    Poisoned,

    #[error("path {0:?} is not valid UTF-8 and cannot be stored")]
    NonUtf8Path(PathBuf),
}

/// Errors that can occur in the file watcher system.
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Failed to create watcher: {0}")]
    WatcherCreation(#[from] notify::Error),

    #[error("Failed to watch path {path}: {source}")]
    WatchPath {
        path: PathBuf,
        source: notify::Error,
    },
}

/// Errors surfaced by [`crate::engine::MetadataEngine`] operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Watcher(#[from] WatcherError),

    #[error("i/o error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("root {0} is not registered")]
    UnknownRoot(String),

    #[error("path {path} is outside its root")]
    OutsideRoot { path: PathBuf },

    #[error("target {path} already exists")]
    AlreadyExists { path: PathBuf },

    #[error("root path {path} is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("invalid entry name {0:?}")]
    InvalidName(String),

    #[error("cannot place {from} inside itself at {to}")]
    IntoItself { from: PathBuf, to: PathBuf },

    /// A multi-step mutation stopped part way. The store may disagree with
    /// disk for the listed paths until a rescan runs.
    #[error("operation stopped after {completed} of {total} entries; rescan required")]
    SyncRequired {
        completed: usize,
        total: usize,
        pending: Vec<PathBuf>,
        #[source]
        source: Box<EngineError>,
    },
}

/// Stable classification of an [`EngineError`] for the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    NotFound,
    Conflict,
    InvalidInput,
    SyncRequired,
    Storage,
    Io,
}

impl EngineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify this error without inspecting its message.
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Store(_) => ErrorClass::Storage,
            EngineError::Watcher(_) => ErrorClass::Io,
            EngineError::Io { source, .. } => match source.kind() {
                io::ErrorKind::NotFound => ErrorClass::NotFound,
                io::ErrorKind::AlreadyExists => ErrorClass::Conflict,
                _ => ErrorClass::Io,
            },
            EngineError::UnknownRoot(_) => ErrorClass::NotFound,
            EngineError::OutsideRoot { .. }
            | EngineError::NotADirectory { .. }
            | EngineError::InvalidName(_)
            | EngineError::IntoItself { .. } => ErrorClass::InvalidInput,
            EngineError::AlreadyExists { .. } => ErrorClass::Conflict,
            EngineError::SyncRequired { .. } => ErrorClass::SyncRequired,
        }
    }
}

/// Races a scan or reconciliation should step over rather than fail on.
pub fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
    ) {
        return true;
    }
    // EPERM and EBUSY have no stable ErrorKind on every toolchain we build with.
    matches!(err.raw_os_error(), Some(1) | Some(16))
}
