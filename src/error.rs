//! Error types for mirroring operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from copy, watch and reconcile operations.
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("{op} failed for {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("source vanished before it could be mirrored: {path}")]
    SourceVanished { path: PathBuf },

    #[error("path {path} is not under root {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error("{failed} entries under {path} could not be mirrored")]
    Incomplete { path: PathBuf, failed: u64 },

    #[error("file watch error: {details}")]
    Watch { details: String },

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T, E = MirrorError> = std::result::Result<T, E>;

/// How the retry wrapper treats a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// Locked or busy entries; worth another attempt.
    Transient,
    /// Retrying will not help.
    Permanent,
    /// The source disappeared; the event is already convergent.
    Vanished,
}

impl MirrorError {
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        MirrorError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            MirrorError::Io { source, .. } => classify_io(source),
            MirrorError::SourceVanished { .. } => FailureClass::Vanished,
            MirrorError::Incomplete { .. } => FailureClass::Transient,
            MirrorError::OutsideRoot { .. }
            | MirrorError::Watch { .. }
            | MirrorError::Cancelled => FailureClass::Permanent,
        }
    }
}

impl From<notify::Error> for MirrorError {
    fn from(e: notify::Error) -> Self {
        MirrorError::Watch {
            details: e.to_string(),
        }
    }
}

impl From<walkdir::Error> for MirrorError {
    fn from(e: walkdir::Error) -> Self {
        let path = e.path().map(|p| p.to_path_buf()).unwrap_or_default();
        let source = e
            .into_io_error()
            .unwrap_or_else(|| io::Error::other("filesystem loop detected"));
        MirrorError::Io {
            op: "walk",
            path,
            source,
        }
    }
}

fn classify_io(e: &io::Error) -> FailureClass {
    // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
    #[cfg(windows)]
    if matches!(e.raw_os_error(), Some(32) | Some(33)) {
        return FailureClass::Transient;
    }
    match e.kind() {
        io::ErrorKind::PermissionDenied
        | io::ErrorKind::StorageFull
        | io::ErrorKind::ReadOnlyFilesystem
        | io::ErrorKind::Unsupported
        | io::ErrorKind::InvalidInput => FailureClass::Permanent,
        _ => FailureClass::Transient,
    }
}
