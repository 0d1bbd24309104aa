//! Error types for fastpipe-core.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Why a registry lookup came back empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotFoundCause {
    /// No record file exists for the name.
    Missing,
    /// The record file exists but cannot be read as a `ServiceRecord`.
    Corrupt,
    /// The record names a process that is no longer running.
    Stale { pid: i32 },
}

impl fmt::Display for NotFoundCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotFoundCause::Missing => write!(f, "is not registered; was the service published?"),
            NotFoundCause::Corrupt => {
                write!(f, "has an invalid registry entry; try recreating the service")
            }
            NotFoundCause::Stale { pid } => {
                write!(f, "appears to be stale (process {pid} is not running)")
            }
        }
    }
}

/// All errors that can arise from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Underlying I/O failure (permission denied, disk full, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error (write path).
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// JSON parse error on load, with the offending file.
    #[error("failed to parse service record at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// No live record exists for the service.
    #[error("service '{name}' {cause}")]
    NotFound { name: String, cause: NotFoundCause },

    /// The name cannot be used as a single path component.
    #[error("invalid name '{name}': must be non-empty, not '.' or '..', and contain no path separators")]
    InvalidName { name: String },

    /// A different, still-running process owns the name.
    #[error("service '{name}' is already registered by pid {pid}")]
    AlreadyExists { name: String, pid: i32 },

    /// `FASTPIPE_HOME` is unset and the working directory is unavailable.
    #[error("cannot determine current directory for the default root: {0}")]
    CurrentDir(#[source] std::io::Error),
}

/// Failure to extract a typed argument from a request.
#[derive(Debug, Error)]
pub enum ArgumentError {
    #[error("missing required argument '{name}' (position {index})")]
    Missing { index: usize, name: String },

    #[error("argument '{name}' has the wrong type: {source}")]
    Invalid {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}
