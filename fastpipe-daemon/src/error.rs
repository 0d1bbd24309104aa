use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use fastpipe_core::RegistryError;

/// Error surface for servers, the daemon manager and client construction.
#[derive(Debug, Error)]
pub enum FastpipeError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message id '{0}' is not a plain file name")]
    InvalidMessageId(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("endpoint '{0}' is already registered")]
    DuplicateEndpoint(String),

    #[error("service '{0}' is running as a daemon; no new endpoints can be registered")]
    Frozen(String),

    #[error("cannot run daemon '{0}' without at least one registered endpoint")]
    NoEndpoints(String),

    #[error("daemon is already running for service '{0}'")]
    AlreadyRunning(String),

    #[error("service '{service}' did not start within {:.1}s", .timeout.as_secs_f64())]
    StartupTimeout { service: String, timeout: Duration },

    #[error("daemon for '{service}' (pid {pid}) exited during startup")]
    DaemonExited { service: String, pid: i32 },

    #[error("failed to spawn daemon for '{service}': {source}")]
    Spawn {
        service: String,
        #[source]
        source: nix::Error,
    },

    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("failed to install shutdown signal handlers: {0}")]
    SignalHandler(#[source] std::io::Error),

    #[error(transparent)]
    Remote(#[from] RemoteExecutionError),
}

/// The single failure type seen by client callers, whether the cause was local
/// (timeout, missing mailbox) or remote (the endpoint failed).
#[derive(Debug, Error)]
pub enum RemoteExecutionError {
    #[error(
        "timeout waiting for response from service '{service}' after {}s",
        .timeout.as_secs_f64()
    )]
    Timeout { service: String, timeout: Duration },

    #[error("service '{service}' is unavailable: {reason}")]
    ServiceUnavailable { service: String, reason: String },

    #[error(
        "remote call to '{service}.{endpoint}' failed:\n  Type: {kind}\n  Message: {message}\n  Args: {}\n  Kwargs: {}",
        Value::Array(.args.clone()),
        Value::Object(.kwargs.clone())
    )]
    Remote {
        service: String,
        endpoint: String,
        kind: String,
        message: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },

    #[error("protocol error talking to service '{service}': {detail}")]
    Protocol { service: String, detail: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RemoteExecutionError {
    /// Remote exception type for `Remote` errors.
    pub fn remote_kind(&self) -> Option<&str> {
        match self {
            RemoteExecutionError::Remote { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> FastpipeError {
    FastpipeError::Io {
        path: path.into(),
        source,
    }
}
