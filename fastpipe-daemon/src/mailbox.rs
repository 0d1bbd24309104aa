//! Request/response mailbox shared by clients and servers.
//!
//! A service workspace holds `requests/` and `responses/`. Every message is
//! written to `{id}.tmp` in the target directory and renamed to `{id}.json`,
//! so a reader scanning for `*.json` never sees a partial write. The consumer
//! of a file deletes it; each message is delivered at most once.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use uuid::Uuid;

use fastpipe_core::paths::{self, message_path, requests_dir, responses_dir, temp_path};
use fastpipe_core::{RequestMessage, ResponseMessage};

use crate::error::{io_err, FastpipeError};

/// The pair of directories backing one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    requests: PathBuf,
    responses: PathBuf,
}

impl Mailbox {
    /// Create `requests/` and `responses/` under `service_root` if absent.
    pub fn create(service_root: &Path) -> Result<Self, FastpipeError> {
        let mailbox = Self::layout(service_root);
        for dir in [&mailbox.requests, &mailbox.responses] {
            fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }
        Ok(mailbox)
    }

    /// Open an existing mailbox; `None` if either directory is missing.
    pub fn open(service_root: &Path) -> Option<Self> {
        let mailbox = Self::layout(service_root);
        (mailbox.requests.is_dir() && mailbox.responses.is_dir()).then_some(mailbox)
    }

    fn layout(service_root: &Path) -> Self {
        Self {
            requests: requests_dir(service_root),
            responses: responses_dir(service_root),
        }
    }

    pub fn requests_dir(&self) -> &Path {
        &self.requests
    }

    pub fn responses_dir(&self) -> &Path {
        &self.responses
    }

    pub fn request_path(&self, id: &str) -> PathBuf {
        message_path(&self.requests, id)
    }

    pub fn response_path(&self, id: &str) -> PathBuf {
        message_path(&self.responses, id)
    }

    /// Commit a request; the caller must have assigned `request.id`.
    pub fn write_request(&self, id: &str, request: &RequestMessage) -> Result<PathBuf, FastpipeError> {
        write_atomic(&self.requests, id, request)
    }

    pub fn write_response(&self, response: &ResponseMessage) -> Result<PathBuf, FastpipeError> {
        write_atomic(&self.responses, &response.id, response)
    }

    /// Committed request files in sorted filename order.
    pub fn pending_requests(&self) -> Result<Vec<PathBuf>, FastpipeError> {
        let entries = match fs::read_dir(&self.requests) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(io_err(&self.requests, err)),
        };
        let mut pending: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.path())
            .filter(|p| is_message_file(p))
            .collect();
        pending.sort();
        Ok(pending)
    }

    /// Read then delete `path`.
    ///
    /// Returns `None` when the file vanished before the delete succeeded, i.e.
    /// another consumer claimed it.
    pub fn take(&self, path: &Path) -> Result<Option<Vec<u8>>, FastpipeError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_err(path, err)),
        };
        match fs::remove_file(path) {
            Ok(()) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(path, err)),
        }
    }

    /// Client side: claim the response for `id` if it has been committed.
    pub fn take_response(&self, id: &str) -> Result<Option<Vec<u8>>, FastpipeError> {
        check_message_id(id)?;
        self.take(&self.response_path(id))
    }

    /// Delete message and temp files older than `max_age` from both directories.
    ///
    /// These are requests nobody served and responses whose client gave up.
    /// Returns the number of files removed.
    pub fn sweep(&self, max_age: Duration) -> Result<usize, FastpipeError> {
        let now = SystemTime::now();
        let mut removed = 0;
        for dir in [&self.requests, &self.responses] {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(io_err(dir, err)),
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let Ok(meta) = entry.metadata() else { continue };
                if !meta.is_file() {
                    continue;
                }
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|modified| now.duration_since(modified).ok())
                    .unwrap_or_default();
                if age <= max_age {
                    continue;
                }
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(io_err(entry.path(), err)),
                }
            }
        }
        Ok(removed)
    }
}

/// Fresh request id: 32 lowercase hex characters.
pub fn new_message_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Ids become file names; anything that could leave the mailbox directory is refused.
pub fn check_message_id(id: &str) -> Result<(), FastpipeError> {
    if paths::is_plain_component(id) {
        Ok(())
    } else {
        Err(FastpipeError::InvalidMessageId(id.to_string()))
    }
}

/// `true` for committed `*.json` message files.
pub fn is_message_file(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some(paths::MESSAGE_EXT)
}

/// Write flow: serialize (compact) → `{id}.tmp` → `rename` to `{id}.json`.
fn write_atomic<T: Serialize>(dir: &Path, id: &str, message: &T) -> Result<PathBuf, FastpipeError> {
    check_message_id(id)?;
    let target = message_path(dir, id);
    let tmp = temp_path(dir, id);
    let bytes = serde_json::to_vec(message)?;
    fs::write(&tmp, bytes).map_err(|e| io_err(&tmp, e))?;
    fs::rename(&tmp, &target).map_err(|e| io_err(&target, e))?;
    Ok(target)
}
