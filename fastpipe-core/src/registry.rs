//! Filesystem-backed service registry.
//!
//! # Storage layout
//!
//! ```text
//! <root>/
//!   registry/<name>.json     ServiceRecord (mode 0600, temp + rename)
//!   services/<name>/         service workspace (mode 0700)
//! ```
//!
//! # API pattern
//!
//! Every function has two forms:
//! - `fn_at(root: &Path, …)`: explicit root; used in tests with `TempDir`
//! - `fn(…)`: derives root from `FASTPIPE_HOME`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.
//!
//! A record is only meaningful while its pid is alive. Stale records are
//! treated as absent and removed the next time they are resolved.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::error::{NotFoundCause, RegistryError};
use crate::paths::{
    self, check_component, fastpipe_root, record_path, registry_dir, service_dir, services_root,
};
use crate::types::{current_pid, ServiceRecord};

// ---------------------------------------------------------------------------
// 1. Directories
// ---------------------------------------------------------------------------

/// Create `<root>/services` and `<root>/registry` if absent.
pub fn ensure_directories_at(root: &Path) -> Result<(), RegistryError> {
    create_private_dir(&services_root(root))?;
    create_private_dir(&registry_dir(root))?;
    Ok(())
}

/// `ensure_directories_at` convenience wrapper.
pub fn ensure_directories() -> Result<(), RegistryError> {
    ensure_directories_at(&fastpipe_root()?)
}

/// `<root>/services/<name>/`, created if absent. Does not touch the registry.
pub fn service_root_at(root: &Path, name: &str) -> Result<PathBuf, RegistryError> {
    check_component(name)?;
    ensure_directories_at(root)?;
    let dir = service_dir(root, name);
    create_private_dir(&dir)?;
    Ok(dir)
}

/// `service_root_at` convenience wrapper.
pub fn service_root(name: &str) -> Result<PathBuf, RegistryError> {
    service_root_at(&fastpipe_root()?, name)
}

// ---------------------------------------------------------------------------
// 2. Liveness
// ---------------------------------------------------------------------------

/// Non-destructive check of whether `pid` denotes a running process.
///
/// `EPERM` means the process exists under another user, so it counts as alive.
pub fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    if pid == current_pid() {
        return true;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// 3. Register / unregister
// ---------------------------------------------------------------------------

/// Publish `record`, replacing any dead or unreadable previous entry.
///
/// Returns `RegistryError::AlreadyExists` if another live process owns the name.
pub fn register_at(root: &Path, record: &ServiceRecord) -> Result<(), RegistryError> {
    check_component(&record.name)?;
    ensure_directories_at(root)?;
    let path = record_path(root, &record.name);
    match load_record(&path) {
        Ok(existing) if existing.pid != record.pid && is_process_alive(existing.pid) => {
            return Err(RegistryError::AlreadyExists {
                name: record.name.clone(),
                pid: existing.pid,
            });
        }
        Ok(_) | Err(RegistryError::Parse { .. }) => {}
        Err(RegistryError::Io(err)) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    write_record(&path, record)?;
    tracing::debug!(service = %record.name, pid = record.pid, "service registered");
    Ok(())
}

/// `register_at` convenience wrapper.
pub fn register(record: &ServiceRecord) -> Result<(), RegistryError> {
    register_at(&fastpipe_root()?, record)
}

/// Remove the record for `name`. Returns whether a file was deleted.
///
/// With `expected_pid`, the record is only removed if it still belongs to that
/// pid, so a late cleanup never deletes a newer registration.
pub fn unregister_at(
    root: &Path,
    name: &str,
    expected_pid: Option<i32>,
) -> Result<bool, RegistryError> {
    check_component(name)?;
    let path = record_path(root, name);
    if let Some(expected) = expected_pid {
        match load_record(&path) {
            Ok(existing) if existing.pid != expected => return Ok(false),
            Ok(_) | Err(RegistryError::Parse { .. }) => {}
            Err(RegistryError::Io(err)) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        }
    }
    match std::fs::remove_file(&path) {
        Ok(()) => {
            tracing::debug!(service = %name, "service unregistered");
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// `unregister_at` convenience wrapper.
pub fn unregister(name: &str, expected_pid: Option<i32>) -> Result<bool, RegistryError> {
    unregister_at(&fastpipe_root()?, name, expected_pid)
}

// ---------------------------------------------------------------------------
// 4. Resolve
// ---------------------------------------------------------------------------

/// Look up the live record for `name`.
///
/// Missing, corrupt and stale records all surface as `RegistryError::NotFound`;
/// a stale record is deleted before returning.
pub fn resolve_at(root: &Path, name: &str) -> Result<ServiceRecord, RegistryError> {
    check_component(name)?;
    let path = record_path(root, name);
    let record = match load_record(&path) {
        Ok(record) => record,
        Err(RegistryError::Io(err)) if err.kind() == ErrorKind::NotFound => {
            return Err(not_found(name, NotFoundCause::Missing));
        }
        Err(RegistryError::Parse { .. }) => {
            return Err(not_found(name, NotFoundCause::Corrupt));
        }
        Err(err) => return Err(err),
    };
    if !is_process_alive(record.pid) {
        tracing::info!(service = %name, pid = record.pid, "removing stale service record");
        unregister_at(root, name, Some(record.pid))?;
        return Err(not_found(name, NotFoundCause::Stale { pid: record.pid }));
    }
    Ok(record)
}

/// `resolve_at` convenience wrapper.
pub fn resolve(name: &str) -> Result<ServiceRecord, RegistryError> {
    resolve_at(&fastpipe_root()?, name)
}

// ---------------------------------------------------------------------------
// 5. Listing and pruning
// ---------------------------------------------------------------------------

/// One registry file as seen by [`list_at`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedService {
    pub name: String,
    /// `None` when the file could not be parsed.
    pub record: Option<ServiceRecord>,
    pub alive: bool,
}

/// Every `*.json` record under `<root>/registry/`, sorted by name. Read-only.
pub fn list_at(root: &Path) -> Result<Vec<ListedService>, RegistryError> {
    let dir = registry_dir(root);
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut entries: Vec<_> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let mut services = Vec::new();
    for entry in entries {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(paths::MESSAGE_EXT) {
            continue;
        }
        let Some(name) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        let listed = match load_record(&path) {
            Ok(record) => ListedService {
                alive: is_process_alive(record.pid),
                name,
                record: Some(record),
            },
            Err(RegistryError::Parse { .. }) => ListedService {
                name,
                record: None,
                alive: false,
            },
            // Raced with an unregister.
            Err(RegistryError::Io(err)) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        services.push(listed);
    }
    Ok(services)
}

/// `list_at` convenience wrapper.
pub fn list() -> Result<Vec<ListedService>, RegistryError> {
    list_at(&fastpipe_root()?)
}

/// Delete stale and corrupt records. Returns the pruned names.
pub fn prune_stale_at(root: &Path) -> Result<Vec<String>, RegistryError> {
    let mut pruned = Vec::new();
    for service in list_at(root)? {
        if service.alive {
            continue;
        }
        let expected = service.record.as_ref().map(|r| r.pid);
        if unregister_at(root, &service.name, expected)? {
            pruned.push(service.name);
        }
    }
    Ok(pruned)
}

/// `prune_stale_at` convenience wrapper.
pub fn prune_stale() -> Result<Vec<String>, RegistryError> {
    prune_stale_at(&fastpipe_root()?)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn not_found(name: &str, cause: NotFoundCause) -> RegistryError {
    RegistryError::NotFound {
        name: name.to_string(),
        cause,
    }
}

fn load_record(path: &Path) -> Result<ServiceRecord, RegistryError> {
    let contents = std::fs::read(path)?;
    serde_json::from_slice(&contents).map_err(|source| RegistryError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Write flow: serialize → `<name>.tmp` sibling → `chmod 0600` → `rename`.
fn write_record(path: &Path, record: &ServiceRecord) -> Result<(), RegistryError> {
    let tmp_path = path.with_extension(paths::TEMP_EXT);
    let json = serde_json::to_vec(record)?;
    std::fs::write(&tmp_path, json)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn create_private_dir(dir: &Path) -> Result<(), RegistryError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        set_dir_permissions(dir)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
