//! On-disk layout.
//!
//! ```text
//! <root>/                         $FASTPIPE_HOME, default ./.fastpipe
//!   registry/<name>.json          ServiceRecord (mode 0600)
//!   services/<name>/
//!     requests/{id}.json          written by clients
//!     responses/{id}.json         written by the server
//! ```

use std::path::{Path, PathBuf};

use crate::error::RegistryError;

/// Environment variable selecting the root directory.
pub const HOME_ENV: &str = "FASTPIPE_HOME";
/// Root directory name used under the working directory when `FASTPIPE_HOME` is unset.
pub const DEFAULT_DIR_NAME: &str = ".fastpipe";

pub const REQUESTS_DIR: &str = "requests";
pub const RESPONSES_DIR: &str = "responses";

/// Extension of committed message and record files.
pub const MESSAGE_EXT: &str = "json";
/// Extension of in-flight writes; never matched by `*.json` scans.
pub const TEMP_EXT: &str = "tmp";

/// Resolve the root from `FASTPIPE_HOME`, falling back to `<cwd>/.fastpipe`.
pub fn fastpipe_root() -> Result<PathBuf, RegistryError> {
    match std::env::var_os(HOME_ENV) {
        Some(value) if !value.is_empty() => Ok(PathBuf::from(value)),
        _ => {
            let cwd = std::env::current_dir().map_err(RegistryError::CurrentDir)?;
            Ok(cwd.join(DEFAULT_DIR_NAME))
        }
    }
}

pub fn services_root(root: &Path) -> PathBuf {
    root.join("services")
}

pub fn registry_dir(root: &Path) -> PathBuf {
    root.join("registry")
}

/// `true` when `name` stays inside the directory it is joined onto:
/// non-empty, not `.` or `..`, no `/`, `\` or NUL.
pub fn is_plain_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

/// `Err(RegistryError::InvalidName)` unless `name` is a plain component.
pub fn check_component(name: &str) -> Result<(), RegistryError> {
    if is_plain_component(name) {
        Ok(())
    } else {
        Err(RegistryError::InvalidName {
            name: name.to_string(),
        })
    }
}

/// `<root>/services/<name>`. Pure, no I/O; `name` must pass [`check_component`].
pub fn service_dir(root: &Path, name: &str) -> PathBuf {
    services_root(root).join(name)
}

/// `<root>/registry/<name>.json`. Pure, no I/O; `name` must pass [`check_component`].
pub fn record_path(root: &Path, name: &str) -> PathBuf {
    registry_dir(root).join(format!("{name}.{MESSAGE_EXT}"))
}

pub fn requests_dir(service_root: &Path) -> PathBuf {
    service_root.join(REQUESTS_DIR)
}

pub fn responses_dir(service_root: &Path) -> PathBuf {
    service_root.join(RESPONSES_DIR)
}

/// `{id}.json` inside `dir`.
pub fn message_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.{MESSAGE_EXT}"))
}

/// `{id}.tmp` inside `dir`.
pub fn temp_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.{TEMP_EXT}"))
}
