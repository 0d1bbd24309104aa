//! Background daemons: fork a child that serves a server's endpoints.
//!
//! Flow of [`DaemonManager::run`]:
//! 1. refuse if the service already has a running daemon or has no endpoints
//! 2. freeze the server, stop its in-process loop, snapshot the endpoint table
//! 3. fork; the child rebuilds a server from the snapshot and calls
//!    [`ServiceServer::run_forever`]
//! 4. the parent waits until the registry names the child's pid

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use fastpipe_core::registry;

use crate::endpoint::Factory;
use crate::error::FastpipeError;
use crate::server::{deadline_after, expired, lock, ServerOptions, ServiceServer};

const STARTUP_POLL: Duration = Duration::from_millis(10);
const EXIT_POLL: Duration = Duration::from_millis(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Signal check interval inside the child's `run_forever`.
    pub poll_interval: Duration,
    pub startup_timeout: Duration,
    /// Grace period used when a failed startup has to tear the child down.
    pub stop_timeout: Duration,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            startup_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Created,
    Starting,
    Running,
    Stopped,
}

type Cleanup = Box<dyn FnOnce() + Send>;

struct HandleInner {
    service: String,
    root: PathBuf,
    pid: Pid,
    state: Mutex<DaemonState>,
    reaped: AtomicBool,
    cleanup: Mutex<Option<Cleanup>>,
}

/// Parent-side view of one forked daemon. Clones share state.
#[derive(Clone)]
pub struct DaemonHandle {
    inner: Arc<HandleInner>,
}

impl DaemonHandle {
    fn new(service: &str, root: PathBuf, pid: Pid) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                service: service.to_string(),
                root,
                pid,
                state: Mutex::new(DaemonState::Created),
                reaped: AtomicBool::new(false),
                cleanup: Mutex::new(None),
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn pid(&self) -> i32 {
        self.inner.pid.as_raw()
    }

    pub fn state(&self) -> DaemonState {
        *lock(&self.inner.state)
    }

    /// `true` while the child is up and was seen in the registry.
    ///
    /// A child that died on its own is finalized here.
    pub fn is_running(&self) -> bool {
        if self.state() != DaemonState::Running {
            return false;
        }
        if self.try_reap() {
            tracing::warn!(service = %self.inner.service, pid = self.pid(), "daemon exited unexpectedly");
            let _ = self.stop(Duration::ZERO);
            return false;
        }
        true
    }

    /// Terminate the child and withdraw its record. Repeated calls are no-ops.
    ///
    /// Sends SIGTERM, waits up to `timeout`, then SIGKILLs and reaps.
    pub fn stop(&self, timeout: Duration) -> Result<(), FastpipeError> {
        let mut state = lock(&self.inner.state);
        if *state == DaemonState::Stopped {
            return Ok(());
        }
        let pid = self.inner.pid;
        if !self.try_reap() {
            self.signal(Signal::SIGTERM)?;
            if !self.wait_exit(timeout) {
                tracing::warn!(service = %self.inner.service, pid = pid.as_raw(), "daemon ignored SIGTERM; killing");
                self.signal(Signal::SIGKILL)?;
                self.reap_blocking();
            }
        }
        if let Err(err) = registry::unregister_at(&self.inner.root, &self.inner.service, Some(pid.as_raw())) {
            tracing::warn!(service = %self.inner.service, error = %err, "failed to unregister daemon");
        }
        *state = DaemonState::Stopped;
        drop(state);

        tracing::info!(service = %self.inner.service, pid = pid.as_raw(), "daemon stopped");
        if let Some(cleanup) = lock(&self.inner.cleanup).take() {
            cleanup();
        }
        Ok(())
    }

    /// Block until the child exits, then finalize as [`DaemonHandle::stop`] would.
    pub fn wait(&self) -> Result<(), FastpipeError> {
        self.reap_blocking();
        self.stop(Duration::ZERO)
    }

    fn set_state(&self, state: DaemonState) {
        *lock(&self.inner.state) = state;
    }

    fn set_cleanup(&self, cleanup: Cleanup) {
        *lock(&self.inner.cleanup) = Some(cleanup);
    }

    fn signal(&self, signal: Signal) -> Result<(), FastpipeError> {
        match kill(self.inner.pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(FastpipeError::Signal {
                pid: self.pid(),
                source,
            }),
        }
    }

    /// Non-blocking reap. `true` once the child is gone.
    fn try_reap(&self) -> bool {
        if self.inner.reaped.load(Ordering::SeqCst) {
            return true;
        }
        match waitpid(self.inner.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => false,
            Ok(_) | Err(Errno::ECHILD) => {
                self.inner.reaped.store(true, Ordering::SeqCst);
                true
            }
            Err(_) => false,
        }
    }

    fn reap_blocking(&self) {
        loop {
            if self.inner.reaped.load(Ordering::SeqCst) {
                return;
            }
            match waitpid(self.inner.pid, None) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => {
                    self.inner.reaped.store(true, Ordering::SeqCst);
                    return;
                }
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(err) => {
                    tracing::warn!(service = %self.inner.service, error = %err, "waitpid failed");
                    return;
                }
            }
        }
    }

    fn wait_exit(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        loop {
            if self.try_reap() {
                return true;
            }
            if expired(deadline) {
                return false;
            }
            thread::sleep(EXIT_POLL);
        }
    }
}

impl std::fmt::Debug for DaemonHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonHandle")
            .field("service", &self.inner.service)
            .field("pid", &self.pid())
            .field("state", &self.state())
            .finish()
    }
}

type ActiveSet = Mutex<HashMap<String, DaemonHandle>>;

/// Starts daemons and stops whatever is still active when dropped.
#[derive(Default)]
pub struct DaemonManager {
    active: Arc<ActiveSet>,
}

impl DaemonManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `server` into a forked background process.
    ///
    /// The child is a plain `fork` of the caller with no `exec`, so only the
    /// calling thread exists in it. A lock held by any other thread at that
    /// moment (an allocator arena, a logging sink, another server's table)
    /// stays locked in the child forever. Call this before the process starts
    /// other threads, or make sure they hold no locks the endpoints need.
    pub fn run(&self, server: &Arc<ServiceServer>, options: DaemonOptions) -> Result<DaemonHandle, FastpipeError> {
        let name = server.name().to_string();
        let existing = lock(&self.active).get(&name).cloned();
        if existing.is_some_and(|handle| handle.is_running()) {
            return Err(FastpipeError::AlreadyRunning(name));
        }

        let snapshot = server.snapshot();
        if snapshot.is_empty() {
            return Err(FastpipeError::NoEndpoints(name));
        }
        server.set_frozen(true);
        server.stop(options.stop_timeout);

        let root = server.root().to_path_buf();
        // SAFETY: the child only builds a fresh server from owned data and
        // leaves through `process::exit`, never returning into caller frames.
        let child = match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let code = run_child(&root, &name, snapshot, server.options().clone(), &options);
                std::process::exit(code)
            }
            Ok(ForkResult::Parent { child }) => child,
            Err(source) => {
                server.set_frozen(false);
                return Err(FastpipeError::Spawn {
                    service: name,
                    source,
                });
            }
        };

        let handle = DaemonHandle::new(&name, root.clone(), child);
        handle.set_cleanup(cleanup_for(&name, child, Arc::downgrade(server), Arc::downgrade(&self.active)));
        lock(&self.active).insert(name.clone(), handle.clone());
        handle.set_state(DaemonState::Starting);
        tracing::info!(service = %name, pid = child.as_raw(), "daemon spawned");

        let deadline = deadline_after(options.startup_timeout);
        loop {
            if let Ok(record) = registry::resolve_at(&root, &name) {
                if record.pid == child.as_raw() {
                    handle.set_state(DaemonState::Running);
                    tracing::info!(service = %name, pid = record.pid, "daemon running");
                    return Ok(handle);
                }
            }
            if handle.try_reap() {
                handle.stop(Duration::ZERO)?;
                return Err(FastpipeError::DaemonExited {
                    service: name,
                    pid: child.as_raw(),
                });
            }
            if expired(deadline) {
                handle.stop(options.stop_timeout)?;
                return Err(FastpipeError::StartupTimeout {
                    service: name,
                    timeout: options.startup_timeout,
                });
            }
            thread::sleep(STARTUP_POLL);
        }
    }

    /// Handles that have not been stopped yet.
    pub fn active(&self) -> Vec<DaemonHandle> {
        lock(&self.active).values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    /// Stop every active daemon, logging failures.
    pub fn shutdown_all(&self, timeout: Duration) {
        for handle in self.active() {
            if let Err(err) = handle.stop(timeout) {
                tracing::warn!(service = %handle.service(), error = %err, "daemon shutdown failed");
            }
        }
    }
}

impl Drop for DaemonManager {
    fn drop(&mut self) {
        self.shutdown_all(SHUTDOWN_TIMEOUT);
    }
}

fn cleanup_for(name: &str, pid: Pid, server: Weak<ServiceServer>, active: Weak<ActiveSet>) -> Cleanup {
    let name = name.to_string();
    Box::new(move || {
        if let Some(server) = server.upgrade() {
            server.set_frozen(false);
        }
        if let Some(active) = active.upgrade() {
            let mut active = lock(&active);
            if active.get(&name).is_some_and(|h| h.inner.pid == pid) {
                active.remove(&name);
            }
        }
    })
}

/// Body of the forked child. Returns the process exit code.
fn run_child(
    root: &std::path::Path,
    name: &str,
    snapshot: Vec<(String, Factory)>,
    server_options: ServerOptions,
    options: &DaemonOptions,
) -> i32 {
    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<(), FastpipeError> {
        let server = ServiceServer::new_at(root, name, server_options)?;
        for (endpoint, factory) in snapshot {
            server.register(endpoint, factory)?;
        }
        server.set_frozen(true);
        server.run_forever(options.poll_interval)
    }));
    match outcome {
        Ok(Ok(())) => 0,
        Ok(Err(err)) => {
            tracing::error!(service = %name, error = %err, "daemon failed");
            1
        }
        Err(_) => {
            tracing::error!(service = %name, "daemon panicked");
            101
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let options = DaemonOptions::default();
        assert_eq!(options.poll_interval, Duration::from_millis(500));
        assert_eq!(options.startup_timeout, Duration::from_secs(5));
        assert_eq!(options.stop_timeout, Duration::from_secs(1));
    }

    #[test]
    fn empty_manager_shuts_down_cleanly() {
        let manager = DaemonManager::new();
        assert_eq!(manager.active_count(), 0);
        manager.shutdown_all(Duration::from_millis(10));
    }
}
