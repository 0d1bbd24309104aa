//! Dispatch server: endpoint table plus the loop that answers request files.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::json;
use signal_hook::consts::signal::{SIGINT, SIGTERM};

use fastpipe_core::paths::fastpipe_root;
use fastpipe_core::types::{NOT_FOUND, PANIC, PROTOCOL_ERROR};
use fastpipe_core::{registry, RequestKind, RequestMessage, ResponseMessage, ServiceRecord};

use crate::endpoint::Factory;
use crate::error::{io_err, FastpipeError};
use crate::mailbox::{check_message_id, new_message_id, Mailbox};
use crate::watch::RequestWatcher;

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Tuning for the dispatch loop.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Sleep between scans when nothing is pending and no watcher is active.
    pub idle_interval: Duration,
    /// Use file events to wake the loop early.
    pub watch: bool,
    /// Upper bound on the idle wait while a watcher is active.
    pub rescan_interval: Duration,
    /// How often orphaned mailbox files are swept.
    pub cleanup_interval: Duration,
    /// Age after which a mailbox file counts as orphaned.
    pub max_file_age: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_millis(2),
            watch: true,
            rescan_interval: Duration::from_millis(20),
            cleanup_interval: Duration::from_secs(300),
            max_file_age: Duration::from_secs(3600),
        }
    }
}

#[derive(Default)]
struct EndpointTable {
    entries: BTreeMap<String, Factory>,
    frozen: bool,
}

/// State shared with the dispatch thread.
struct Shared {
    name: String,
    mailbox: Mailbox,
    table: Mutex<EndpointTable>,
    running: AtomicBool,
    options: ServerOptions,
}

/// Owns an endpoint table and serves it over a service mailbox.
pub struct ServiceServer {
    root: PathBuf,
    service_root: PathBuf,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    record: Mutex<Option<ServiceRecord>>,
}

impl ServiceServer {
    /// Allocate the workspace for `name` under `root` and create its mailbox.
    pub fn new_at(root: &Path, name: &str, options: ServerOptions) -> Result<Self, FastpipeError> {
        let service_root = registry::service_root_at(root, name)?;
        let mailbox = Mailbox::create(&service_root)?;
        Ok(Self {
            root: root.to_path_buf(),
            service_root,
            shared: Arc::new(Shared {
                name: name.to_string(),
                mailbox,
                table: Mutex::new(EndpointTable::default()),
                running: AtomicBool::new(false),
                options,
            }),
            worker: Mutex::new(None),
            record: Mutex::new(None),
        })
    }

    /// `new_at` convenience wrapper resolving the root from `FASTPIPE_HOME`.
    pub fn new(name: &str, options: ServerOptions) -> Result<Self, FastpipeError> {
        Self::new_at(&fastpipe_root()?, name, options)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The fastpipe root this server publishes into.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn service_root(&self) -> &Path {
        &self.service_root
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.shared.mailbox
    }

    pub fn options(&self) -> &ServerOptions {
        &self.shared.options
    }

    // -----------------------------------------------------------------------
    // Endpoint table
    // -----------------------------------------------------------------------

    /// Add an endpoint. Fails when frozen or when `name` is taken.
    pub fn register(&self, name: impl Into<String>, factory: Factory) -> Result<(), FastpipeError> {
        let name = name.into();
        let mut table = lock(&self.shared.table);
        if table.frozen {
            return Err(FastpipeError::Frozen(self.shared.name.clone()));
        }
        if table.entries.contains_key(&name) {
            return Err(FastpipeError::DuplicateEndpoint(name));
        }
        tracing::debug!(service = %self.shared.name, endpoint = %name, kind = %factory.kind(), "endpoint registered");
        table.entries.insert(name, factory);
        Ok(())
    }

    /// Sorted endpoint names.
    pub fn endpoints(&self) -> Vec<String> {
        self.shared.endpoint_names()
    }

    /// Copy of the endpoint table, in name order.
    pub fn snapshot(&self) -> Vec<(String, Factory)> {
        lock(&self.shared.table)
            .entries
            .iter()
            .map(|(name, factory)| (name.clone(), factory.clone()))
            .collect()
    }

    pub fn set_frozen(&self, frozen: bool) {
        lock(&self.shared.table).frozen = frozen;
    }

    pub fn is_frozen(&self) -> bool {
        lock(&self.shared.table).frozen
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Start the dispatch thread. No-op if it is already running.
    pub fn start(&self) -> Result<(), FastpipeError> {
        let mut worker = lock(&self.worker);
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("fastpipe[{}]", self.shared.name))
            .spawn(move || serve(shared))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                io_err(&self.service_root, e)
            })?;
        *worker = Some(handle);
        tracing::debug!(service = %self.shared.name, "dispatch loop started");
        Ok(())
    }

    /// Stop the dispatch thread and withdraw the published record.
    ///
    /// Waits up to `timeout` for an in-flight request to finish; a thread that
    /// is still busy after that is detached.
    pub fn stop(&self, timeout: Duration) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = lock(&self.worker).take() {
            let deadline = deadline_after(timeout);
            while !handle.is_finished() && !expired(deadline) {
                thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::warn!(service = %self.shared.name, "dispatch loop still busy after stop timeout; detaching");
            }
        }
        if let Some(record) = lock(&self.record).take() {
            if let Err(err) = registry::unregister_at(&self.root, &record.name, Some(record.pid)) {
                tracing::warn!(service = %record.name, error = %err, "failed to unregister service");
            }
        }
    }

    /// Publish this process as the owner of the service name. Idempotent.
    pub fn publish(&self) -> Result<ServiceRecord, FastpipeError> {
        let mut slot = lock(&self.record);
        if let Some(record) = slot.as_ref() {
            return Ok(record.clone());
        }
        let record = ServiceRecord::for_current_process(self.shared.name.clone(), &self.service_root);
        registry::register_at(&self.root, &record)?;
        tracing::info!(service = %record.name, pid = record.pid, "service published");
        *slot = Some(record.clone());
        Ok(record)
    }

    /// Serve in the foreground until SIGINT/SIGTERM or [`ServiceServer::stop`].
    pub fn run_forever(&self, poll_interval: Duration) -> Result<(), FastpipeError> {
        let interrupted = Arc::new(AtomicBool::new(false));
        let mut signal_ids = Vec::new();
        for signal in [SIGINT, SIGTERM] {
            let id = signal_hook::flag::register(signal, Arc::clone(&interrupted))
                .map_err(FastpipeError::SignalHandler)?;
            signal_ids.push(id);
        }

        let outcome = self.start().and_then(|()| self.publish().map(|_| ()));
        if outcome.is_ok() {
            while self.is_running() && !interrupted.load(Ordering::SeqCst) {
                thread::sleep(poll_interval);
            }
            if interrupted.load(Ordering::SeqCst) {
                tracing::info!(service = %self.shared.name, "received shutdown signal");
            }
        }
        self.stop(DEFAULT_STOP_TIMEOUT);

        for id in signal_ids {
            signal_hook::low_level::unregister(id);
        }
        outcome
    }

    /// Answer one request without touching the mailbox.
    pub fn handle_request(&self, request: &RequestMessage) -> ResponseMessage {
        self.shared.handle_request(request)
    }

    /// Scan the mailbox once and answer everything pending. Returns the count.
    pub fn dispatch_pending(&self) -> Result<usize, FastpipeError> {
        self.shared.dispatch_pending()
    }
}

impl Drop for ServiceServer {
    fn drop(&mut self) {
        self.stop(Duration::from_secs(1));
    }
}

impl Shared {
    fn endpoint_names(&self) -> Vec<String> {
        lock(&self.table).entries.keys().cloned().collect()
    }

    fn dispatch_pending(&self) -> Result<usize, FastpipeError> {
        let mut handled = 0;
        for path in self.mailbox.pending_requests()? {
            if self.process_file(&path)? {
                handled += 1;
            }
        }
        Ok(handled)
    }

    /// Claim one request file and answer it. `false` if someone else took it.
    fn process_file(&self, path: &Path) -> Result<bool, FastpipeError> {
        let Some(bytes) = self.mailbox.take(path)? else {
            return Ok(false);
        };
        let request: RequestMessage = match serde_json::from_slice(&bytes) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(
                    service = %self.name,
                    path = %path.display(),
                    error = %err,
                    "dropping malformed request",
                );
                return Ok(true);
            }
        };
        if let Some(id) = request.id.as_deref() {
            if check_message_id(id).is_err() {
                tracing::warn!(
                    service = %self.name,
                    path = %path.display(),
                    request_id = %id,
                    "dropping request whose id is not a plain file name",
                );
                return Ok(true);
            }
        }
        let response = self.handle_request(&request);
        self.mailbox.write_response(&response)?;
        Ok(true)
    }

    fn handle_request(&self, request: &RequestMessage) -> ResponseMessage {
        let id = request.id.clone().unwrap_or_else(new_message_id);
        tracing::debug!(service = %self.name, request_id = %id, kind = ?request.kind, "handling request");
        match request.kind {
            RequestKind::ListEndpoints => ResponseMessage::ok(id, json!(self.endpoint_names())),
            RequestKind::Unknown => ResponseMessage::error(id, PROTOCOL_ERROR, "Unknown command"),
            RequestKind::Call => self.call(id, request),
        }
    }

    fn call(&self, id: String, request: &RequestMessage) -> ResponseMessage {
        let Some(endpoint) = request.endpoint.as_deref() else {
            return ResponseMessage::error(id, PROTOCOL_ERROR, "call request without endpoint");
        };
        let factory = lock(&self.table).entries.get(endpoint).cloned();
        let Some(factory) = factory else {
            return ResponseMessage::error(id, NOT_FOUND, format!("Endpoint '{endpoint}' not found"));
        };

        let ctor = request.ctor_arguments();
        let call = request.call_arguments();
        match catch_unwind(AssertUnwindSafe(|| factory.invoke(&ctor, &call))) {
            Ok(Ok(value)) => ResponseMessage::ok(id, value),
            Ok(Err(err)) => {
                tracing::debug!(service = %self.name, endpoint, error = %err, "endpoint failed");
                ResponseMessage::error(id, err.kind, err.message)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(service = %self.name, endpoint, panic = %message, "endpoint panicked");
                ResponseMessage::error(id, PANIC, message)
            }
        }
    }
}

/// How the loop waits when a scan found nothing.
enum Idle {
    Watch(RequestWatcher, Duration),
    Sleep(Duration),
}

impl Idle {
    fn new(shared: &Shared) -> Self {
        let options = &shared.options;
        if !options.watch {
            return Idle::Sleep(options.idle_interval);
        }
        match RequestWatcher::new(shared.mailbox.requests_dir()) {
            Ok(watcher) => Idle::Watch(watcher, options.rescan_interval),
            Err(err) => {
                tracing::warn!(service = %shared.name, error = %err, "file watching unavailable; polling");
                Idle::Sleep(options.idle_interval)
            }
        }
    }

    fn wait(&self) {
        match self {
            Idle::Watch(watcher, timeout) => {
                watcher.wait(*timeout);
            }
            Idle::Sleep(interval) => thread::sleep(*interval),
        }
    }
}

fn serve(shared: Arc<Shared>) {
    let idle = Idle::new(&shared);
    let mut last_sweep = Instant::now();
    while shared.running.load(Ordering::SeqCst) {
        if last_sweep.elapsed() >= shared.options.cleanup_interval {
            match shared.mailbox.sweep(shared.options.max_file_age) {
                Ok(0) => {}
                Ok(removed) => tracing::info!(service = %shared.name, removed, "swept orphaned mailbox files"),
                Err(err) => tracing::warn!(service = %shared.name, error = %err, "mailbox sweep failed"),
            }
            last_sweep = Instant::now();
        }
        let handled = match shared.dispatch_pending() {
            Ok(handled) => handled,
            Err(err) => {
                tracing::warn!(service = %shared.name, error = %err, "dispatch pass failed");
                0
            }
        };
        if handled == 0 {
            idle.wait();
        }
    }
    tracing::debug!(service = %shared.name, "dispatch loop exited");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "endpoint panicked".to_string()
    }
}

/// `None` when `timeout` does not fit in an `Instant`; such a wait never expires.
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

pub(crate) fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
