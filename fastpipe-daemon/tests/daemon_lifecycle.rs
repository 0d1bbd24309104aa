//! Forked daemons: start, call, stop, and the guards around them.

use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;

use fastpipe_core::{registry, Arguments, ServiceRecord};
use fastpipe_daemon::{
    ClientOptions, DaemonManager, DaemonOptions, DaemonState, FastpipeError, Factory,
    ServerOptions, ServiceClient, ServiceServer,
};
use tempfile::TempDir;

fn options() -> DaemonOptions {
    DaemonOptions {
        poll_interval: Duration::from_millis(20),
        ..DaemonOptions::default()
    }
}

fn double_server(root: &TempDir, name: &str) -> Arc<ServiceServer> {
    let server = ServiceServer::new_at(root.path(), name, ServerOptions::default()).expect("server");
    server
        .register(
            "double",
            Factory::function(|call: &Arguments| {
                let x: i64 = call.param(0, "x")?;
                Ok(2 * x)
            }),
        )
        .expect("register");
    Arc::new(server)
}

/// Long-lived process that can own a registry record; killed on drop.
struct Sleeper(Child);

impl Sleeper {
    fn start() -> Self {
        Sleeper(Command::new("sleep").arg("30").spawn().expect("spawn sleep"))
    }

    fn pid(&self) -> i32 {
        self.0.id() as i32
    }
}

impl Drop for Sleeper {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[test]
fn run_without_endpoints_fails_before_spawning() {
    let root = TempDir::new().expect("root");
    let server = Arc::new(ServiceServer::new_at(root.path(), "empty", ServerOptions::default()).expect("server"));
    let manager = DaemonManager::new();

    let err = manager.run(&server, options()).unwrap_err();
    assert!(matches!(err, FastpipeError::NoEndpoints(ref n) if n == "empty"), "got: {err}");
    assert_eq!(manager.active_count(), 0);
    assert!(!server.is_frozen());
    assert!(registry::resolve_at(root.path(), "empty").is_err());
}

#[test]
fn daemon_serves_calls_and_stops_cleanly() {
    let root = TempDir::new().expect("root");
    let server = double_server(&root, "bg");
    let manager = DaemonManager::new();

    let handle = manager.run(&server, options()).expect("run");
    assert_eq!(handle.state(), DaemonState::Running);
    assert!(handle.is_running());
    assert_ne!(handle.pid(), std::process::id() as i32);
    assert_eq!(registry::resolve_at(root.path(), "bg").expect("record").pid, handle.pid());

    let client = ServiceClient::connect_at(root.path(), "bg", ClientOptions::default()).expect("connect");
    assert_eq!(client.call::<i64>("double", Arguments::positional([21])).expect("call"), 42);

    handle.stop(Duration::from_secs(2)).expect("stop");
    assert_eq!(handle.state(), DaemonState::Stopped);
    assert!(!handle.is_running());
    assert!(!registry::is_process_alive(handle.pid()));
    assert!(registry::resolve_at(root.path(), "bg").is_err());
    assert_eq!(manager.active_count(), 0);
    assert!(!server.is_frozen());
}

#[test]
fn second_stop_is_a_no_op() {
    let root = TempDir::new().expect("root");
    let server = double_server(&root, "twice");
    let manager = DaemonManager::new();

    let handle = manager.run(&server, options()).expect("run");
    handle.stop(Duration::from_secs(2)).expect("first stop");
    handle.stop(Duration::from_secs(2)).expect("second stop");
    assert_eq!(handle.state(), DaemonState::Stopped);
}

#[test]
fn server_is_frozen_while_daemon_runs() {
    let root = TempDir::new().expect("root");
    let server = double_server(&root, "frozen");
    let manager = DaemonManager::new();

    let handle = manager.run(&server, options()).expect("run");
    let err = server
        .register("late", Factory::function(|_call: &Arguments| Ok(0)))
        .unwrap_err();
    assert!(matches!(err, FastpipeError::Frozen(_)), "got: {err}");

    let again = manager.run(&server, options()).unwrap_err();
    assert!(matches!(again, FastpipeError::AlreadyRunning(_)), "got: {again}");

    handle.stop(Duration::from_secs(2)).expect("stop");
    server
        .register("late", Factory::function(|_call: &Arguments| Ok(0)))
        .expect("register after stop");
}

#[test]
fn dropping_the_manager_stops_active_daemons() {
    let root = TempDir::new().expect("root");
    let server = double_server(&root, "dropped");
    let manager = DaemonManager::new();
    let handle = manager.run(&server, options()).expect("run");
    let pid = handle.pid();

    drop(manager);
    assert_eq!(handle.state(), DaemonState::Stopped);
    assert!(!registry::is_process_alive(pid));
    assert!(registry::resolve_at(root.path(), "dropped").is_err());
}

#[test]
fn child_that_cannot_publish_is_reported_and_reaped() {
    let root = TempDir::new().expect("root");
    let server = double_server(&root, "taken");
    let owner = Sleeper::start();
    let record = ServiceRecord::new("taken", root.path().join("services").join("taken"), owner.pid());
    registry::register_at(root.path(), &record).expect("register owner");
    let manager = DaemonManager::new();

    let err = manager.run(&server, options()).unwrap_err();
    let FastpipeError::DaemonExited { service, pid } = err else {
        panic!("expected DaemonExited, got: {err}");
    };
    assert_eq!(service, "taken");
    assert_ne!(pid, owner.pid());
    assert!(!registry::is_process_alive(pid));
    assert!(!server.is_frozen());
    assert_eq!(manager.active_count(), 0);
    assert_eq!(registry::resolve_at(root.path(), "taken").expect("record").pid, owner.pid());
}
