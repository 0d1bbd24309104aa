use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;

use fastpipe_core::{registry, Arguments, ServiceRecord};
use fastpipe_daemon::{Factory, ServerOptions, ServiceServer};
use tempfile::TempDir;

fn fastpipe_cmd(root: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("fastpipe"));
    cmd.env("FASTPIPE_HOME", root).env_remove("FASTPIPE_LOG");
    cmd
}

fn dead_pid() -> i32 {
    let mut child = Command::new("true").spawn().expect("spawn true");
    let pid = child.id() as i32;
    child.wait().expect("wait");
    pid
}

fn calc_service(root: &TempDir) -> ServiceServer {
    let server = ServiceServer::new_at(root.path(), "calc", ServerOptions::default()).expect("server");
    server
        .register(
            "double",
            Factory::function(|call: &Arguments| {
                let x: i64 = call.param(0, "x")?;
                Ok(2 * x)
            }),
        )
        .expect("register");
    server.start().expect("start");
    server.publish().expect("publish");
    server
}

// ---------------------------------------------------------------------------
// 1. Registry inspection
// ---------------------------------------------------------------------------

#[test]
fn services_on_empty_root() {
    let root = TempDir::new().expect("root");
    fastpipe_cmd(root.path())
        .arg("services")
        .assert()
        .success()
        .stdout(contains("No services registered."));
}

#[test]
fn services_json_reports_liveness() {
    let root = TempDir::new().expect("root");
    let alive = ServiceRecord::for_current_process("alive", root.path().join("services/alive"));
    registry::register_at(root.path(), &alive).expect("register alive");
    let ghost = ServiceRecord::new("ghost", root.path().join("services/ghost"), dead_pid());
    registry::register_at(root.path(), &ghost).expect("register ghost");

    let output = fastpipe_cmd(root.path())
        .args(["services", "--json"])
        .output()
        .expect("run");
    assert!(output.status.success());
    let listed: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json stdout");
    let statuses: Vec<(String, String)> = listed
        .as_array()
        .expect("array")
        .iter()
        .map(|s| {
            (
                s["name"].as_str().unwrap_or_default().to_string(),
                s["status"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("alive".to_string(), "alive".to_string()),
            ("ghost".to_string(), "stale".to_string()),
        ]
    );
}

#[test]
fn prune_removes_dead_records_only() {
    let root = TempDir::new().expect("root");
    let alive = ServiceRecord::for_current_process("alive", root.path().join("services/alive"));
    registry::register_at(root.path(), &alive).expect("register alive");
    let ghost = ServiceRecord::new("ghost", root.path().join("services/ghost"), dead_pid());
    registry::register_at(root.path(), &ghost).expect("register ghost");

    fastpipe_cmd(root.path())
        .arg("prune")
        .assert()
        .success()
        .stdout(contains("pruned ghost").and(contains("alive").not()));
    assert!(registry::resolve_at(root.path(), "alive").is_ok());

    fastpipe_cmd(root.path())
        .arg("prune")
        .assert()
        .success()
        .stdout(contains("Nothing to prune."));
}

// ---------------------------------------------------------------------------
// 2. Calling a live service
// ---------------------------------------------------------------------------

#[test]
fn call_prints_result_json() {
    let root = TempDir::new().expect("root");
    let _server = calc_service(&root);

    fastpipe_cmd(root.path())
        .args(["call", "calc", "double", "--args", "[21]"])
        .assert()
        .success()
        .stdout("42\n");
}

#[test]
fn endpoints_lists_remote_names() {
    let root = TempDir::new().expect("root");
    let _server = calc_service(&root);

    fastpipe_cmd(root.path())
        .args(["endpoints", "calc"])
        .assert()
        .success()
        .stdout("double\n");
}

#[test]
fn call_unknown_endpoint_reports_remote_type() {
    let root = TempDir::new().expect("root");
    let _server = calc_service(&root);

    fastpipe_cmd(root.path())
        .args(["call", "calc", "triple"])
        .assert()
        .failure()
        .stderr(contains("NotFound").and(contains("calc.triple")));
}

#[test]
fn call_unregistered_service_fails() {
    let root = TempDir::new().expect("root");
    fastpipe_cmd(root.path())
        .args(["call", "nobody", "ping"])
        .assert()
        .failure()
        .stderr(contains("nobody").and(contains("not registered")));
}

#[test]
fn call_rejects_non_array_args() {
    let root = TempDir::new().expect("root");
    fastpipe_cmd(root.path())
        .args(["call", "calc", "double", "--args", "{\"x\": 1}"])
        .assert()
        .failure()
        .stderr(contains("expected a JSON array"));
}
