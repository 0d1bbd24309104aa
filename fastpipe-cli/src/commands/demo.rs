//! `fastpipe demo` — a small service for trying the CLI end to end.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use serde_json::{json, Value};

use fastpipe_core::Arguments;
use fastpipe_daemon::{
    DaemonManager, DaemonOptions, EndpointError, Factory, ServerOptions, ServiceServer,
};

const SIGNAL_POLL: Duration = Duration::from_millis(200);

/// Arguments for `fastpipe demo`.
#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Service name to publish.
    #[arg(long, default_value = "demo")]
    pub name: String,

    /// Greeting used by `greet` when the caller passes no constructor argument.
    #[arg(long, default_value = "Hello")]
    pub greeting: String,

    /// Serve from a forked background process and wait for it.
    #[arg(long)]
    pub daemon: bool,
}

impl DemoArgs {
    pub fn run(self) -> Result<()> {
        let server = ServiceServer::new(&self.name, ServerOptions::default())
            .with_context(|| format!("failed to prepare service '{}'", self.name))?;
        register_demo_endpoints(&server, &self.name, &self.greeting)?;

        if !self.daemon {
            println!(
                "Serving '{}' with endpoints: {} (Ctrl-C to stop)",
                self.name,
                server.endpoints().join(", ")
            );
            return server
                .run_forever(SIGNAL_POLL)
                .with_context(|| format!("service '{}' failed", self.name));
        }

        let server = Arc::new(server);
        let manager = DaemonManager::new();
        let handle = manager
            .run(&server, DaemonOptions::default())
            .with_context(|| format!("failed to start daemon for '{}'", self.name))?;
        println!("Daemon for '{}' running as pid {}", handle.service(), handle.pid());
        handle.wait().context("failed waiting for daemon")?;
        Ok(())
    }
}

struct Greeter {
    greeting: String,
}

#[derive(Serialize)]
struct VersionInfo {
    service: String,
    version: &'static str,
}

fn register_demo_endpoints(server: &ServiceServer, name: &str, greeting: &str) -> Result<()> {
    server.register(
        "ping",
        Factory::function(|_call: &Arguments| Ok("pong")),
    )?;
    server.register(
        "double",
        Factory::function(|call: &Arguments| {
            let exact = call.param::<i64>(0, "x").ok().and_then(|x| x.checked_mul(2));
            if let Some(doubled) = exact {
                return Ok(json!(doubled));
            }
            let x: f64 = call.param(0, "x")?;
            Ok(number(2.0 * x))
        }),
    )?;
    server.register(
        "add",
        Factory::function(|call: &Arguments| {
            let exact = match (call.param::<i64>(0, "a"), call.param::<i64>(1, "b")) {
                (Ok(a), Ok(b)) => a.checked_add(b),
                _ => None,
            };
            if let Some(sum) = exact {
                return Ok(json!(sum));
            }
            let a: f64 = call.param(0, "a")?;
            let b: f64 = call.param(1, "b")?;
            Ok(number(a + b))
        }),
    )?;

    let default_greeting = greeting.to_string();
    server.register(
        "greet",
        Factory::instance_method(
            move |ctor: &Arguments| {
                Ok(Greeter {
                    greeting: ctor.param_or(0, "greeting", default_greeting.clone())?,
                })
            },
            |greeter: &Greeter, call: &Arguments| {
                let who: String = call.param(0, "name")?;
                Ok(format!("{}, {who}!", greeter.greeting))
            },
        ),
    )?;

    let info = Arc::new(VersionInfo {
        service: name.to_string(),
        version: env!("CARGO_PKG_VERSION"),
    });
    server.register(
        "version",
        Factory::static_like(info, |info: &VersionInfo, _call: &Arguments| {
            serde_json::to_value(info).map_err(EndpointError::serialization)
        }),
    )?;
    Ok(())
}

/// Integral float results stay integers on the wire (`42`, not `42.0`).
/// Integer inputs never reach this; they are computed exactly as `i64`.
fn number(x: f64) -> Value {
    if x.fract() == 0.0 && x.abs() < i64::MAX as f64 {
        json!(x as i64)
    } else {
        json!(x)
    }
}
