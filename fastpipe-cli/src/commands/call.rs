//! `fastpipe call` — invoke one endpoint and print the result as JSON.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::{Map, Value};

use fastpipe_core::Arguments;
use fastpipe_daemon::{ClientOptions, ServiceClient};

/// Alias so clap parses the whole array from one flag instead of repeating it.
type JsonArray = Vec<Value>;

/// Arguments for `fastpipe call`.
#[derive(Args, Debug)]
pub struct CallArgs {
    /// Registered service name.
    pub service: String,

    /// Endpoint to invoke.
    pub endpoint: String,

    /// Positional arguments as a JSON array.
    #[arg(long, value_name = "JSON", default_value = "[]", value_parser = parse_array)]
    pub args: JsonArray,

    /// Keyword arguments as a JSON object.
    #[arg(long, value_name = "JSON", default_value = "{}", value_parser = parse_object)]
    pub kwargs: Map<String, Value>,

    /// Constructor positional arguments (instance-method endpoints).
    #[arg(long, value_name = "JSON", default_value = "[]", value_parser = parse_array)]
    pub ctor_args: JsonArray,

    /// Constructor keyword arguments (instance-method endpoints).
    #[arg(long, value_name = "JSON", default_value = "{}", value_parser = parse_object)]
    pub ctor_kwargs: Map<String, Value>,

    /// Seconds to wait for the response.
    #[arg(long, default_value = "5", value_parser = super::parse_seconds)]
    pub timeout: Duration,

    /// Pretty-print the result.
    #[arg(long)]
    pub pretty: bool,
}

impl CallArgs {
    pub fn run(self) -> Result<()> {
        let ctor = Arguments {
            args: self.ctor_args,
            kwargs: self.ctor_kwargs,
        };
        let call = Arguments {
            args: self.args,
            kwargs: self.kwargs,
        };
        let options = ClientOptions::default()
            .with_timeout(self.timeout)
            .with_ctor(ctor);
        let client = ServiceClient::connect(&self.service, options)
            .with_context(|| format!("failed to connect to service '{}'", self.service))?;
        let value = client.invoke(&self.endpoint, call)?;

        let rendered = if self.pretty {
            serde_json::to_string_pretty(&value)
        } else {
            serde_json::to_string(&value)
        }
        .context("failed to render result JSON")?;
        println!("{rendered}");
        Ok(())
    }
}

fn parse_array(raw: &str) -> Result<JsonArray, String> {
    match serde_json::from_str(raw) {
        Ok(Value::Array(values)) => Ok(values),
        Ok(other) => Err(format!("expected a JSON array, got {other}")),
        Err(err) => Err(format!("invalid JSON: {err}")),
    }
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, got {other}")),
        Err(err) => Err(format!("invalid JSON: {err}")),
    }
}
