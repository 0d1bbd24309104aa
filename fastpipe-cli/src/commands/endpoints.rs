//! `fastpipe endpoints` — ask a running service for its endpoint names.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use fastpipe_daemon::{ClientOptions, ServiceClient};

/// Arguments for `fastpipe endpoints`.
#[derive(Args, Debug)]
pub struct EndpointsArgs {
    /// Registered service name.
    pub service: String,

    /// Seconds to wait for the service to answer.
    #[arg(long, default_value = "5", value_parser = super::parse_seconds)]
    pub timeout: Duration,
}

impl EndpointsArgs {
    pub fn run(self) -> Result<()> {
        let options = ClientOptions::default().with_timeout(self.timeout);
        let client = ServiceClient::connect(&self.service, options)
            .with_context(|| format!("failed to connect to service '{}'", self.service))?;
        if client.endpoints().is_empty() {
            println!("Service '{}' exposes no endpoints.", self.service);
            return Ok(());
        }
        for endpoint in client.endpoints() {
            println!("{endpoint}");
        }
        Ok(())
    }
}
