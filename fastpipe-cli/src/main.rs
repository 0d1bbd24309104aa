//! FastPIPE — inspect services and call endpoints over the filesystem mailbox.
//!
//! # Usage
//!
//! ```text
//! fastpipe services [--json]
//! fastpipe endpoints <service>
//! fastpipe call <service> <endpoint> [--args JSON] [--kwargs JSON] [--ctor-args JSON] [--ctor-kwargs JSON] [--timeout SECS]
//! fastpipe prune
//! fastpipe demo [--name NAME] [--greeting TEXT] [--daemon]
//! ```
//!
//! The root directory comes from `FASTPIPE_HOME` (default `./.fastpipe`).

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    call::CallArgs, demo::DemoArgs, endpoints::EndpointsArgs, prune::PruneArgs,
    services::ServicesArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "fastpipe",
    version,
    about = "Filesystem-mediated RPC between local processes",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered services and whether their process is alive.
    Services(ServicesArgs),

    /// List the endpoints a running service exposes.
    Endpoints(EndpointsArgs),

    /// Invoke an endpoint and print its JSON result.
    Call(CallArgs),

    /// Remove registry records of dead processes and unreadable records.
    Prune(PruneArgs),

    /// Serve a small demo service.
    Demo(DemoArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    fastpipe_daemon::init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Services(args) => args.run(),
        Commands::Endpoints(args) => args.run(),
        Commands::Call(args) => args.run(),
        Commands::Prune(args) => args.run(),
        Commands::Demo(args) => args.run(),
    }
}
