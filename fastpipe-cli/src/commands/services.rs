//! `fastpipe services` — registry listing with liveness.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use fastpipe_core::{paths::fastpipe_root, registry, registry::ListedService};

/// Arguments for `fastpipe services`.
#[derive(Args, Debug)]
pub struct ServicesArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct ServiceJson {
    name: String,
    status: &'static str,
    pid: Option<i32>,
    root: Option<String>,
    started_at: Option<DateTime<Utc>>,
}

#[derive(Tabled)]
struct ServiceTableRow {
    #[tabled(rename = "service")]
    name: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "pid")]
    pid: String,
    #[tabled(rename = "started")]
    started: String,
    #[tabled(rename = "root")]
    root: String,
}

impl ServicesArgs {
    pub fn run(self) -> Result<()> {
        let root = fastpipe_root().context("failed to resolve fastpipe root")?;
        let services = registry::list_at(&root)
            .with_context(|| format!("failed to read registry under {}", root.display()))?;

        if self.json {
            return print_json(services);
        }
        print_table(services);
        Ok(())
    }
}

fn status_key(service: &ListedService) -> &'static str {
    match (&service.record, service.alive) {
        (None, _) => "corrupt",
        (Some(_), true) => "alive",
        (Some(_), false) => "stale",
    }
}

fn status_label(service: &ListedService) -> String {
    match status_key(service) {
        "alive" => "● alive".green().to_string(),
        "stale" => "○ stale".yellow().to_string(),
        other => format!("✗ {other}").red().to_string(),
    }
}

fn print_json(services: Vec<ListedService>) -> Result<()> {
    let payload: Vec<ServiceJson> = services
        .iter()
        .map(|service| ServiceJson {
            name: service.name.clone(),
            status: status_key(service),
            pid: service.record.as_ref().map(|r| r.pid),
            root: service.record.as_ref().map(|r| r.root.display().to_string()),
            started_at: service.record.as_ref().and_then(|r| r.started_at),
        })
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to serialize services JSON")?
    );
    Ok(())
}

fn print_table(services: Vec<ListedService>) {
    if services.is_empty() {
        println!("No services registered.");
        return;
    }
    let stale = services.iter().filter(|s| !s.alive).count();
    let rows: Vec<ServiceTableRow> = services
        .iter()
        .map(|service| ServiceTableRow {
            name: service.name.clone(),
            status: status_label(service),
            pid: service
                .record
                .as_ref()
                .map(|r| r.pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            started: service
                .record
                .as_ref()
                .and_then(|r| r.started_at)
                .map(format_age)
                .unwrap_or_else(|| "-".to_string()),
            root: service
                .record
                .as_ref()
                .map(|r| r.root.display().to_string())
                .unwrap_or_default(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    if stale > 0 {
        println!("Run 'fastpipe prune' to remove {stale} dead record(s).");
    }
}

fn format_age(at: DateTime<Utc>) -> String {
    let secs = (Utc::now() - at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
