//! `fastpipe prune` — drop dead and unreadable registry records.

use anyhow::{Context, Result};
use clap::Args;

use fastpipe_core::{paths::fastpipe_root, registry};

/// Arguments for `fastpipe prune`.
#[derive(Args, Debug)]
pub struct PruneArgs {}

impl PruneArgs {
    pub fn run(self) -> Result<()> {
        let root = fastpipe_root().context("failed to resolve fastpipe root")?;
        let pruned = registry::prune_stale_at(&root).context("failed to prune registry")?;
        if pruned.is_empty() {
            println!("Nothing to prune.");
            return Ok(());
        }
        for name in &pruned {
            println!("pruned {name}");
        }
        println!("{} record(s) removed.", pruned.len());
        Ok(())
    }
}
