//! Remove containers left behind by an engine that died mid-run.

use anyhow::{Context, Result};
use colored::Colorize;

use execbox::sandbox::{ContainerBackend, MANAGED_LABEL};
use execbox::Config;

pub async fn run(config: &Config) -> Result<u8> {
    let backend = ContainerBackend::connect(config)
        .context("Failed to connect to Docker. Is Docker running?")?;

    let removed = backend
        .cleanup_orphaned()
        .await
        .context("Cannot list containers. Is Docker running?")?;

    if removed == 0 {
        println!("{} No containers labeled {} found.", "ℹ".blue(), MANAGED_LABEL);
    } else {
        println!(
            "{} Removed {} orphaned container(s).",
            "✓".green(),
            removed.to_string().cyan()
        );
    }

    Ok(0)
}
