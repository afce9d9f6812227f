//! Submit one snippet and print its result.
//!
//! Formatting is pure. IO happens only at the top level.

use anyhow::{Context, Result};
use colored::Colorize;
use std::io::Write;
use std::path::Path;

use execbox::{Config, ExecutionResult, Scheduler, Status};

/// Process exit code for a result status.
pub fn exit_code(status: Status) -> u8 {
    match status {
        Status::Success => 0,
        Status::RuntimeError => 1,
        Status::Rejected => 2,
        Status::InfrastructureError => 3,
        Status::Timeout => 124,
    }
}

/// One-line human summary of a result.
pub fn format_summary(result: &ExecutionResult) -> String {
    let status = match result.status {
        Status::Success => "success".green().bold(),
        Status::RuntimeError => "runtime error".red().bold(),
        Status::Timeout => "timeout".yellow().bold(),
        Status::Rejected => "rejected".red().bold(),
        Status::InfrastructureError => "infrastructure error".magenta().bold(),
    };

    let mut summary = format!("{} {} in {}ms", "→".dimmed(), status, result.duration_ms);
    if let Some(backend) = result.backend {
        summary.push_str(&format!(" ({})", backend.to_string().cyan()));
    }
    if let Some(code) = result.exit_code.filter(|c| *c != 0) {
        summary.push_str(&format!(", exit code {code}"));
    }
    if let Some(message) = &result.message {
        summary.push_str(&format!(": {message}"));
    }
    summary
}

pub async fn run(config: &Config, source: Option<&Path>, json: bool) -> Result<u8> {
    let code = super::read_source(source)?;

    let engine = Scheduler::initialize(config).await?;
    let result = engine.submit(code).await;
    engine.shutdown().await;

    if json {
        let out = serde_json::to_string_pretty(&result).context("Failed to serialize result")?;
        println!("{out}");
    } else {
        print!("{}", result.stdout);
        std::io::stdout().flush()?;
        eprint!("{}", result.stderr);
        eprintln!("{}", format_summary(&result));
    }

    Ok(exit_code(result.status))
}
