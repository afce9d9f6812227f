//! Report what this host can run and which backend would be selected.

use anyhow::Result;
use colored::Colorize;
use serde_json::json;
use std::fmt::Write;

use execbox::probe::{self, CapabilityFlag};
use execbox::sandbox::BackendKind;
use execbox::scheduler::select_backend;
use execbox::Config;

/// Format the probe report as a displayable string.
pub fn format_report(flag: CapabilityFlag, selected: Option<BackendKind>) -> String {
    let mark = |ok: bool| if ok { "yes".green() } else { "no".red() };

    let mut out = String::new();
    let _ = writeln!(out, "  Container runtime: {}", mark(flag.container_runtime_available));
    let _ = writeln!(out, "  Interpreter:       {}", mark(flag.interpreter_available));
    let _ = writeln!(out, "  Embedded Python:   {}", mark(flag.embedded_runtime_available));
    let backend = selected.map_or_else(|| "none".red().bold(), |k| k.to_string().cyan().bold());
    let _ = write!(out, "  Selected backend:  {backend}");
    out
}

pub async fn run(config: &Config, json: bool) -> Result<u8> {
    let flag = probe::probe(config).await;
    let selected = select_backend(config.engine.backend, config.engine.hardened, flag);

    if json {
        println!(
            "{}",
            json!({
                "capabilities": flag,
                "preference": config.engine.backend,
                "hardened": config.engine.hardened,
                "selected": selected,
            })
        );
    } else {
        println!("{}", format_report(flag, selected));
    }

    Ok(if selected.is_some() { 0 } else { 3 })
}
