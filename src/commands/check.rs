//! Run the validator alone, without executing anything.

use anyhow::Result;
use colored::Colorize;
use serde_json::json;
use std::path::Path;

use execbox::{Config, Validator, Verdict};

/// Human-readable form of a verdict.
pub fn format_verdict(verdict: &Verdict) -> String {
    match verdict {
        Verdict::Accept => format!("{} accepted", "✓".green()),
        Verdict::Reject(reason) => format!("{} rejected: {}", "✗".red(), reason),
    }
}

pub fn run(config: &Config, source: Option<&Path>, json: bool) -> Result<u8> {
    let code = super::read_source(source)?;
    let verdict = Validator::new(&config.validator, &config.engine).validate(&code);

    if json {
        let reason = match &verdict {
            Verdict::Accept => None,
            Verdict::Reject(reason) => Some(reason.as_str()),
        };
        println!(
            "{}",
            json!({ "accepted": verdict.is_accept(), "reason": reason })
        );
    } else {
        println!("{}", format_verdict(&verdict));
    }

    Ok(if verdict.is_accept() { 0 } else { 2 })
}
