//! CLI command implementations.
//!
//! Each submodule implements one execbox command. Formatting is kept pure
//! and separate from IO for testability.

pub mod check;
pub mod cleanup;
pub mod probe;
pub mod run;

use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;

/// Reads snippet source from `path`, or from stdin when absent or `-`.
pub fn read_source(path: Option<&Path>) -> Result<String> {
    match path {
        Some(p) if p != Path::new("-") => std::fs::read_to_string(p)
            .with_context(|| format!("Failed to read source file: {}", p.display())),
        _ => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("Failed to read source from stdin")?;
            Ok(code)
        }
    }
}
