use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use execbox::sandbox::BackendPreference;
use execbox::Config;

mod commands;

#[derive(Parser)]
#[command(name = "execbox")]
#[command(
    author,
    version,
    about = "Run untrusted code snippets under container, process or in-process isolation"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a config file (default: ./execbox.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs as JSON lines to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a snippet and print its result
    Run {
        /// Source file, or `-` for stdin
        file: Option<PathBuf>,

        /// Backend: auto, container, process or in-process
        #[arg(short, long, env = "EXECBOX_BACKEND")]
        backend: Option<BackendPreference>,

        /// Timeout in seconds
        #[arg(short, long, env = "EXECBOX_TIMEOUT")]
        timeout: Option<u64>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a snippet without executing it
    Check {
        /// Source file, or `-` for stdin
        file: Option<PathBuf>,

        /// Print the verdict as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show which isolation backends are available
    Probe {
        /// Backend preference to evaluate
        #[arg(short, long, env = "EXECBOX_BACKEND")]
        backend: Option<BackendPreference>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove containers left behind by a crashed engine
    Cleanup,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match init_logging(cli.verbose, cli.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            return ExitCode::from(3);
        }
    };

    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::from(3)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<u8> {
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            file,
            backend,
            timeout,
            json,
        } => {
            if let Some(backend) = backend {
                config.engine.backend = backend;
            }
            if let Some(secs) = timeout {
                config.engine.timeout_secs = secs;
            }
            commands::run::run(&config, file.as_deref(), json).await
        }
        Commands::Check { file, json } => commands::check::run(&config, file.as_deref(), json),
        Commands::Probe { backend, json } => {
            if let Some(backend) = backend {
                config.engine.backend = backend;
            }
            commands::probe::run(&config, json).await
        }
        Commands::Cleanup => commands::cleanup::run(&config).await,
    }
}

/// Installs the stderr subscriber and, if requested, a JSON file writer.
///
/// The returned guard flushes the file writer when dropped.
fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("execbox=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("execbox=info"))
    };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;

            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}
