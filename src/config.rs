//! Engine configuration: `execbox.toml` with every field defaulted.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sandbox::BackendPreference;

const CONFIG_FILE: &str = "execbox.toml";

/// Engine configuration, loaded from `execbox.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Scheduler-wide settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Operator additions to the validator denylist.
    #[serde(default)]
    pub validator: ValidatorConfig,
    /// Fresh-container backend settings.
    #[serde(default)]
    pub container: ContainerConfig,
    /// Warm environment settings.
    #[serde(default)]
    pub warm: WarmConfig,
    /// Subprocess backend settings.
    #[serde(default)]
    pub process: ProcessConfig,
    /// In-process fallback settings.
    #[serde(default)]
    pub in_process: InProcessConfig,
}

/// Scheduler-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Global wall-clock limit per submission, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Extra time granted to a backend to report its own timeout before the
    /// scheduler gives up on it, in milliseconds
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,

    /// Backend preference: "auto", "container", "process" or "in-process"
    #[serde(default)]
    pub backend: BackendPreference,

    /// Hardened deployments never fall back to the in-process backend
    #[serde(default)]
    pub hardened: bool,

    /// Submissions larger than this are rejected
    #[serde(default = "default_max_code_bytes")]
    pub max_code_bytes: usize,

    /// Per-stream cap on captured output
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            grace_ms: default_grace_ms(),
            backend: BackendPreference::default(),
            hardened: false,
            max_code_bytes: default_max_code_bytes(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl EngineConfig {
    /// The global timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The scheduler's safety-net grace period.
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

/// Additional validator entries. Built-in entries cannot be removed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Extra module names to deny in import statements
    #[serde(default)]
    pub extra_denied_modules: Vec<String>,

    /// Extra regex patterns to deny anywhere in the source
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

/// Settings for the fresh-container backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Runtime image
    #[serde(default = "default_image")]
    pub image: String,

    /// Interpreter command; the artifact path is appended
    #[serde(default = "default_container_command")]
    pub command: Vec<String>,

    /// Memory ceiling (e.g., "100m")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit (e.g., "1")
    #[serde(default = "default_cpus")]
    pub cpus: String,

    /// Maximum number of processes inside the container
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,

    /// User the snippet runs as
    #[serde(default = "default_user")]
    pub user: String,

    /// Pull the image on first use when it is missing locally
    #[serde(default = "default_true")]
    pub pull_missing: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            command: default_container_command(),
            memory: default_memory(),
            cpus: default_cpus(),
            pids_limit: default_pids_limit(),
            user: default_user(),
            pull_missing: true,
        }
    }
}

/// Settings for the warm environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmConfig {
    /// Route heavy-dependency snippets through a long-lived container
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Image the warm container starts from
    #[serde(default = "default_image")]
    pub image: String,

    /// Heavy packages: import name -> installable package name
    #[serde(default = "default_warm_packages")]
    pub packages: BTreeMap<String, String>,

    /// Install packages with pip while provisioning. When false the image
    /// is expected to ship them.
    #[serde(default = "default_true")]
    pub install: bool,

    /// Memory ceiling of the warm container
    #[serde(default = "default_warm_memory")]
    pub memory: String,

    /// Liveness polls before provisioning is declared failed
    #[serde(default = "default_health_retries")]
    pub health_retries: u32,

    /// Initial backoff between liveness polls, doubled on each retry
    #[serde(default = "default_health_backoff_ms")]
    pub health_backoff_ms: u64,
}

impl Default for WarmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            image: default_image(),
            packages: default_warm_packages(),
            install: true,
            memory: default_warm_memory(),
            health_retries: default_health_retries(),
            health_backoff_ms: default_health_backoff_ms(),
        }
    }
}

/// Settings for the subprocess backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Interpreter command line; the artifact path is appended
    #[serde(default = "default_process_command")]
    pub command: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            command: default_process_command(),
        }
    }
}

/// Settings for the in-process fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InProcessConfig {
    /// Worker pool width
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// RustPython interpreter compiled to `wasm32-wasi`
    #[serde(default = "default_python_module")]
    pub module: PathBuf,

    /// Linear memory cap for one run (e.g., "256m")
    #[serde(default = "default_wasm_memory")]
    pub memory: String,
}

impl Default for InProcessConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            module: default_python_module(),
            memory: default_wasm_memory(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_grace_ms() -> u64 {
    2_000
}

fn default_max_code_bytes() -> usize {
    64 * 1024
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_image() -> String {
    "python:3.11-slim".to_string()
}

fn default_container_command() -> Vec<String> {
    vec!["python".to_string(), "-u".to_string()]
}

fn default_memory() -> String {
    "100m".to_string()
}

fn default_warm_memory() -> String {
    "1g".to_string()
}

fn default_cpus() -> String {
    "1".to_string()
}

fn default_pids_limit() -> i64 {
    64
}

fn default_user() -> String {
    "65534:65534".to_string()
}

fn default_warm_packages() -> BTreeMap<String, String> {
    [
        ("numpy", "numpy"),
        ("pandas", "pandas"),
        ("scipy", "scipy"),
        ("matplotlib", "matplotlib"),
        ("sklearn", "scikit-learn"),
    ]
    .into_iter()
    .map(|(module, package)| (module.to_string(), package.to_string()))
    .collect()
}

fn default_health_retries() -> u32 {
    5
}

fn default_health_backoff_ms() -> u64 {
    250
}

fn default_process_command() -> String {
    "python3 -I -u".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_python_module() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("execbox")
        .join("rustpython.wasm")
}

fn default_wasm_memory() -> String {
    "256m".to_string()
}

impl Config {
    /// Load configuration, using defaults if no file is found.
    ///
    /// An explicit path must exist. Otherwise `./execbox.toml` and then
    /// `<config dir>/execbox/config.toml` are tried.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_file(path);
        }

        match Self::candidate_paths().into_iter().find(|p| p.exists()) {
            Some(path) => Self::load_file(&path),
            None => Ok(Self::default()),
        }
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("execbox").join("config.toml"));
        }
        paths
    }

    fn load_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}
