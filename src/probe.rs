//! One-time detection of which isolation backends this deployment can use.

use bollard::Docker;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::Config;
use crate::sandbox::ProcessBackend;

/// Bound on the Docker ping.
const PING_TIMEOUT: Duration = Duration::from_secs(3);

/// What the engine found usable at startup.
///
/// Probed once and held by the scheduler for the rest of the process
/// lifetime; isolation strength never changes after initialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CapabilityFlag {
    /// A Docker daemon answered a ping.
    pub container_runtime_available: bool,
    /// The configured interpreter answered `--version`.
    pub interpreter_available: bool,
    /// The WebAssembly Python module for the in-process backend exists.
    pub embedded_runtime_available: bool,
}

/// Probes the container runtime, the process interpreter and the embedded
/// interpreter module.
///
/// Never fails: anything that does not answer is simply unavailable.
pub async fn probe(config: &Config) -> CapabilityFlag {
    let container_runtime_available = docker_answers().await;

    let interpreter_available = match ProcessBackend::new(&config.process, &config.engine) {
        Ok(backend) => backend.probe().await,
        Err(e) => {
            debug!("Process backend misconfigured: {}", e);
            false
        }
    };

    let module = &config.in_process.module;
    let embedded_runtime_available = module.is_file();
    if !embedded_runtime_available {
        debug!("No embedded Python module at {}", module.display());
    }

    let flag = CapabilityFlag {
        container_runtime_available,
        interpreter_available,
        embedded_runtime_available,
    };
    info!(
        "Capabilities: container runtime {}, interpreter {}, embedded runtime {}",
        available(flag.container_runtime_available),
        available(flag.interpreter_available),
        available(flag.embedded_runtime_available)
    );
    flag
}

async fn docker_answers() -> bool {
    let docker = match Docker::connect_with_local_defaults() {
        Ok(docker) => docker,
        Err(e) => {
            debug!("Cannot connect to Docker: {}", e);
            return false;
        }
    };

    match tokio::time::timeout(PING_TIMEOUT, docker.ping()).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("Docker ping failed: {}", e);
            false
        }
        Err(_) => {
            debug!("Docker ping timed out after {:?}", PING_TIMEOUT);
            false
        }
    }
}

fn available(flag: bool) -> &'static str {
    if flag {
        "available"
    } else {
        "unavailable"
    }
}
