//! In-process backend of last resort.
//!
//! Snippets run on a bounded pool of blocking workers, each instantiating a
//! RustPython interpreter compiled to WebAssembly. The guest sees no host
//! filesystem or network and its memory is capped, but it still shares the
//! service's address space and CPU, so this backend is never chosen when the
//! engine runs hardened.

mod runtime;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use self::runtime::PythonRuntime;
use super::docker::parse_memory_limit;
use super::{Backend, BackendKind, RawOutput, SandboxError};
use crate::config::{EngineConfig, InProcessConfig};
use crate::submission::Submission;

/// Runs submissions on a fixed-width pool of interpreter workers.
#[derive(Clone)]
pub struct InProcessBackend {
    runtime: Arc<PythonRuntime>,
    permits: Arc<Semaphore>,
    max_output_bytes: usize,
}

impl InProcessBackend {
    /// Compiles the configured interpreter module and builds a pool of
    /// `config.workers` workers (at least one).
    pub fn new(config: &InProcessConfig, engine: &EngineConfig) -> Result<Self, SandboxError> {
        let memory_limit = parse_memory_limit(&config.memory)
            .ok()
            .and_then(|bytes| usize::try_from(bytes).ok())
            .ok_or_else(|| {
                SandboxError::runtime_unavailable(format!("invalid memory limit: {}", config.memory))
            })?;

        if !config.module.is_file() {
            return Err(SandboxError::runtime_unavailable(format!(
                "{} does not exist",
                config.module.display()
            )));
        }
        let runtime = PythonRuntime::load(&config.module, memory_limit)?;

        Ok(Self {
            runtime: Arc::new(runtime),
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
            max_output_bytes: engine.max_output_bytes,
        })
    }

    /// Number of workers currently free.
    pub fn idle_workers(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl Backend for InProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    async fn run(&self, submission: &Submission, timeout: Duration) -> Result<RawOutput, SandboxError> {
        // Waiting for a worker counts against the budget.
        let deadline = Instant::now() + timeout;

        let permit = tokio::time::timeout_at(deadline, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| SandboxError::timeout(timeout))?
            .map_err(|e| SandboxError::worker_failed(e.to_string()))?;

        let cancel = CancelOnDrop::default();
        let flag = Arc::clone(&cancel.0);
        let runtime = Arc::clone(&self.runtime);
        let code = submission.code().to_string();
        let limit = self.max_output_bytes;
        let guest_deadline = deadline.into_std();

        debug!("In-process worker picked up {}", submission.id());
        let worker = tokio::task::spawn_blocking(move || {
            // The slot stays taken until the guest has actually stopped.
            let _permit = permit;
            runtime.execute(&code, guest_deadline, flag, limit)
        });

        match tokio::time::timeout_at(deadline, worker).await {
            Ok(Ok(Ok(Some(output)))) => Ok(output),
            Ok(Ok(Ok(None))) => Err(SandboxError::timeout(timeout)),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(e)) => Err(SandboxError::worker_failed(e.to_string())),
            Err(_) => {
                warn!("In-process run {} timed out after {:?}, interrupting", submission.id(), timeout);
                Err(SandboxError::timeout(timeout))
            }
        }
    }
}

/// Interrupts the guest when the run ends, however it ends.
#[derive(Default)]
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}
