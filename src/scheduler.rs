//! The engine's single entry point.
//!
//! The scheduler validates each submission, hands it to the backend chosen
//! at startup, bounds the call with the global timeout and folds whatever
//! comes back into one `ExecutionResult`.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::probe::{self, CapabilityFlag};
use crate::sandbox::{
    Backend, BackendKind, BackendPreference, ContainerBackend, InProcessBackend, ProcessBackend,
    RawOutput, SandboxError,
};
use crate::submission::{ExecutionResult, Status, Submission};
use crate::validator::{Validator, Verdict};

/// Validates, dispatches and normalizes submissions.
pub struct Scheduler {
    validator: Validator,
    backend: Option<Arc<dyn Backend>>,
    capabilities: CapabilityFlag,
    timeout: Duration,
    grace: Duration,
}

impl Scheduler {
    /// Probes the deployment and builds the engine around the strongest
    /// backend the configuration allows.
    pub async fn initialize(config: &Config) -> Result<Self> {
        let capabilities = probe::probe(config).await;
        Self::from_capabilities(config, capabilities).await
    }

    /// Builds the engine for an already-probed deployment.
    ///
    /// When no backend can be selected the scheduler is still built, but
    /// [`Scheduler::is_ready`] is false and every accepted submission yields
    /// an infrastructure error.
    pub async fn from_capabilities(config: &Config, capabilities: CapabilityFlag) -> Result<Self> {
        let engine = &config.engine;
        let selected = select_backend(engine.backend, engine.hardened, capabilities);

        let backend: Option<Arc<dyn Backend>> = match selected {
            Some(BackendKind::Container) => {
                let backend = ContainerBackend::connect(config)
                    .context("Failed to connect to the container runtime")?;
                match backend.cleanup_orphaned().await {
                    Ok(0) => {}
                    Ok(n) => info!("Removed {} orphaned container(s)", n),
                    Err(e) => warn!("Orphan sweep failed: {}", e),
                }
                Some(Arc::new(backend))
            }
            Some(BackendKind::Process) => {
                warn!("Container runtime unavailable or not selected; using bare process isolation");
                let backend = ProcessBackend::new(&config.process, engine)
                    .context("Invalid process backend command")?;
                Some(Arc::new(backend))
            }
            Some(BackendKind::InProcess) => {
                warn!("Using the in-process interpreter; unsuitable for untrusted code");
                let backend = InProcessBackend::new(&config.in_process, engine)
                    .context("Failed to load the embedded Python runtime")?;
                Some(Arc::new(backend))
            }
            None => {
                warn!(
                    "No isolation backend available (preference: {}, hardened: {})",
                    engine.backend, engine.hardened
                );
                None
            }
        };

        if let Some(kind) = selected {
            info!("Execution engine ready with {} backend", kind);
        }

        Ok(Self {
            validator: Validator::new(&config.validator, engine),
            backend,
            capabilities,
            timeout: engine.timeout(),
            grace: engine.grace(),
        })
    }

    /// Builds the engine around a caller-supplied backend.
    pub fn with_backend(config: &Config, backend: Arc<dyn Backend>) -> Self {
        Self {
            validator: Validator::new(&config.validator, &config.engine),
            backend: Some(backend),
            capabilities: CapabilityFlag::default(),
            timeout: config.engine.timeout(),
            grace: config.engine.grace(),
        }
    }

    /// Returns true if some backend can execute submissions.
    pub fn is_ready(&self) -> bool {
        self.backend.is_some()
    }

    /// The backend selected at startup.
    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(|b| b.kind())
    }

    /// Capabilities found by the startup probe.
    pub fn capabilities(&self) -> CapabilityFlag {
        self.capabilities
    }

    /// Runs `code` and returns its classified result.
    pub async fn submit(&self, code: impl Into<String>) -> ExecutionResult {
        self.execute(&Submission::new(code)).await
    }

    /// Runs an existing submission and returns its classified result.
    pub async fn execute(&self, submission: &Submission) -> ExecutionResult {
        let started = Instant::now();

        if let Verdict::Reject(reason) = self.validator.validate(submission.code()) {
            info!("Rejected {}: {}", submission.id(), reason);
            return ExecutionResult {
                duration_ms: elapsed_ms(started),
                ..ExecutionResult::rejected(submission, reason)
            };
        }

        let Some(backend) = &self.backend else {
            return infrastructure_error(
                submission,
                None,
                "no isolation backend available".to_string(),
                started,
            );
        };
        let kind = backend.kind();
        debug!("Dispatching {} to {} backend", submission.id(), kind);

        if let Err(e) = backend.prepare(submission).await {
            warn!("{} backend could not prepare {}: {}", kind, submission.id(), e);
            return infrastructure_error(submission, Some(kind), e.to_string(), started);
        }

        // Backends enforce `timeout` themselves; this outer bound only catches
        // one that fails to.
        let deadline = self.timeout.saturating_add(self.grace);
        let outcome = tokio::time::timeout(deadline, backend.run(submission, self.timeout)).await;

        let result = match outcome {
            Ok(Ok(raw)) => completed(submission, kind, raw, started),
            Ok(Err(e)) if e.is_timeout() => timed_out(submission, kind, &e, started),
            Ok(Err(e)) => {
                warn!("{} backend failed for {}: {}", kind, submission.id(), e);
                infrastructure_error(submission, Some(kind), e.to_string(), started)
            }
            Err(_) => {
                warn!(
                    "{} backend overran its {:?} budget for {}",
                    kind, deadline, submission.id()
                );
                timed_out(submission, kind, &SandboxError::timeout(self.timeout), started)
            }
        };

        info!(
            "Finished {} with {} in {}ms",
            submission.id(),
            result.status,
            result.duration_ms
        );
        result
    }

    /// Releases long-lived backend resources such as the warm environment.
    pub async fn shutdown(&self) {
        if let Some(backend) = &self.backend {
            backend.shutdown().await;
        }
    }
}

/// Picks the strongest backend allowed by `preference` and `capabilities`.
///
/// An explicit preference may choose a weaker backend, never an unavailable
/// one, and hardened deployments never get the in-process backend.
pub fn select_backend(
    preference: BackendPreference,
    hardened: bool,
    capabilities: CapabilityFlag,
) -> Option<BackendKind> {
    let container = capabilities
        .container_runtime_available
        .then_some(BackendKind::Container);
    let process = capabilities
        .interpreter_available
        .then_some(BackendKind::Process);
    let in_process = (capabilities.embedded_runtime_available && !hardened)
        .then_some(BackendKind::InProcess);

    match preference {
        BackendPreference::Auto => container.or(process).or(in_process),
        BackendPreference::Container => container,
        BackendPreference::Process => process,
        BackendPreference::InProcess => in_process,
    }
}

fn completed(submission: &Submission, kind: BackendKind, raw: RawOutput, started: Instant) -> ExecutionResult {
    let status = if raw.exit_code == 0 {
        Status::Success
    } else {
        Status::RuntimeError
    };

    ExecutionResult {
        submission_id: submission.id(),
        stdout: raw.stdout,
        stderr: raw.stderr,
        status,
        duration_ms: elapsed_ms(started),
        exit_code: Some(raw.exit_code),
        message: raw.truncated.then(|| "output truncated".to_string()),
        backend: Some(kind),
        truncated: raw.truncated,
    }
}

fn timed_out(submission: &Submission, kind: BackendKind, err: &SandboxError, started: Instant) -> ExecutionResult {
    ExecutionResult {
        submission_id: submission.id(),
        stdout: String::new(),
        stderr: String::new(),
        status: Status::Timeout,
        duration_ms: elapsed_ms(started),
        exit_code: None,
        message: Some(err.to_string()),
        backend: Some(kind),
        truncated: false,
    }
}

fn infrastructure_error(
    submission: &Submission,
    kind: Option<BackendKind>,
    message: String,
    started: Instant,
) -> ExecutionResult {
    ExecutionResult {
        submission_id: submission.id(),
        stdout: String::new(),
        stderr: String::new(),
        status: Status::InfrastructureError,
        duration_ms: elapsed_ms(started),
        exit_code: None,
        message: Some(message),
        backend: kind,
        truncated: false,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::mock::{MockBackend, MockResponse};

    fn caps(container: bool, interpreter: bool) -> CapabilityFlag {
        CapabilityFlag {
            container_runtime_available: container,
            interpreter_available: interpreter,
            embedded_runtime_available: true,
        }
    }

    /// Config selecting the in-process backend, if a RustPython WASI module
    /// is named by `EXECBOX_PYTHON_WASM`.
    fn in_process_config(timeout_secs: u64, grace_ms: u64) -> Option<Config> {
        let module = std::env::var_os("EXECBOX_PYTHON_WASM").map(std::path::PathBuf::from)?;
        if !module.is_file() {
            return None;
        }
        let mut config = config_with_timeout(timeout_secs, grace_ms);
        config.engine.backend = BackendPreference::InProcess;
        config.in_process.module = module;
        Some(config)
    }

    fn config_with_timeout(timeout_secs: u64, grace_ms: u64) -> Config {
        let mut config = Config::default();
        config.engine.timeout_secs = timeout_secs;
        config.engine.grace_ms = grace_ms;
        config
    }

    fn scheduler(mock: &MockBackend) -> Scheduler {
        Scheduler::with_backend(&Config::default(), Arc::new(mock.clone()))
    }

    #[test]
    fn test_select_backend_auto_prefers_strongest() {
        use BackendPreference::Auto;
        assert_eq!(select_backend(Auto, false, caps(true, true)), Some(BackendKind::Container));
        assert_eq!(select_backend(Auto, false, caps(false, true)), Some(BackendKind::Process));
        assert_eq!(select_backend(Auto, false, caps(false, false)), Some(BackendKind::InProcess));
        assert_eq!(select_backend(Auto, true, caps(false, false)), None);

        let no_module = CapabilityFlag {
            embedded_runtime_available: false,
            ..caps(false, false)
        };
        assert_eq!(select_backend(Auto, false, no_module), None);
        assert_eq!(select_backend(BackendPreference::InProcess, false, no_module), None);
    }

    #[test]
    fn test_select_backend_explicit_never_picks_unavailable() {
        assert_eq!(
            select_backend(BackendPreference::Process, false, caps(true, true)),
            Some(BackendKind::Process)
        );
        assert_eq!(select_backend(BackendPreference::Container, false, caps(false, true)), None);
        assert_eq!(select_backend(BackendPreference::Process, false, caps(true, false)), None);
        assert_eq!(select_backend(BackendPreference::InProcess, true, caps(true, true)), None);
    }

    #[tokio::test]
    async fn test_rejected_code_never_reaches_backend() {
        let mock = MockBackend::always_succeed("unreachable");
        let result = scheduler(&mock).submit("import os\nos.system('ls')").await;

        assert_eq!(result.status, Status::Rejected);
        assert_eq!(result.message.as_deref(), Some("denied import: os"));
        assert!(result.stdout.is_empty());
        assert!(result.backend.is_none());
        assert_eq!(mock.invocation_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_exit_is_success() {
        let mock = MockBackend::always_succeed("hello\n");
        let result = scheduler(&mock).submit("print('hello')").await;

        assert_eq!(result.status, Status::Success);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.backend, Some(BackendKind::Process));
        assert_eq!(mock.invocation_count(), 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_runtime_error() {
        let mock = MockBackend::new(vec![MockResponse::Exit {
            stdout: String::new(),
            stderr: "Exception: boom\n".to_string(),
            exit_code: 1,
        }]);
        let result = scheduler(&mock).submit("raise Exception('boom')").await;

        assert_eq!(result.status, Status::RuntimeError);
        assert!(result.stderr.contains("boom"));
        assert_eq!(result.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_backend_timeout_is_timeout() {
        let mock = MockBackend::new(vec![MockResponse::Timeout]);
        let result = scheduler(&mock).submit("while True: pass").await;

        assert_eq!(result.status, Status::Timeout);
        assert!(result.message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_backend_failure_is_infrastructure_error() {
        let mock = MockBackend::always_fail("daemon went away");
        let result = scheduler(&mock).submit("print(1)").await;

        assert_eq!(result.status, Status::InfrastructureError);
        assert!(result.message.unwrap().contains("daemon went away"));
    }

    #[tokio::test]
    async fn test_safety_net_catches_hung_backend() {
        let mock = MockBackend::new(vec![MockResponse::Hang]);
        let scheduler = Scheduler::with_backend(&config_with_timeout(1, 100), Arc::new(mock));

        let result = scheduler.submit("print(1)").await;
        assert_eq!(result.status, Status::Timeout);
    }

    #[tokio::test]
    async fn test_prepare_failure_is_infrastructure_error() {
        let mock = MockBackend::always_succeed("unreachable")
            .with_prepare_error("liveness check never passed");
        let result = scheduler(&mock).submit("import numpy").await;

        assert_eq!(result.status, Status::InfrastructureError);
        assert!(result.message.unwrap().contains("liveness check never passed"));
        assert_eq!(mock.invocation_count(), 0);
    }

    #[tokio::test]
    async fn test_prepare_time_is_not_charged_to_timeout() {
        let mock = MockBackend::always_succeed("ready\n")
            .with_prepare_delay(Duration::from_millis(1500));
        let scheduler = Scheduler::with_backend(&config_with_timeout(1, 100), Arc::new(mock));

        let result = scheduler.submit("import numpy").await;
        assert_eq!(result.status, Status::Success);
        assert_eq!(result.stdout, "ready\n");
    }

    #[tokio::test]
    async fn test_no_backend_is_infrastructure_error() {
        let mut config = Config::default();
        config.engine.hardened = true;
        config.engine.backend = BackendPreference::InProcess;

        let scheduler = Scheduler::from_capabilities(&config, caps(false, false))
            .await
            .unwrap();
        assert!(!scheduler.is_ready());
        assert_eq!(scheduler.backend_kind(), None);

        let result = scheduler.submit("print(1)").await;
        assert_eq!(result.status, Status::InfrastructureError);

        // Rejection still wins over a missing backend.
        let result = scheduler.submit("import socket").await;
        assert_eq!(result.status, Status::Rejected);
    }

    #[tokio::test]
    async fn test_in_process_end_to_end() {
        let Some(config) = in_process_config(2, 500) else {
            return;
        };
        let scheduler = Scheduler::from_capabilities(&config, caps(false, false))
            .await
            .unwrap();
        assert_eq!(scheduler.backend_kind(), Some(BackendKind::InProcess));

        let result = scheduler.submit("print('hello')").await;
        assert_eq!(result.status, Status::Success);
        assert_eq!(result.stdout, "hello\n");

        let result = scheduler.submit("raise Exception('boom')").await;
        assert_eq!(result.status, Status::RuntimeError);
        assert!(result.stderr.contains("boom"));

        let result = scheduler.submit("while True:\n    pass").await;
        assert_eq!(result.status, Status::Timeout);

        let result = scheduler.submit("print('after')").await;
        assert_eq!(result.status, Status::Success);
    }

    #[tokio::test]
    async fn test_deeply_nested_expression_is_not_fatal() {
        let Some(config) = in_process_config(10, 500) else {
            return;
        };
        let scheduler = Scheduler::from_capabilities(&config, caps(false, false))
            .await
            .unwrap();

        let code = format!("print({}1{})", "(".repeat(20000), ")".repeat(20000));
        let result = scheduler.submit(code).await;
        assert_ne!(result.status, Status::InfrastructureError);

        let result = scheduler.submit("print('still serving')").await;
        assert_eq!(result.status, Status::Success);
    }

    #[tokio::test]
    async fn test_missing_module_fails_initialization() {
        let mut config = Config::default();
        config.engine.backend = BackendPreference::InProcess;
        config.in_process.module = std::path::PathBuf::from("/nonexistent/python.wasm");

        let err = Scheduler::from_capabilities(&config, caps(false, false))
            .await
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("Embedded Python runtime unavailable"));
    }

    #[tokio::test]
    async fn test_repeat_submissions_are_independent() {
        let Some(config) = in_process_config(30, 2000) else {
            return;
        };
        let scheduler = Scheduler::from_capabilities(&config, caps(false, false))
            .await
            .unwrap();

        let code = "x = 0\nfor i in range(5):\n    x += i\nprint(x)";
        let first = scheduler.submit(code).await;
        let second = scheduler.submit(code).await;

        assert_eq!(first.status, second.status);
        assert_eq!(first.stdout, "10\n");
        assert_eq!(first.stdout, second.stdout);
        assert_ne!(first.submission_id, second.submission_id);
    }
}
