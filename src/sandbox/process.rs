//! Bare child-process backend.
//!
//! Weaker than the container backend: the child shares the host kernel,
//! filesystem and network. Only the environment is scrubbed and the working
//! directory is a private read-only temp dir. Deployments that rely on this
//! backend for untrusted code must wrap the service in OS-level restrictions
//! (namespaces, seccomp).

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{Artifact, Backend, BackendKind, CappedOutput, RawOutput, SandboxError};
use crate::config::{EngineConfig, ProcessConfig};
use crate::submission::Submission;

/// PATH handed to the child in place of the host environment.
const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Bound on the interpreter version check.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs each submission as a standalone interpreter process.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    program: String,
    args: Vec<String>,
    max_output_bytes: usize,
}

impl ProcessBackend {
    /// Parses the configured interpreter command line.
    pub fn new(config: &ProcessConfig, engine: &EngineConfig) -> Result<Self, SandboxError> {
        let parts = shell_words::split(&config.command).map_err(|e| {
            SandboxError::spawn_failed(
                config.command.clone(),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
            )
        })?;

        let (program, args) = parts.split_first().ok_or_else(|| {
            SandboxError::spawn_failed(
                "",
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "interpreter command cannot be empty",
                ),
            )
        })?;

        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            max_output_bytes: engine.max_output_bytes,
        })
    }

    /// Returns true if the interpreter answers `--version`.
    pub async fn probe(&self) -> bool {
        let check = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(PROBE_TIMEOUT, check).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!("Interpreter '{}' unavailable: {}", self.program, e);
                false
            }
            Err(_) => {
                debug!("Interpreter '{}' did not answer in time", self.program);
                false
            }
        }
    }

    fn command(&self, artifact: &Artifact) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(artifact.path())
            .current_dir(artifact.dir())
            .env_clear()
            .env("PATH", SAFE_PATH)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        command
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    async fn run(&self, submission: &Submission, timeout: Duration) -> Result<RawOutput, SandboxError> {
        let artifact = Artifact::materialize(submission)?;

        let mut child = self
            .command(&artifact)
            .spawn()
            .map_err(|e| SandboxError::spawn_failed(self.program.clone(), e))?;
        let mut group = ProcessGroupGuard::new(child.id());
        debug!("Spawned {} as pid {:?}", submission.id(), child.id());

        let stdout = tokio::spawn(read_capped(child.stdout.take(), self.max_output_bytes));
        let stderr = tokio::spawn(read_capped(child.stderr.take(), self.max_output_bytes));

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!("Process for {} timed out after {:?}, killing", submission.id(), timeout);
                group.kill();
                let _ = child.kill().await;
                stdout.abort();
                stderr.abort();
                return Err(SandboxError::timeout(timeout));
            }
        };

        // Anything the snippet left running in its group goes with it, which
        // also closes the pipes the readers are waiting on.
        group.kill();

        let stdout = stdout
            .await
            .map_err(|e| SandboxError::worker_failed(e.to_string()))?;
        let stderr = stderr
            .await
            .map_err(|e| SandboxError::worker_failed(e.to_string()))?;

        Ok(RawOutput::from_streams(stdout, stderr, exit_code(status)))
    }
}

async fn read_capped<R>(reader: Option<R>, limit: usize) -> CappedOutput
where
    R: AsyncRead + Unpin,
{
    let mut out = CappedOutput::new(limit);
    let Some(mut reader) = reader else {
        return out;
    };

    // Keep draining past the cap so the child never blocks on a full pipe.
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => out.push(&buf[..n]),
        }
    }
    out
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i64 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => i64::from(code),
        (None, Some(signal)) => 128 + i64::from(signal),
        (None, None) => -1,
    }
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i64 {
    status.code().map_or(-1, i64::from)
}

/// SIGKILLs a child's whole process group when asked or when dropped.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process group {}: {}", pgid, e),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}
