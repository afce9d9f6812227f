//! Isolation backends for untrusted snippets.
//!
//! Three variants implement one contract: a fresh Docker container per
//! submission (with an optional warm environment for heavy dependencies), a
//! bare child process, and an in-process interpreter of last resort. The
//! scheduler picks one at construction and never switches.

mod artifact;
mod docker;
mod error;
mod inprocess;
#[cfg(test)]
pub(crate) mod mock;
mod process;
mod warm;

pub(crate) use artifact::Artifact;
pub use docker::{ContainerBackend, MANAGED_LABEL};
pub use error::SandboxError;
pub use inprocess::InProcessBackend;
pub use process::ProcessBackend;
pub use warm::{DockerWarmDriver, Health, WarmDriver, WarmManager};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::submission::Submission;

/// Contract shared by every isolation backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Which variant this is.
    fn kind(&self) -> BackendKind;

    /// Readies long-lived resources the submission needs, such as a warm
    /// environment with its packages installed.
    ///
    /// Runs before the submission's timeout starts. An error here means the
    /// platform could not serve the submission at all.
    async fn prepare(&self, _submission: &Submission) -> Result<(), SandboxError> {
        Ok(())
    }

    /// Runs the submission, bounded by `timeout`.
    ///
    /// Returns the raw outcome when the code ran to completion (whatever its
    /// exit code), `SandboxError::Timeout` when the bound was hit, and any
    /// other error when the backend itself failed. Resources created for the
    /// submission are released on every path.
    async fn run(&self, submission: &Submission, timeout: Duration)
        -> Result<RawOutput, SandboxError>;

    /// Releases long-lived resources. Called once on service shutdown.
    async fn shutdown(&self) {}
}

/// Captured output of a submission that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit code; zero means success.
    pub exit_code: i64,
    /// Set when either stream hit the output cap.
    pub truncated: bool,
}

impl RawOutput {
    pub(crate) fn from_streams(stdout: CappedOutput, stderr: CappedOutput, exit_code: i64) -> Self {
        let truncated = stdout.truncated || stderr.truncated;
        Self {
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            exit_code,
            truncated,
        }
    }
}

/// Byte buffer that silently drops everything past its limit.
#[derive(Debug)]
pub(crate) struct CappedOutput {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CappedOutput {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    pub(crate) fn push_str(&mut self, text: &str) {
        self.push(text.as_bytes());
    }

    pub(crate) fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

/// The backend variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Disposable Docker container per submission.
    Container,
    /// Bare child process. Weaker isolation.
    Process,
    /// Interpreter inside the service process. Unsuitable for untrusted code.
    InProcess,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::Process => write!(f, "process"),
            Self::InProcess => write!(f, "in-process"),
        }
    }
}

/// Operator preference for backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendPreference {
    /// Strongest available: container, then process, then in-process.
    #[default]
    Auto,
    /// Container only.
    Container,
    /// Process only.
    Process,
    /// In-process only.
    InProcess,
}

impl std::fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Container => write!(f, "container"),
            Self::Process => write!(f, "process"),
            Self::InProcess => write!(f, "in-process"),
        }
    }
}

impl std::str::FromStr for BackendPreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "container" | "docker" => Ok(Self::Container),
            "process" => Ok(Self::Process),
            "in-process" | "inprocess" => Ok(Self::InProcess),
            _ => anyhow::bail!(
                "Unknown backend: '{s}'. Supported: auto, container, process, in-process"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_display() {
        assert_eq!(format!("{}", BackendKind::Container), "container");
        assert_eq!(format!("{}", BackendKind::Process), "process");
        assert_eq!(format!("{}", BackendKind::InProcess), "in-process");
    }

    #[test]
    fn test_backend_preference_from_str() {
        assert_eq!(
            "auto".parse::<BackendPreference>().unwrap(),
            BackendPreference::Auto
        );
        assert_eq!(
            "Docker".parse::<BackendPreference>().unwrap(),
            BackendPreference::Container
        );
        assert_eq!(
            "in-process".parse::<BackendPreference>().unwrap(),
            BackendPreference::InProcess
        );
        assert!("vm".parse::<BackendPreference>().is_err());
    }

    #[test]
    fn test_capped_output_truncates() {
        let mut out = CappedOutput::new(5);
        out.push_str("abc");
        out.push_str("defg");
        assert!(out.truncated);
        assert_eq!(out.into_string(), "abcde");
    }

    #[test]
    fn test_raw_output_from_streams() {
        let mut stdout = CappedOutput::new(64);
        stdout.push_str("hello\n");
        let mut stderr = CappedOutput::new(2);
        stderr.push_str("boom");

        let raw = RawOutput::from_streams(stdout, stderr, 1);
        assert_eq!(raw.stdout, "hello\n");
        assert_eq!(raw.stderr, "bo");
        assert_eq!(raw.exit_code, 1);
        assert!(raw.truncated);
    }
}
