//! Mock backend for testing.
//!
//! Returns predetermined outcomes so scheduler behavior can be exercised
//! without Docker or an interpreter on the host.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{Backend, BackendKind, RawOutput, SandboxError};
use crate::submission::Submission;

/// A mock backend for testing.
///
/// Returns configurable outcomes and tracks invocations for test assertions.
#[derive(Debug, Clone)]
pub(crate) struct MockBackend {
    /// Outcomes to return in order. Cycles if more runs than outcomes.
    responses: Arc<Vec<MockResponse>>,
    /// Number of times `run` has been called.
    invocation_count: Arc<AtomicUsize>,
    /// Variant to report.
    kind: BackendKind,
    /// How long `prepare` takes.
    prepare_delay: Duration,
    /// Error `prepare` fails with, if any.
    prepare_error: Option<String>,
}

/// A single mock outcome.
#[derive(Debug, Clone)]
pub(crate) enum MockResponse {
    /// Complete with the given streams and exit code.
    Exit {
        stdout: String,
        stderr: String,
        exit_code: i64,
    },
    /// Report the backend's own timeout.
    Timeout,
    /// Fail with an infrastructure error.
    Fail(String),
    /// Never return on its own.
    Hang,
}

impl MockBackend {
    /// Create a new mock backend that returns the given outcomes in order.
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Arc::new(responses),
            invocation_count: Arc::new(AtomicUsize::new(0)),
            kind: BackendKind::Process,
            prepare_delay: Duration::ZERO,
            prepare_error: None,
        }
    }

    /// Create a mock that always exits 0 with the given stdout.
    pub fn always_succeed(stdout: &str) -> Self {
        Self::new(vec![MockResponse::Exit {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        }])
    }

    /// Create a mock that always fails with the given error.
    pub fn always_fail(error: &str) -> Self {
        Self::new(vec![MockResponse::Fail(error.to_string())])
    }

    /// Report a different backend variant.
    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    /// Make `prepare` take `delay` before succeeding.
    pub fn with_prepare_delay(mut self, delay: Duration) -> Self {
        self.prepare_delay = delay;
        self
    }

    /// Make `prepare` fail with a provisioning error.
    pub fn with_prepare_error(mut self, error: &str) -> Self {
        self.prepare_error = Some(error.to_string());
        self
    }

    /// Get the number of times `run` was called.
    pub fn invocation_count(&self) -> usize {
        self.invocation_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn prepare(&self, _submission: &Submission) -> Result<(), SandboxError> {
        tokio::time::sleep(self.prepare_delay).await;
        match &self.prepare_error {
            Some(msg) => Err(SandboxError::provision_failed(msg.clone())),
            None => Ok(()),
        }
    }

    async fn run(&self, _submission: &Submission, timeout: Duration) -> Result<RawOutput, SandboxError> {
        let count = self.invocation_count.fetch_add(1, Ordering::SeqCst);
        let response = &self.responses[count % self.responses.len()];

        match response {
            MockResponse::Exit {
                stdout,
                stderr,
                exit_code,
            } => Ok(RawOutput {
                stdout: stdout.clone(),
                stderr: stderr.clone(),
                exit_code: *exit_code,
                truncated: false,
            }),
            MockResponse::Timeout => Err(SandboxError::timeout(timeout)),
            MockResponse::Fail(msg) => Err(SandboxError::container_failed(msg.clone())),
            MockResponse::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_backend_cycles_responses() {
        let backend = MockBackend::new(vec![
            MockResponse::Exit {
                stdout: "first".to_string(),
                stderr: String::new(),
                exit_code: 0,
            },
            MockResponse::Timeout,
        ]);
        let submission = Submission::new("x");
        let timeout = Duration::from_secs(1);

        assert_eq!(backend.run(&submission, timeout).await.unwrap().stdout, "first");
        assert!(backend.run(&submission, timeout).await.unwrap_err().is_timeout());
        assert_eq!(backend.run(&submission, timeout).await.unwrap().stdout, "first");
        assert_eq!(backend.invocation_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_backend_fail() {
        let backend = MockBackend::always_fail("daemon gone").with_kind(BackendKind::Container);
        assert_eq!(backend.kind(), BackendKind::Container);
        let err = backend
            .run(&Submission::new("x"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("daemon gone"));
    }
}
