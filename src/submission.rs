//! Submissions and the normalized results produced for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sandbox::BackendKind;

/// Immutable source text submitted for execution.
#[derive(Debug, Clone)]
pub struct Submission {
    id: Uuid,
    code: String,
    created_at: DateTime<Utc>,
}

impl Submission {
    /// Wraps `code` in a new submission with a fresh identifier.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: code.into(),
            created_at: Utc::now(),
        }
    }

    /// Opaque identifier of this submission.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Short form of the identifier, used in container and artifact names.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..12].to_string()
    }

    /// The submitted source text.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// When the submission was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Classification of a finished submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// The code ran and exited cleanly.
    Success,
    /// The code ran and failed (nonzero exit, uncaught exception).
    RuntimeError,
    /// The code exceeded the timeout budget.
    Timeout,
    /// The validator refused the code; nothing was executed.
    Rejected,
    /// The engine could not execute anything.
    InfrastructureError,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::RuntimeError => write!(f, "runtime_error"),
            Self::Timeout => write!(f, "timeout"),
            Self::Rejected => write!(f, "rejected"),
            Self::InfrastructureError => write!(f, "infrastructure_error"),
        }
    }
}

/// The single result produced for every submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Identifier of the submission this result belongs to.
    pub submission_id: Uuid,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Outcome classification.
    pub status: Status,
    /// Wall-clock time spent inside the engine.
    pub duration_ms: u64,
    /// Exit code reported by the backend, when the code ran to completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Rejection reason, infrastructure failure, or timeout note.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Backend that ran the code. Absent for rejected submissions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    /// Set when captured output was cut at the configured cap.
    #[serde(default)]
    pub truncated: bool,
}

impl ExecutionResult {
    /// A result for code the validator refused. Carries no output.
    pub fn rejected(submission: &Submission, reason: impl Into<String>) -> Self {
        Self {
            submission_id: submission.id(),
            stdout: String::new(),
            stderr: String::new(),
            status: Status::Rejected,
            duration_ms: 0,
            exit_code: None,
            message: Some(reason.into()),
            backend: None,
            truncated: false,
        }
    }

    /// Returns true if the submission ran and exited cleanly.
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}
