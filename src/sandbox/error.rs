//! Domain-specific error types for isolation backends.
//!
//! Typed errors let the scheduler tell a timeout apart from an unhealthy
//! platform without parsing message strings.

use std::time::Duration;

/// Errors that can occur while a backend prepares or runs a submission.
///
/// Every variant except `Timeout` means the engine itself failed and is
/// reported as an infrastructure error, never as a fault of the submitted code.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Docker daemon is not running or not accessible.
    #[error("Docker is not available: {message}")]
    DockerUnavailable { message: String },

    /// Container image was not found and could not be pulled.
    #[error("Container image not found: {image}")]
    ImageNotFound { image: String },

    /// Execution exceeded the timeout budget.
    #[error("Execution timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The warm environment failed its liveness check.
    #[error("Container is unhealthy: {message}")]
    ContainerUnhealthy { message: String },

    /// The warm environment never reached a ready state.
    #[error("Warm environment provisioning failed: {message}")]
    ProvisionFailed { message: String },

    /// Container operation failed (create, start, exec, etc.).
    #[error("Container operation failed: {message}")]
    ContainerFailed { message: String },

    /// The interpreter process could not be started.
    #[error("Failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The embedded interpreter module could not be loaded.
    #[error("Embedded Python runtime unavailable: {message}")]
    RuntimeUnavailable { message: String },

    /// The in-process worker pool failed.
    #[error("In-process worker failed: {message}")]
    WorkerFailed { message: String },

    /// Host-side I/O failed while materializing or collecting a submission.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Creates a `DockerUnavailable` error.
    pub fn docker_unavailable(message: impl Into<String>) -> Self {
        Self::DockerUnavailable {
            message: message.into(),
        }
    }

    /// Creates an `ImageNotFound` error.
    pub fn image_not_found(image: impl Into<String>) -> Self {
        Self::ImageNotFound {
            image: image.into(),
        }
    }

    /// Creates a `Timeout` error from a `Duration`.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout }
    }

    /// Creates a `ContainerUnhealthy` error.
    pub fn container_unhealthy(message: impl Into<String>) -> Self {
        Self::ContainerUnhealthy {
            message: message.into(),
        }
    }

    /// Creates a `ProvisionFailed` error.
    pub fn provision_failed(message: impl Into<String>) -> Self {
        Self::ProvisionFailed {
            message: message.into(),
        }
    }

    /// Creates a `ContainerFailed` error.
    pub fn container_failed(message: impl Into<String>) -> Self {
        Self::ContainerFailed {
            message: message.into(),
        }
    }

    /// Creates a `SpawnFailed` error.
    pub fn spawn_failed(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::SpawnFailed {
            program: program.into(),
            source,
        }
    }

    /// Creates a `RuntimeUnavailable` error.
    pub fn runtime_unavailable(message: impl Into<String>) -> Self {
        Self::RuntimeUnavailable {
            message: message.into(),
        }
    }

    /// Creates a `WorkerFailed` error.
    pub fn worker_failed(message: impl Into<String>) -> Self {
        Self::WorkerFailed {
            message: message.into(),
        }
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if this is a Docker unavailability error.
    pub fn is_docker_unavailable(&self) -> bool {
        matches!(self, Self::DockerUnavailable { .. })
    }

    /// Returns true if this is an image not found error.
    pub fn is_image_not_found(&self) -> bool {
        matches!(self, Self::ImageNotFound { .. })
    }
}
