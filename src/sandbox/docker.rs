use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    KillContainerOptions, ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::service::HostConfig;
use bollard::Docker;
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::artifact::ARTIFACT_FILE;
use super::warm::{DockerWarmDriver, WarmManager};
use super::{Artifact, Backend, BackendKind, CappedOutput, RawOutput, SandboxError};
use crate::config::Config;
use crate::submission::Submission;
use crate::validator::imported_modules;

/// Label attached to every container the engine creates.
pub const MANAGED_LABEL: &str = "execbox.managed";

/// Prefix of every container name the engine creates.
pub(crate) const CONTAINER_PREFIX: &str = "execbox-";

/// Mount point of the artifact directory inside fresh containers.
const APP_DIR: &str = "/app";

/// Runs each submission in a disposable container, or in the warm
/// environment when it imports heavy packages.
pub struct ContainerBackend {
    docker: Docker,
    config: Config,
    image_ready: OnceCell<()>,
    warm: Option<WarmManager<DockerWarmDriver>>,
}

impl ContainerBackend {
    /// Connects to the local Docker daemon.
    pub fn connect(config: &Config) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::docker_unavailable(e.to_string()))?;

        let warm = config.warm.enabled.then(|| {
            WarmManager::new(
                DockerWarmDriver::new(docker.clone(), config),
                &config.warm,
            )
        });

        Ok(Self {
            docker,
            config: config.clone(),
            image_ready: OnceCell::new(),
            warm,
        })
    }

    /// Removes every managed container left behind by a previous run.
    ///
    /// Returns the number of containers removed.
    pub async fn cleanup_orphaned(&self) -> Result<u32, SandboxError> {
        let filters = HashMap::from([("label".to_string(), vec![MANAGED_LABEL.to_string()])]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| docker_failure("list containers", &e))?;

        let mut removed = 0;
        for container in containers {
            let Some(id) = container.id else { continue };
            debug!("Removing orphaned container {}", id);
            remove_container(&self.docker, &id).await;
            removed += 1;
        }

        if removed > 0 {
            info!("Removed {} orphaned container(s)", removed);
        }
        Ok(removed)
    }

    async fn run_fresh(
        &self,
        submission: &Submission,
        artifact: &Artifact,
        timeout: Duration,
    ) -> Result<RawOutput, SandboxError> {
        let image = &self.config.container.image;
        self.image_ready
            .get_or_try_init(|| {
                ensure_image(&self.docker, image, self.config.container.pull_missing)
            })
            .await?;

        let container_name = format!("{CONTAINER_PREFIX}{}", submission.short_id());
        let container_config = self.build_container_config(artifact)?;

        debug!("Creating container: {}", container_name);
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| docker_failure("create container", &e))?;

        let guard = ContainerGuard::new(self.docker.clone(), container_name.clone());
        let outcome = self.start_and_wait(&container_name, timeout).await;

        debug!("Removing container {}", container_name);
        guard.remove().await;

        outcome
    }

    fn build_container_config(&self, artifact: &Artifact) -> Result<ContainerConfig<String>, SandboxError> {
        let container = &self.config.container;

        let host_dir = artifact
            .dir()
            .to_str()
            .ok_or_else(|| SandboxError::container_failed("Invalid artifact path"))?;

        let mut cmd = container.command.clone();
        cmd.push(format!("{APP_DIR}/{ARTIFACT_FILE}"));

        let memory = parse_memory_limit(&container.memory)?;
        let cpus = container.cpus.parse::<f64>().unwrap_or(1.0);
        #[allow(clippy::cast_possible_truncation)]
        let nano_cpus = (cpus * 1_000_000_000.0) as i64;

        Ok(ContainerConfig {
            image: Some(container.image.clone()),
            cmd: Some(cmd),
            working_dir: Some(APP_DIR.to_string()),
            user: Some(container.user.clone()),
            network_disabled: Some(true),
            labels: Some(HashMap::from([(
                MANAGED_LABEL.to_string(),
                "true".to_string(),
            )])),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{host_dir}:{APP_DIR}:ro")]),
                memory: Some(memory),
                memory_swap: Some(memory),
                nano_cpus: Some(nano_cpus),
                pids_limit: Some(container.pids_limit),
                network_mode: Some("none".to_string()),
                readonly_rootfs: Some(true),
                tmpfs: Some(HashMap::from([(
                    "/tmp".to_string(),
                    "rw,noexec,nosuid,size=16m".to_string(),
                )])),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn start_and_wait(&self, name: &str, timeout: Duration) -> Result<RawOutput, SandboxError> {
        self.docker
            .start_container::<String>(name, None)
            .await
            .map_err(|e| docker_failure("start container", &e))?;

        let mut wait = self
            .docker
            .wait_container(name, None::<WaitContainerOptions<String>>);

        let exit_code = match tokio::time::timeout(timeout, wait.next()).await {
            Err(_) => {
                warn!("Container {} timed out after {:?}, killing", name, timeout);
                let _ = self
                    .docker
                    .kill_container(name, None::<KillContainerOptions<String>>)
                    .await;
                return Err(SandboxError::timeout(timeout));
            }
            Ok(Some(Ok(response))) => response.status_code,
            // bollard reports a nonzero exit as a wait error carrying the code
            Ok(Some(Err(DockerError::DockerContainerWaitError { code, .. }))) => code,
            Ok(Some(Err(e))) => return Err(docker_failure("wait for container", &e)),
            Ok(None) => {
                return Err(SandboxError::container_failed(
                    "Container wait stream ended unexpectedly",
                ))
            }
        };

        let logs = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        let (stdout, mut stderr) = drain_output(logs, self.config.engine.max_output_bytes).await?;

        if exit_code != 0 && self.was_oom_killed(name).await {
            stderr.push_str("\nKilled: memory limit exceeded\n");
        }

        Ok(RawOutput::from_streams(stdout, stderr, exit_code))
    }

    async fn was_oom_killed(&self, name: &str) -> bool {
        self.docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .ok()
            .and_then(|info| info.state)
            .and_then(|state| state.oom_killed)
            .unwrap_or(false)
    }
}

#[async_trait]
impl Backend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn prepare(&self, submission: &Submission) -> Result<(), SandboxError> {
        if let Some(warm) = &self.warm {
            let required = warm.required_packages(&imported_modules(submission.code()));
            if !required.is_empty() {
                debug!("Preparing warm environment for {}", submission.id());
                warm.prepare(&required).await?;
            }
        }
        Ok(())
    }

    async fn run(&self, submission: &Submission, timeout: Duration) -> Result<RawOutput, SandboxError> {
        let artifact = Artifact::materialize(submission)?;

        if let Some(warm) = &self.warm {
            let required = warm.required_packages(&imported_modules(submission.code()));
            if !required.is_empty() {
                debug!("Routing {} to warm environment", submission.id());
                return warm.run(&required, &artifact, timeout).await;
            }
        }

        self.run_fresh(submission, &artifact, timeout).await
    }

    async fn shutdown(&self) {
        if let Some(warm) = &self.warm {
            warm.shutdown().await;
        }
    }
}

/// Force-removes a container when dropped, unless [`ContainerGuard::remove`]
/// already did.
///
/// Covers the path where the future running a submission is cancelled before
/// it reaches its own cleanup.
pub(crate) struct ContainerGuard {
    docker: Docker,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    pub(crate) fn new(docker: Docker, name: String) -> Self {
        Self {
            docker,
            name,
            armed: true,
        }
    }

    pub(crate) async fn remove(mut self) {
        self.armed = false;
        remove_container(&self.docker, &self.name).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let docker = self.docker.clone();
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Scheduling removal of abandoned container {}", name);
                handle.spawn(async move { remove_container(&docker, &name).await });
            }
            Err(_) => warn!("No runtime to remove container {}; it may leak", name),
        }
    }
}

/// Kills and removes a container, logging instead of failing.
pub(crate) async fn remove_container(docker: &Docker, name: &str) {
    if let Err(e) = docker
        .remove_container(
            name,
            Some(RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            }),
        )
        .await
    {
        if !is_not_found(&e) {
            warn!("Failed to remove container {}: {}", name, e);
        }
    }
}

/// Makes sure `image` exists locally, pulling it if allowed.
pub(crate) async fn ensure_image(docker: &Docker, image: &str, pull_missing: bool) -> Result<(), SandboxError> {
    match docker.inspect_image(image).await {
        Ok(_) => return Ok(()),
        Err(e) if is_not_found(&e) => {}
        Err(e) => return Err(docker_failure("inspect image", &e)),
    }

    if !pull_missing {
        return Err(SandboxError::image_not_found(image));
    }

    info!("Pulling Docker image: {}", image);
    let mut stream = docker.create_image(
        Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        }),
        None,
        None,
    );

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(info) => {
                if let Some(error) = info.error {
                    warn!("Docker pull error: {}", error);
                    return Err(SandboxError::image_not_found(image));
                }
            }
            Err(e) => {
                warn!("Error pulling image {}: {}", image, e);
                return Err(SandboxError::image_not_found(image));
            }
        }
    }

    info!("Image pulled: {}", image);
    Ok(())
}

/// Collects a multiplexed Docker output stream into capped stdout/stderr.
pub(crate) async fn drain_output<S>(
    stream: S,
    limit: usize,
) -> Result<(CappedOutput, CappedOutput), SandboxError>
where
    S: Stream<Item = Result<LogOutput, DockerError>>,
{
    futures_util::pin_mut!(stream);
    let mut stdout = CappedOutput::new(limit);
    let mut stderr = CappedOutput::new(limit);

    while let Some(chunk) = stream.next().await {
        match chunk.map_err(|e| docker_failure("read output", &e))? {
            LogOutput::StdOut { message } | LogOutput::Console { message } => stdout.push(&message),
            LogOutput::StdErr { message } => stderr.push(&message),
            LogOutput::StdIn { .. } => {}
        }
    }

    Ok((stdout, stderr))
}

pub(crate) fn docker_failure(action: &str, err: &DockerError) -> SandboxError {
    SandboxError::container_failed(format!("Failed to {action}: {err}"))
}

pub(crate) fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Parse memory limit string (e.g., "1g", "100m") to bytes
pub(crate) fn parse_memory_limit(limit: &str) -> Result<i64, SandboxError> {
    let limit = limit.trim().to_lowercase();
    let invalid = || SandboxError::container_failed(format!("Invalid memory limit: {limit}"));

    let (digits, unit) = if let Some(num) = limit.strip_suffix('g') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        (num, 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('k') {
        (num, 1024)
    } else {
        (limit.as_str(), 1)
    };

    let value: i64 = digits.parse().map_err(|_| invalid())?;
    value
        .checked_mul(unit)
        .filter(|bytes| *bytes >= 0)
        .ok_or_else(invalid)
}
