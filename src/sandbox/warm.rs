//! Long-lived container for snippets that import heavy packages.
//!
//! Installing numpy or pandas per submission is too slow, so one container is
//! provisioned with them and reused. At most one environment exists at a
//! time, and every use of it holds the manager's lock for the whole
//! copy/run/collect cycle so two submissions never run inside it together.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::network::DisconnectNetworkOptions;
use bollard::service::HostConfig;
use bollard::Docker;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::docker::{
    docker_failure, drain_output, ensure_image, parse_memory_limit, remove_container,
    CONTAINER_PREFIX, MANAGED_LABEL,
};
use super::{Artifact, RawOutput, SandboxError};
use crate::config::{Config, WarmConfig};

/// Directory inside the warm container that receives artifacts.
const WARM_WORK_DIR: &str = "/tmp";

/// Bound on `pip install` while provisioning.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Bound on a single liveness probe.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of the warm environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// Created, not yet answering liveness checks.
    Initializing,
    /// Answering liveness checks; safe to run submissions.
    Ready,
    /// Failed a check or an execution; rebuilt on next use.
    Unhealthy,
}

/// Operations the manager needs from a container runtime.
#[async_trait]
pub trait WarmDriver: Send + Sync {
    /// Creates and starts an environment, returning its handle.
    async fn create(&self) -> Result<String, SandboxError>;

    /// Installs packages into a running environment.
    async fn install(&self, handle: &str, packages: &BTreeSet<String>) -> Result<(), SandboxError>;

    /// Returns true if the environment is running and its interpreter answers.
    async fn is_alive(&self, handle: &str) -> bool;

    /// Copies the artifact in, runs it, collects its output and removes it.
    async fn exec(
        &self,
        handle: &str,
        artifact: &Artifact,
        timeout: Duration,
    ) -> Result<RawOutput, SandboxError>;

    /// Destroys the environment. Never fails; problems are logged.
    async fn destroy(&self, handle: &str);
}

#[derive(Debug)]
struct WarmEnvironment {
    handle: String,
    installed_packages: BTreeSet<String>,
    health: Health,
}

type Slot = OwnedMutexGuard<Option<WarmEnvironment>>;

/// Owns the single warm environment and serializes access to it.
pub struct WarmManager<D> {
    driver: Arc<D>,
    packages: BTreeMap<String, String>,
    health_retries: u32,
    health_backoff: Duration,
    env: Arc<Mutex<Option<WarmEnvironment>>>,
}

impl<D: WarmDriver + 'static> WarmManager<D> {
    /// Creates a manager. Nothing is provisioned until first use.
    pub fn new(driver: D, config: &WarmConfig) -> Self {
        Self {
            driver: Arc::new(driver),
            packages: config.packages.clone(),
            health_retries: config.health_retries,
            health_backoff: Duration::from_millis(config.health_backoff_ms),
            env: Arc::new(Mutex::new(None)),
        }
    }

    /// Installable package names for the heavy modules among `modules`.
    pub fn required_packages(&self, modules: &BTreeSet<String>) -> BTreeSet<String> {
        modules
            .iter()
            .filter_map(|module| self.packages.get(module).cloned())
            .collect()
    }

    /// Health of the current environment, or `None` if none exists.
    pub async fn health(&self) -> Option<Health> {
        self.env.lock().await.as_ref().map(|env| env.health)
    }

    /// Makes sure an environment with `required` installed is ready,
    /// provisioning or rebuilding it if needed.
    ///
    /// Callers use this before starting a submission's clock so package
    /// installation is not charged to the snippet.
    pub async fn prepare(&self, required: &BTreeSet<String>) -> Result<(), SandboxError> {
        self.ensure_ready(required).await.map(drop)
    }

    /// Runs an artifact inside the warm environment, provisioning or
    /// rebuilding it first if needed.
    pub async fn run(
        &self,
        required: &BTreeSet<String>,
        artifact: &Artifact,
        timeout: Duration,
    ) -> Result<RawOutput, SandboxError> {
        let (mut slot, handle) = self.ensure_ready(required).await?;

        match self.driver.exec(&handle, artifact, timeout).await {
            Ok(output) => Ok(output),
            Err(e) if e.is_timeout() => {
                // An exec cannot be killed on its own; the environment goes.
                warn!("Warm execution timed out, tearing down {}", handle);
                if let Some(env) = slot.take() {
                    self.driver.destroy(&env.handle).await;
                }
                Err(e)
            }
            Err(e) => {
                if let Some(env) = slot.as_mut() {
                    env.health = Health::Unhealthy;
                }
                if self.driver.is_alive(&handle).await {
                    Err(e)
                } else {
                    warn!("Warm environment {} stopped answering after: {}", handle, e);
                    Err(SandboxError::container_unhealthy(format!(
                        "{handle} failed its liveness check after: {e}"
                    )))
                }
            }
        }
    }

    /// Tears the environment down. Called on service shutdown.
    pub async fn shutdown(&self) {
        if let Some(env) = self.env.lock().await.take() {
            info!("Shutting down warm environment {}", env.handle);
            self.driver.destroy(&env.handle).await;
        }
    }

    /// Locks the slot and returns it holding a ready environment that
    /// covers `required`.
    async fn ensure_ready(&self, required: &BTreeSet<String>) -> Result<(Slot, String), SandboxError> {
        let slot = Arc::clone(&self.env).lock_owned().await;
        let mut packages = required.clone();

        if let Some(env) = slot.as_ref() {
            let covers = required.is_subset(&env.installed_packages);
            if env.health == Health::Ready && covers && self.driver.is_alive(&env.handle).await {
                let handle = env.handle.clone();
                return Ok((slot, handle));
            }
            info!(
                "Rebuilding warm environment {} (health: {:?}, packages covered: {})",
                env.handle, env.health, covers
            );
            packages.extend(env.installed_packages.iter().cloned());
        }

        // The task owns the lock and finishes even if this caller is dropped,
        // so a half-built environment always lands in the slot or is destroyed.
        let task = tokio::spawn(provision(
            Arc::clone(&self.driver),
            slot,
            packages,
            self.health_retries,
            self.health_backoff,
        ));
        task.await
            .map_err(|e| SandboxError::provision_failed(format!("provisioning task failed: {e}")))?
    }
}

/// Replaces whatever is in `slot` with a fresh environment holding `packages`.
async fn provision<D: WarmDriver + 'static>(
    driver: Arc<D>,
    mut slot: Slot,
    packages: BTreeSet<String>,
    health_retries: u32,
    health_backoff: Duration,
) -> Result<(Slot, String), SandboxError> {
    if let Some(old) = slot.take() {
        driver.destroy(&old.handle).await;
    }

    let handle = driver.create().await.map_err(into_provision_failure)?;
    let pending = PendingEnvironment::new(Arc::clone(&driver), handle);
    info!("Provisioning warm environment {}", pending.handle());

    if let Err(e) = await_alive(&*driver, pending.handle(), health_retries, health_backoff).await {
        pending.destroy().await;
        return Err(e);
    }

    if !packages.is_empty() {
        if let Err(e) = driver.install(pending.handle(), &packages).await {
            pending.destroy().await;
            return Err(into_provision_failure(e));
        }
    }

    let handle = pending.keep();
    info!("Warm environment {} ready with {:?}", handle, packages);
    *slot = Some(WarmEnvironment {
        handle: handle.clone(),
        installed_packages: packages,
        health: Health::Ready,
    });
    Ok((slot, handle))
}

async fn await_alive<D: WarmDriver>(
    driver: &D,
    handle: &str,
    retries: u32,
    mut backoff: Duration,
) -> Result<(), SandboxError> {
    for attempt in 1..=retries {
        if driver.is_alive(handle).await {
            return Ok(());
        }
        debug!(
            "Warm environment {} not alive (attempt {}/{}), retrying in {:?}",
            handle, attempt, retries, backoff
        );
        tokio::time::sleep(backoff).await;
        backoff *= 2;
    }
    Err(SandboxError::provision_failed(format!(
        "{handle} did not pass a liveness check after {retries} attempts"
    )))
}

fn into_provision_failure(err: SandboxError) -> SandboxError {
    match err {
        SandboxError::ProvisionFailed { .. } => err,
        other => SandboxError::provision_failed(other.to_string()),
    }
}

/// A created environment that has not reached the slot yet. Destroyed on
/// drop unless [`PendingEnvironment::keep`] or
/// [`PendingEnvironment::destroy`] consumed it.
struct PendingEnvironment<D: WarmDriver + 'static> {
    driver: Arc<D>,
    handle: Option<String>,
}

impl<D: WarmDriver + 'static> PendingEnvironment<D> {
    fn new(driver: Arc<D>, handle: String) -> Self {
        Self {
            driver,
            handle: Some(handle),
        }
    }

    fn handle(&self) -> &str {
        self.handle.as_deref().unwrap_or_default()
    }

    fn keep(mut self) -> String {
        self.handle.take().unwrap_or_default()
    }

    async fn destroy(mut self) {
        if let Some(handle) = self.handle.take() {
            self.driver.destroy(&handle).await;
        }
    }
}

impl<D: WarmDriver + 'static> Drop for PendingEnvironment<D> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let driver = Arc::clone(&self.driver);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Scheduling teardown of abandoned warm environment {}", handle);
                runtime.spawn(async move { driver.destroy(&handle).await });
            }
            Err(_) => warn!("No runtime to destroy warm environment {}; it may leak", handle),
        }
    }
}

/// [`WarmDriver`] backed by the local Docker daemon.
pub struct DockerWarmDriver {
    docker: Docker,
    image: String,
    memory: String,
    install: bool,
    user: String,
    pull_missing: bool,
    max_output_bytes: usize,
}

impl DockerWarmDriver {
    /// Creates a driver from engine configuration.
    pub fn new(docker: Docker, config: &Config) -> Self {
        Self {
            docker,
            image: config.warm.image.clone(),
            memory: config.warm.memory.clone(),
            install: config.warm.install,
            user: config.container.user.clone(),
            pull_missing: config.container.pull_missing,
            max_output_bytes: config.engine.max_output_bytes,
        }
    }

    async fn exec_collect(
        &self,
        handle: &str,
        cmd: Vec<String>,
        user: &str,
        timeout: Duration,
    ) -> Result<RawOutput, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                handle,
                CreateExecOptions {
                    cmd: Some(cmd),
                    user: Some(user.to_string()),
                    working_dir: Some(WARM_WORK_DIR.to_string()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| docker_failure("create exec", &e))?;

        let StartExecResults::Attached { output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| docker_failure("start exec", &e))?
        else {
            return Err(SandboxError::container_failed("Exec started detached"));
        };

        let (stdout, stderr) = tokio::time::timeout(timeout, drain_output(output, self.max_output_bytes))
            .await
            .map_err(|_| SandboxError::timeout(timeout))??;

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| docker_failure("inspect exec", &e))?;

        Ok(RawOutput::from_streams(
            stdout,
            stderr,
            inspect.exit_code.unwrap_or(-1),
        ))
    }
}

#[async_trait]
impl WarmDriver for DockerWarmDriver {
    async fn create(&self) -> Result<String, SandboxError> {
        ensure_image(&self.docker, &self.image, self.pull_missing).await?;

        let name = format!(
            "{CONTAINER_PREFIX}warm-{}",
            uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
        );
        let memory = parse_memory_limit(&self.memory)?;

        // Network stays up only long enough for pip; see `install`.
        let network_mode = if self.install { "bridge" } else { "none" };

        let config = ContainerConfig {
            image: Some(self.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(WARM_WORK_DIR.to_string()),
            labels: Some(HashMap::from([(
                MANAGED_LABEL.to_string(),
                "warm".to_string(),
            )])),
            host_config: Some(HostConfig {
                memory: Some(memory),
                memory_swap: Some(memory),
                pids_limit: Some(256),
                network_mode: Some(network_mode.to_string()),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| docker_failure("create warm container", &e))?;

        if let Err(e) = self.docker.start_container::<String>(&name, None).await {
            remove_container(&self.docker, &name).await;
            return Err(docker_failure("start warm container", &e));
        }

        Ok(name)
    }

    async fn install(&self, handle: &str, packages: &BTreeSet<String>) -> Result<(), SandboxError> {
        if self.install {
            info!("Installing {:?} into {}", packages, handle);
            let mut cmd: Vec<String> = ["pip", "install", "--no-cache-dir", "--quiet"]
                .iter()
                .map(ToString::to_string)
                .collect();
            cmd.extend(packages.iter().cloned());

            let output = self.exec_collect(handle, cmd, "root", INSTALL_TIMEOUT).await?;
            if output.exit_code != 0 {
                return Err(SandboxError::provision_failed(format!(
                    "pip install exited with {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                )));
            }

            self.docker
                .disconnect_network(
                    "bridge",
                    DisconnectNetworkOptions {
                        container: handle,
                        force: true,
                    },
                )
                .await
                .map_err(|e| docker_failure("disconnect warm container from network", &e))?;
        }
        Ok(())
    }

    async fn is_alive(&self, handle: &str) -> bool {
        let running = self
            .docker
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
            .ok()
            .and_then(|info| info.state)
            .and_then(|state| state.running)
            .unwrap_or(false);
        if !running {
            return false;
        }

        let cmd = vec!["python".to_string(), "-c".to_string(), "pass".to_string()];
        matches!(
            self.exec_collect(handle, cmd, &self.user, LIVENESS_TIMEOUT).await,
            Ok(output) if output.exit_code == 0
        )
    }

    async fn exec(
        &self,
        handle: &str,
        artifact: &Artifact,
        timeout: Duration,
    ) -> Result<RawOutput, SandboxError> {
        self.docker
            .upload_to_container(
                handle,
                Some(UploadToContainerOptions {
                    path: WARM_WORK_DIR,
                    ..Default::default()
                }),
                artifact.to_tar()?,
            )
            .await
            .map_err(|e| docker_failure("copy artifact into warm container", &e))?;

        let target = format!("{WARM_WORK_DIR}/{}", artifact.unique_name());
        let cmd = vec!["python".to_string(), "-u".to_string(), target.clone()];
        let outcome = self.exec_collect(handle, cmd, &self.user, timeout).await;

        if !outcome.as_ref().is_err_and(SandboxError::is_timeout) {
            let cleanup = vec!["rm".to_string(), "-f".to_string(), target];
            if let Err(e) = self.exec_collect(handle, cleanup, "root", LIVENESS_TIMEOUT).await {
                warn!("Failed to remove artifact from {}: {}", handle, e);
            }
        }

        outcome
    }

    async fn destroy(&self, handle: &str) {
        debug!("Destroying warm environment {}", handle);
        remove_container(&self.docker, handle).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submission::Submission;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    /// Simulates one shared container: every exec writes into the same
    /// output buffer, so unserialized execs would interleave.
    #[derive(Default)]
    struct FakeDriver {
        created: AtomicUsize,
        destroyed: AtomicUsize,
        installs: StdMutex<Vec<BTreeSet<String>>>,
        alive: AtomicBool,
        never_alive: bool,
        hang: AtomicBool,
        fail_exec: AtomicBool,
        install_delay: Duration,
        fail_install: bool,
        shared_stdout: StdMutex<String>,
    }

    impl FakeDriver {
        fn healthy() -> Self {
            Self {
                alive: AtomicBool::new(true),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl WarmDriver for Arc<FakeDriver> {
        async fn create(&self) -> Result<String, SandboxError> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            if !self.never_alive {
                self.alive.store(true, Ordering::SeqCst);
            }
            Ok(format!("fake-{n}"))
        }

        async fn install(&self, _handle: &str, packages: &BTreeSet<String>) -> Result<(), SandboxError> {
            tokio::time::sleep(self.install_delay).await;
            if self.fail_install {
                return Err(SandboxError::container_failed("pip install exited with 1"));
            }
            self.installs.lock().unwrap().push(packages.clone());
            Ok(())
        }

        async fn is_alive(&self, _handle: &str) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn exec(
            &self,
            _handle: &str,
            artifact: &Artifact,
            timeout: Duration,
        ) -> Result<RawOutput, SandboxError> {
            if self.hang.load(Ordering::SeqCst) {
                tokio::time::sleep(timeout).await;
                return Err(SandboxError::timeout(timeout));
            }
            if self.fail_exec.load(Ordering::SeqCst) {
                // The container died underneath the exec.
                self.alive.store(false, Ordering::SeqCst);
                return Err(SandboxError::container_failed("exec stream closed"));
            }
            let code = std::fs::read_to_string(artifact.path())?;
            for line in code.lines() {
                self.shared_stdout.lock().unwrap().push_str(line);
                self.shared_stdout.lock().unwrap().push('\n');
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            let stdout = std::mem::take(&mut *self.shared_stdout.lock().unwrap());
            Ok(RawOutput {
                stdout,
                ..Default::default()
            })
        }

        async fn destroy(&self, _handle: &str) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager(driver: &Arc<FakeDriver>) -> WarmManager<Arc<FakeDriver>> {
        let config = WarmConfig {
            health_retries: 3,
            health_backoff_ms: 1,
            ..Default::default()
        };
        WarmManager::new(Arc::clone(driver), &config)
    }

    fn numpy() -> BTreeSet<String> {
        BTreeSet::from(["numpy".to_string()])
    }

    #[test]
    fn test_required_packages_maps_import_names() {
        let driver = Arc::new(FakeDriver::healthy());
        let manager = manager(&driver);
        let modules: BTreeSet<String> = ["math", "sklearn", "numpy"]
            .into_iter()
            .map(String::from)
            .collect();
        let required = manager.required_packages(&modules);
        assert_eq!(
            required,
            BTreeSet::from(["numpy".to_string(), "scikit-learn".to_string()])
        );
    }

    #[tokio::test]
    async fn test_provisions_lazily_and_reuses() {
        let driver = Arc::new(FakeDriver::healthy());
        let manager = manager(&driver);
        assert_eq!(manager.health().await, None);

        let artifact = Artifact::materialize(&Submission::new("a")).unwrap();
        manager
            .run(&numpy(), &artifact, Duration::from_secs(5))
            .await
            .unwrap();
        manager
            .run(&numpy(), &artifact, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(driver.created.load(Ordering::SeqCst), 1);
        assert_eq!(driver.installs.lock().unwrap().len(), 1);
        assert_eq!(manager.health().await, Some(Health::Ready));
    }

    #[tokio::test]
    async fn test_unhealthy_environment_is_rebuilt() {
        let driver = Arc::new(FakeDriver::healthy());
        let manager = manager(&driver);
        let artifact = Artifact::materialize(&Submission::new("a")).unwrap();

        manager
            .run(&numpy(), &artifact, Duration::from_secs(5))
            .await
            .unwrap();
        // Container died between submissions; create() revives it.
        driver.alive.store(false, Ordering::SeqCst);
        manager
            .run(&numpy(), &artifact, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(driver.created.load(Ordering::SeqCst), 2);
        assert_eq!(driver.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_package_rebuilds_with_union() {
        let driver = Arc::new(FakeDriver::healthy());
        let manager = manager(&driver);
        let artifact = Artifact::materialize(&Submission::new("a")).unwrap();

        manager
            .run(&numpy(), &artifact, Duration::from_secs(5))
            .await
            .unwrap();
        let pandas = BTreeSet::from(["pandas".to_string()]);
        manager
            .run(&pandas, &artifact, Duration::from_secs(5))
            .await
            .unwrap();

        let installs = driver.installs.lock().unwrap();
        assert_eq!(installs.len(), 2);
        assert_eq!(
            installs[1],
            BTreeSet::from(["numpy".to_string(), "pandas".to_string()])
        );
    }

    #[tokio::test]
    async fn test_provisioning_failure_discards_environment() {
        let driver = Arc::new(FakeDriver {
            never_alive: true,
            ..Default::default()
        });
        let manager = manager(&driver);
        let artifact = Artifact::materialize(&Submission::new("a")).unwrap();

        let result = manager
            .run(&numpy(), &artifact, Duration::from_secs(5))
            .await;

        assert!(matches!(result, Err(SandboxError::ProvisionFailed { .. })));
        assert_eq!(driver.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.health().await, None);
    }

    #[tokio::test]
    async fn test_timeout_tears_environment_down() {
        let driver = Arc::new(FakeDriver::healthy());
        let manager = manager(&driver);
        let artifact = Artifact::materialize(&Submission::new("a")).unwrap();

        driver.hang.store(true, Ordering::SeqCst);
        let result = manager
            .run(&numpy(), &artifact, Duration::from_millis(20))
            .await;

        assert!(result.unwrap_err().is_timeout());
        assert_eq!(driver.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.health().await, None);
    }

    #[tokio::test]
    async fn test_concurrent_runs_do_not_interleave() {
        let driver = Arc::new(FakeDriver::healthy());
        let manager = Arc::new(manager(&driver));

        let first_code = "a1\na2\na3\na4\na5";
        let second_code = "b1\nb2\nb3\nb4\nb5";
        let first = Artifact::materialize(&Submission::new(first_code)).unwrap();
        let second = Artifact::materialize(&Submission::new(second_code)).unwrap();

        let required = numpy();
        let (r1, r2) = tokio::join!(
            manager.run(&required, &first, Duration::from_secs(5)),
            manager.run(&required, &second, Duration::from_secs(5)),
        );

        assert_eq!(r1.unwrap().stdout, format!("{first_code}\n"));
        assert_eq!(r2.unwrap().stdout, format!("{second_code}\n"));
        assert_eq!(driver.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_prepare_provisions_before_run() {
        let driver = Arc::new(FakeDriver::healthy());
        let manager = manager(&driver);
        let artifact = Artifact::materialize(&Submission::new("a")).unwrap();

        manager.prepare(&numpy()).await.unwrap();
        assert_eq!(manager.health().await, Some(Health::Ready));

        manager
            .run(&numpy(), &artifact, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(driver.created.load(Ordering::SeqCst), 1);
        assert_eq!(driver.installs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_orphan_environment() {
        let driver = Arc::new(FakeDriver {
            install_delay: Duration::from_millis(300),
            ..FakeDriver::healthy()
        });
        let manager = manager(&driver);
        let artifact = Artifact::materialize(&Submission::new("a")).unwrap();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(30),
            manager.run(&numpy(), &artifact, Duration::from_secs(5)),
        )
        .await;
        assert!(cancelled.is_err());

        // Waits for the detached provisioning to release the lock.
        assert_eq!(manager.health().await, Some(Health::Ready));
        assert_eq!(driver.created.load(Ordering::SeqCst), 1);
        assert_eq!(driver.destroyed.load(Ordering::SeqCst), 0);

        manager.shutdown().await;
        assert_eq!(driver.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_caller_failed_install_destroys_environment() {
        let driver = Arc::new(FakeDriver {
            install_delay: Duration::from_millis(100),
            fail_install: true,
            ..FakeDriver::healthy()
        });
        let manager = manager(&driver);
        let artifact = Artifact::materialize(&Submission::new("a")).unwrap();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            manager.run(&numpy(), &artifact, Duration::from_secs(5)),
        )
        .await;
        assert!(cancelled.is_err());

        assert_eq!(manager.health().await, None);
        assert_eq!(driver.created.load(Ordering::SeqCst), 1);
        assert_eq!(driver.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_install_failure_is_provision_failure() {
        let driver = Arc::new(FakeDriver {
            fail_install: true,
            ..FakeDriver::healthy()
        });
        let manager = manager(&driver);

        let err = manager.prepare(&numpy()).await.unwrap_err();
        assert!(matches!(err, SandboxError::ProvisionFailed { .. }));
        assert_eq!(
            err.to_string(),
            "Warm environment provisioning failed: Container operation failed: pip install exited with 1"
        );
        assert_eq!(driver.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dead_environment_after_failed_exec_is_unhealthy() {
        let driver = Arc::new(FakeDriver::healthy());
        let manager = manager(&driver);
        let artifact = Artifact::materialize(&Submission::new("a")).unwrap();

        driver.fail_exec.store(true, Ordering::SeqCst);
        let err = manager
            .run(&numpy(), &artifact, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::ContainerUnhealthy { .. }));
        assert_eq!(manager.health().await, Some(Health::Unhealthy));

        // The next run rebuilds.
        driver.fail_exec.store(false, Ordering::SeqCst);
        manager
            .run(&numpy(), &artifact, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(driver.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_destroys_environment() {
        let driver = Arc::new(FakeDriver::healthy());
        let manager = manager(&driver);
        let artifact = Artifact::materialize(&Submission::new("a")).unwrap();

        manager
            .run(&numpy(), &artifact, Duration::from_secs(5))
            .await
            .unwrap();
        manager.shutdown().await;
        manager.shutdown().await;

        assert_eq!(driver.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.health().await, None);
    }
}
