//! Executor adapter running jobs on pool machines.
//!
//! [`MachineExecutorProvider`] wraps the provider of the executor that runs
//! the job (for example plain Docker) and points it at a machine taken from
//! the [`MachinePoolManager`]. Providers are looked up by executor name in an
//! explicit [`ProviderRegistry`] built at startup.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::{JobConfig, RunnerConfig};
use crate::provider::{MachineLease, MachinePoolManager};

pub const STAGE_USE_MACHINE: &str = "docker_machine_use_machine";
pub const STAGE_RELEASE_MACHINE: &str = "docker_machine_release_machine";

/// Capabilities advertised by an executor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeaturesInfo {
    pub variables: bool,
    pub image: bool,
    pub services: bool,
    pub artifacts: bool,
    pub cache: bool,
    pub shared: bool,
    pub session: bool,
    pub terminal: bool,
}

/// Per-build state shared between the job loop and its executor.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    pub id: u64,
    /// Host the build runs on, set during prepare
    pub hostname: String,
    /// Machine pre-claimed by `acquire` before the build started
    pub machine: Option<MachineLease>,
}

/// One step of a job script.
#[derive(Debug, Clone, Default)]
pub struct ExecutorCommand {
    pub script: String,
    /// Runs in the helper container rather than the build image
    pub predefined: bool,
}

/// Runs a single build.
#[async_trait]
pub trait Executor: Send {
    async fn prepare(&mut self, job: &JobConfig, build: &mut BuildContext) -> Result<()>;

    async fn run(&mut self, command: ExecutorCommand) -> Result<()>;

    fn finish(&mut self, error: Option<&anyhow::Error>);

    async fn cleanup(&mut self);

    fn current_stage(&self) -> String;

    fn set_current_stage(&mut self, stage: &str);
}

/// Factory and capability description for one executor name.
#[async_trait]
pub trait ExecutorProvider: Send + Sync {
    fn can_create(&self) -> bool;

    fn features(&self) -> FeaturesInfo;

    fn default_shell(&self) -> String;

    fn create(&self) -> Option<Box<dyn Executor>>;

    /// Reserve capacity before a job is requested
    async fn acquire(&self, _runner: &RunnerConfig) -> Result<Option<MachineLease>> {
        Ok(None)
    }

    /// Give back whatever `acquire` returned
    fn release(&self, _runner: &RunnerConfig, _lease: &MachineLease) {}
}

/// Provider for `<executor>+machine` executors.
pub struct MachineExecutorProvider {
    pool: Arc<MachinePoolManager>,
    inner: Arc<dyn ExecutorProvider>,
}

impl std::fmt::Debug for MachineExecutorProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineExecutorProvider")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl MachineExecutorProvider {
    pub fn new(pool: Arc<MachinePoolManager>, inner: Arc<dyn ExecutorProvider>) -> Self {
        Self { pool, inner }
    }

    pub fn pool(&self) -> &Arc<MachinePoolManager> {
        &self.pool
    }
}

#[async_trait]
impl ExecutorProvider for MachineExecutorProvider {
    fn can_create(&self) -> bool {
        self.inner.can_create()
    }

    fn features(&self) -> FeaturesInfo {
        self.inner.features()
    }

    fn default_shell(&self) -> String {
        self.inner.default_shell()
    }

    fn create(&self) -> Option<Box<dyn Executor>> {
        Some(Box::new(MachineExecutor {
            pool: Arc::clone(&self.pool),
            inner: Arc::clone(&self.inner),
            executor: None,
            job: None,
            lease: None,
            stage: String::new(),
        }))
    }

    async fn acquire(&self, runner: &RunnerConfig) -> Result<Option<MachineLease>> {
        Ok(self.pool.acquire(runner).await?)
    }

    fn release(&self, runner: &RunnerConfig, lease: &MachineLease) {
        self.pool.release(runner, lease);
    }
}

/// Executor binding a build to a pool machine, delegating the work itself
/// to the wrapped executor.
pub struct MachineExecutor {
    pool: Arc<MachinePoolManager>,
    inner: Arc<dyn ExecutorProvider>,
    executor: Option<Box<dyn Executor>>,
    job: Option<JobConfig>,
    /// Machine picked by this executor rather than pre-claimed by the job loop
    lease: Option<MachineLease>,
    stage: String,
}

impl std::fmt::Debug for MachineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineExecutor")
            .field("lease", &self.lease)
            .field("stage", &self.stage)
            .field("has_executor", &self.executor.is_some())
            .finish_non_exhaustive()
    }
}

impl MachineExecutor {
    fn host(&self) -> &str {
        self.job
            .as_ref()
            .map_or("", |job| job.docker.credentials.host.as_str())
    }
}

#[async_trait]
impl Executor for MachineExecutor {
    async fn prepare(&mut self, job: &JobConfig, build: &mut BuildContext) -> Result<()> {
        self.set_current_stage(STAGE_USE_MACHINE);

        let (job, lease) = self
            .pool
            .use_machine(&job.runner, build.machine.as_ref())
            .await
            .context("couldn't select machine for build")?;

        if let Some(machine) = lease.as_ref().or(build.machine.as_ref()) {
            build.hostname = machine.name().to_string();
        }

        if lease.is_none() {
            info!(build = build.id, name = %build.hostname, "Using existing docker-machine");
        } else {
            info!(build = build.id, name = %build.hostname, "Created docker-machine");
        }

        self.job = Some(job.clone());
        self.lease = lease;

        let executor = self
            .inner
            .create()
            .ok_or_else(|| anyhow!("failed to create an executor"))?;
        let executor = self.executor.insert(executor);

        if let Err(e) = executor.prepare(&job, build).await {
            info!(build = build.id, docker = %job.docker.credentials.host, "Preparing docker-machine wrapped executor failed");
            return Err(e.context("couldn't create inner executor"));
        }

        info!(build = build.id, docker = %job.docker.credentials.host, "Starting docker-machine build...");
        Ok(())
    }

    async fn run(&mut self, command: ExecutorCommand) -> Result<()> {
        let executor = self
            .executor
            .as_mut()
            .ok_or_else(|| anyhow!("missing executor"))?;
        executor.run(command).await
    }

    fn finish(&mut self, error: Option<&anyhow::Error>) {
        if let Some(executor) = self.executor.as_mut() {
            executor.finish(error);
        }

        match error {
            Some(e) => info!(docker = %self.host(), error = %e, "Finished docker-machine build"),
            None => info!(docker = %self.host(), "Finished docker-machine build"),
        }
    }

    async fn cleanup(&mut self) {
        if let Some(executor) = self.executor.as_mut() {
            executor.cleanup().await;
        }

        info!(docker = %self.host(), "Cleaned up docker-machine");

        let Some(lease) = self.lease.take() else {
            return;
        };

        self.set_current_stage(STAGE_RELEASE_MACHINE);
        if let Some(job) = &self.job {
            self.pool.release(&job.runner, &lease);
        }
    }

    fn current_stage(&self) -> String {
        match &self.executor {
            Some(executor) => executor.current_stage(),
            None => self.stage.clone(),
        }
    }

    fn set_current_stage(&mut self, stage: &str) {
        match self.executor.as_mut() {
            Some(executor) => executor.set_current_stage(stage),
            None => self.stage = stage.to_string(),
        }
    }
}

/// Executor providers keyed by executor name.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ExecutorProvider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("executors", &self.names())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, returning the one it replaced
    pub fn register(
        &mut self,
        executor: impl Into<String>,
        provider: Arc<dyn ExecutorProvider>,
    ) -> Option<Arc<dyn ExecutorProvider>> {
        self.providers.insert(executor.into(), provider)
    }

    pub fn get(&self, executor: &str) -> Option<Arc<dyn ExecutorProvider>> {
        self.providers.get(executor).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}
