use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{PoolError, PoolResult};

/// Executor name served by the machine pool.
pub const DOCKER_MACHINE_EXECUTOR: &str = "docker+machine";

/// Daemon configuration: runner policies plus pool and tool tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Runners whose machines are managed by the pool
    #[serde(default)]
    pub runners: Vec<RunnerConfig>,

    /// Provisioning tool configuration
    #[serde(default)]
    pub tool: ToolConfig,

    /// Pool retry and lifecycle tuning
    #[serde(default)]
    pub pool: PoolConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Per-machine YAML dumps
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    /// Interval between capacity probes in seconds (default: 15s)
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
}

/// A runner registered with the coordinator.
///
/// Shared between jobs as `Arc<RunnerConfig>` and never mutated once loaded;
/// per-job changes go into a [`JobConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub name: String,

    /// Runner authentication token; its prefix is part of machine names
    #[serde(default)]
    pub token: String,

    #[serde(default = "default_executor")]
    pub executor: String,

    /// Maximum number of machines, 0 means unlimited
    #[serde(default)]
    pub limit: usize,

    #[serde(default)]
    pub docker: Option<DockerConfig>,

    #[serde(default)]
    pub machine: Option<MachineSettings>,
}

/// Autoscaling policy for one runner. Re-read on every acquire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineSettings {
    /// Number of idle machines to keep ready
    #[serde(default)]
    pub idle_count: usize,

    /// Seconds an idle machine may stay unused before it becomes removable
    #[serde(default)]
    pub idle_time_secs: u64,

    /// Builds per machine before it is removed, 0 means unlimited
    #[serde(default)]
    pub max_builds: usize,

    /// docker-machine driver
    #[serde(default)]
    pub machine_driver: String,

    /// Name template containing a single `%s`
    #[serde(default)]
    pub machine_name: String,

    /// Driver options, passed as `--<option>`
    #[serde(default)]
    pub machine_options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub privileged: bool,

    #[serde(default)]
    pub volumes: Vec<String>,

    /// Filled per job from the selected machine
    #[serde(default)]
    pub credentials: DockerCredentials,
}

/// Connection details of a machine's Docker daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerCredentials {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub cert_path: String,
    #[serde(default)]
    pub tls_verify: bool,
}

/// Runner configuration plus the per-job Docker overlay.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub runner: Arc<RunnerConfig>,
    pub docker: DockerConfig,
}

impl JobConfig {
    /// Job configuration without a bound machine.
    pub fn from_runner(runner: Arc<RunnerConfig>) -> Self {
        let docker = runner.docker.clone().unwrap_or_default();
        Self { runner, docker }
    }

    /// Job configuration pointing at the given Docker endpoint.
    pub fn with_credentials(runner: Arc<RunnerConfig>, credentials: DockerCredentials) -> Self {
        let mut job = Self::from_runner(runner);
        job.docker.credentials = credentials;
        job
    }
}

impl RunnerConfig {
    /// First eight characters of the token, used to tell runners apart
    pub fn short_description(&self) -> String {
        self.token.chars().take(8).collect()
    }

    /// Machine settings when present and naming is configured
    pub fn machine_settings(&self) -> Option<&MachineSettings> {
        self.machine
            .as_ref()
            .filter(|machine| !machine.machine_name.is_empty())
    }
}

impl MachineSettings {
    pub fn idle_time(&self) -> Duration {
        Duration::from_secs(self.idle_time_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// docker-machine executable (default: "docker-machine")
    #[serde(default = "default_executable")]
    pub executable: String,

    /// docker-machine storage path; machines live in `<path>/machines`
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// How long a positive connectivity check is trusted (default: 300s)
    #[serde(default = "default_connectivity_cache_ttl")]
    pub connectivity_cache_ttl_secs: u64,

    /// Upper bound for a single `create` or `provision` call, 0 disables it (default: 0)
    #[serde(default)]
    pub create_timeout_secs: u64,

    /// Upper bound for a single `rm` call, 0 disables it (default: 300s)
    #[serde(default = "default_remove_timeout")]
    pub remove_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Delay between provisioning retries in milliseconds (default: 1000ms)
    #[serde(default = "default_provision_retry_interval")]
    pub provision_retry_interval_ms: u64,

    /// Provision attempts after a failed create (default: 3)
    #[serde(default = "default_provision_retries")]
    pub provision_retries: u32,

    /// Find-or-create attempts in `use_machine` (default: 3)
    #[serde(default = "default_use_attempts")]
    pub use_attempts: u32,

    /// Initial delay after a failed removal in milliseconds (default: 30000ms)
    #[serde(default = "default_remove_retry_interval")]
    pub remove_retry_interval_ms: u64,

    /// Ceiling for the removal backoff in milliseconds (default: 600000ms)
    #[serde(default = "default_remove_retry_max_interval")]
    pub remove_retry_max_interval_ms: u64,

    /// Failed removals after which a machine counts as stuck (default: 3)
    #[serde(default = "default_stuck_remove_threshold")]
    pub stuck_remove_threshold: u32,

    /// Removal attempts before giving up on a machine (default: 10)
    #[serde(default = "default_max_remove_attempts")]
    pub max_remove_attempts: u32,

    /// Idle machines unseen for this long are dead (default: 1200s)
    #[serde(default = "default_dead_interval")]
    pub dead_interval_secs: u64,

    /// Timeout for `docker-machine stop` in seconds (default: 60s)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Metrics server port (default: 9252)
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Write a YAML snapshot per machine on every inventory pass (default: false)
    #[serde(default = "default_false")]
    pub enabled: bool,

    /// Directory receiving `<machine>.yml` files (default: "machines")
    #[serde(default = "default_diagnostics_dir")]
    pub dir: PathBuf,
}

// Default value functions
fn default_executor() -> String {
    DOCKER_MACHINE_EXECUTOR.to_string()
}
fn default_check_interval() -> u64 {
    15
}
fn default_executable() -> String {
    "docker-machine".to_string()
}
fn default_storage_path() -> PathBuf {
    if let Ok(path) = env::var("MACHINE_STORAGE_PATH") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".docker")
        .join("machine")
}
fn default_connectivity_cache_ttl() -> u64 {
    300
}
fn default_remove_timeout() -> u64 {
    300
}
fn default_provision_retry_interval() -> u64 {
    1000
}
fn default_provision_retries() -> u32 {
    3
}
fn default_use_attempts() -> u32 {
    3
}
fn default_remove_retry_interval() -> u64 {
    30_000
}
fn default_remove_retry_max_interval() -> u64 {
    600_000
}
fn default_stuck_remove_threshold() -> u32 {
    3
}
fn default_max_remove_attempts() -> u32 {
    10
}
fn default_dead_interval() -> u64 {
    20 * 60
}
fn default_stop_timeout() -> u64 {
    60
}
fn default_metrics_port() -> u16 {
    9252
}
fn default_false() -> bool {
    false
}
fn default_diagnostics_dir() -> PathBuf {
    PathBuf::from("machines")
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            storage_path: default_storage_path(),
            connectivity_cache_ttl_secs: default_connectivity_cache_ttl(),
            create_timeout_secs: 0,
            remove_timeout_secs: default_remove_timeout(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            provision_retry_interval_ms: default_provision_retry_interval(),
            provision_retries: default_provision_retries(),
            use_attempts: default_use_attempts(),
            remove_retry_interval_ms: default_remove_retry_interval(),
            remove_retry_max_interval_ms: default_remove_retry_max_interval(),
            stuck_remove_threshold: default_stuck_remove_threshold(),
            max_remove_attempts: default_max_remove_attempts(),
            dead_interval_secs: default_dead_interval(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_diagnostics_dir(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            runners: Vec::new(),
            tool: ToolConfig::default(),
            pool: PoolConfig::default(),
            metrics: MetricsConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            check_interval_secs: default_check_interval(),
        }
    }
}

impl ToolConfig {
    /// Directory holding one sub-directory per machine
    pub fn machine_dir(&self) -> PathBuf {
        self.storage_path.join("machines")
    }

    pub fn connectivity_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.connectivity_cache_ttl_secs)
    }

    pub fn create_timeout(&self) -> Option<Duration> {
        (self.create_timeout_secs > 0).then(|| Duration::from_secs(self.create_timeout_secs))
    }

    pub fn remove_timeout(&self) -> Option<Duration> {
        (self.remove_timeout_secs > 0).then(|| Duration::from_secs(self.remove_timeout_secs))
    }
}

impl PoolConfig {
    pub fn provision_retry_interval(&self) -> Duration {
        Duration::from_millis(self.provision_retry_interval_ms)
    }

    pub fn dead_interval(&self) -> Duration {
        Duration::from_secs(self.dead_interval_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Delay after the given number of failed removal attempts (1-based),
    /// doubling from the base interval up to the ceiling
    pub fn remove_backoff(&self, failed_attempts: u32) -> Duration {
        let base = Duration::from_millis(self.remove_retry_interval_ms);
        let max = Duration::from_millis(self.remove_retry_max_interval_ms);
        let exponent = failed_attempts.saturating_sub(1).min(16);
        base.saturating_mul(2u32.pow(exponent)).min(max)
    }
}

impl Config {
    /// Load configuration from file or environment
    pub fn load() -> PoolResult<Self> {
        if let Ok(config_path) = env::var("MACHINE_POOL_CONFIG_PATH") {
            Self::from_file(&config_path)
        } else if Path::new("/etc/machine-pool/config.yaml").exists() {
            Self::from_file("/etc/machine-pool/config.yaml")
        } else if Path::new("config/machine-pool.yaml").exists() {
            Self::from_file("config/machine-pool.yaml")
        } else {
            Ok(Self::from_env(Self::default()))
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: &str) -> PoolResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PoolError::ConfigurationError(format!("Failed to read config file {path}: {e}"))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse YAML, apply environment overrides and validate
    pub fn from_yaml(content: &str) -> PoolResult<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        let config = Self::from_env(config);
        config.validate()?;
        Ok(config)
    }

    /// Override configuration with environment variables
    pub fn from_env(mut config: Config) -> Self {
        if let Ok(v) = env::var("METRICS_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                config.metrics.port = port;
            }
        }
        if let Ok(v) = env::var("DOCKER_MACHINE_EXECUTABLE") {
            if !v.is_empty() {
                config.tool.executable = v;
            }
        }
        if let Ok(v) = env::var("MACHINE_STORAGE_PATH") {
            if !v.is_empty() {
                config.tool.storage_path = PathBuf::from(v);
            }
        }
        if let Ok(v) = env::var("MACHINE_DIAGNOSTICS_DIR") {
            if !v.is_empty() {
                config.diagnostics.enabled = true;
                config.diagnostics.dir = PathBuf::from(v);
            }
        }
        if let Ok(v) = env::var("MACHINE_POOL_CHECK_INTERVAL_SECONDS") {
            if let Ok(secs) = v.parse::<u64>() {
                config.check_interval_secs = secs;
            }
        }

        config
    }

    /// Reject machine name templates that cannot be matched back
    pub fn validate(&self) -> PoolResult<()> {
        for runner in &self.runners {
            let Some(machine) = &runner.machine else {
                continue;
            };
            if machine.machine_name.matches("%s").count() != 1 {
                return Err(PoolError::ConfigurationError(format!(
                    "runner '{}': machine_name '{}' must contain exactly one %s",
                    runner.name, machine.machine_name
                )));
            }
        }
        Ok(())
    }

    /// Runners served by the docker-machine pool
    pub fn machine_runners(&self) -> impl Iterator<Item = &RunnerConfig> {
        self.runners
            .iter()
            .filter(|runner| runner.executor == DOCKER_MACHINE_EXECUTOR)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}
