//! Adapter around the `docker-machine` command line tool.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::config::{DockerCredentials, ToolConfig};
use crate::error::{ToolError, ToolResult};

const BUGSNAG_TOKEN_ENV: &str = "MACHINE_BUGSNAG_API_TOKEN";
const BUGSNAG_DISABLED: &str = "no-report";
const CERT_PATH_FORMAT: &str = "{{.HostOptions.AuthOptions.StorePath}}";

/// Host lifecycle operations against the external provisioning tool.
#[async_trait]
pub trait MachineCommand: Send + Sync {
    async fn create(&self, driver: &str, name: &str, options: &[String]) -> ToolResult<()>;

    /// Re-run provisioning on a host whose creation failed half-way.
    async fn provision(&self, name: &str) -> ToolResult<()>;

    async fn stop(&self, name: &str, timeout: Duration) -> ToolResult<()>;

    async fn remove(&self, name: &str) -> ToolResult<()>;

    /// Names of every host the tool has on disk, sorted.
    async fn list(&self) -> ToolResult<Vec<String>>;

    async fn exist(&self, name: &str) -> bool;

    /// Whether the host's Docker daemon answers. Positive answers may be
    /// served from cache unless `skip_cache` is set.
    async fn can_connect(&self, name: &str, skip_cache: bool) -> bool;

    async fn credentials(&self, name: &str) -> ToolResult<DockerCredentials>;
}

/// Positive-only connectivity cache.
///
/// Only successful checks are stored; a failed check is never cached so an
/// unreachable host is re-probed every time.
#[derive(Debug)]
pub struct ConnectivityCache {
    entries: RwLock<HashMap<String, Instant>>,
    ttl: Duration,
}

impl ConnectivityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// True when a successful check for `name` is younger than the TTL
    pub fn get(&self, name: &str) -> bool {
        let fresh = match self.entries.read().get(name) {
            Some(checked_at) => checked_at.elapsed() < self.ttl,
            None => return false,
        };

        if !fresh {
            debug!(name, "Connectivity cache entry expired");
            self.entries.write().remove(name);
        }
        fresh
    }

    pub fn put(&self, name: &str) {
        self.entries.write().insert(name.to_string(), Instant::now());
    }

    pub fn invalidate(&self, name: &str) {
        self.entries.write().remove(name);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// [`MachineCommand`] backed by the `docker-machine` executable.
#[derive(Debug)]
pub struct DockerMachineCommand {
    executable: String,
    machine_dir: PathBuf,
    create_timeout: Option<Duration>,
    remove_timeout: Option<Duration>,
    cache: ConnectivityCache,
}

impl DockerMachineCommand {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            machine_dir: config.machine_dir(),
            create_timeout: config.create_timeout(),
            remove_timeout: config.remove_timeout(),
            cache: ConnectivityCache::new(config.connectivity_cache_ttl()),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let token = std::env::var(BUGSNAG_TOKEN_ENV)
            .ok()
            .filter(|token| !token.is_empty())
            .unwrap_or_else(|| BUGSNAG_DISABLED.to_string());

        let mut command = Command::new(&self.executable);
        command
            .arg(format!("--bugsnag-api-token={token}"))
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    /// Run a command, streaming its output to the log
    async fn run(
        &self,
        operation: &'static str,
        name: &str,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> ToolResult<()> {
        let mut child = self
            .command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| self.spawn_error(operation, source))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let finished = async {
            let (status, (), ()) = tokio::join!(
                child.wait(),
                forward_lines(operation, name, stdout, false),
                forward_lines(operation, name, stderr, true),
            );
            status
        };

        let status = match timeout {
            Some(limit) => tokio::time::timeout(limit, finished).await.map_err(|_elapsed| {
                ToolError::Timeout {
                    operation,
                    name: name.to_string(),
                    timeout: limit,
                }
            })?,
            None => finished.await,
        };

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(ToolError::CommandFailed {
                operation,
                name: name.to_string(),
                detail: status.to_string(),
            }),
            Err(e) => Err(ToolError::CommandFailed {
                operation,
                name: name.to_string(),
                detail: e.to_string(),
            }),
        }
    }

    /// Run a command and return its trimmed stdout
    async fn output(&self, operation: &'static str, name: &str, args: &[&str]) -> ToolResult<String> {
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|source| self.spawn_error(operation, source))?;

        if !output.status.success() {
            return Err(ToolError::CommandFailed {
                operation,
                name: name.to_string(),
                detail: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.is_empty() {
            return Err(ToolError::EmptyOutput {
                operation,
                name: name.to_string(),
            });
        }
        Ok(stdout)
    }

    async fn succeeds(&self, args: &[&str]) -> bool {
        self.command(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok_and(|status| status.success())
    }

    fn spawn_error(&self, operation: &'static str, source: std::io::Error) -> ToolError {
        ToolError::Spawn {
            executable: self.executable.clone(),
            operation,
            source,
        }
    }
}

async fn forward_lines<R>(operation: &'static str, name: &str, stream: Option<R>, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };

    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            warn!(operation, name, "{}", line);
        } else {
            info!(operation, name, "{}", line);
        }
    }
}

#[async_trait]
impl MachineCommand for DockerMachineCommand {
    #[instrument(skip(self, options))]
    async fn create(&self, driver: &str, name: &str, options: &[String]) -> ToolResult<()> {
        let flags: Vec<String> = options.iter().map(|option| format!("--{option}")).collect();

        let mut args = vec!["create", "--driver", driver];
        args.extend(flags.iter().map(String::as_str));
        args.push(name);

        self.run("create", name, &args, self.create_timeout).await
    }

    #[instrument(skip(self))]
    async fn provision(&self, name: &str) -> ToolResult<()> {
        self.run("provision", name, &["provision", name], self.create_timeout)
            .await
    }

    #[instrument(skip(self))]
    async fn stop(&self, name: &str, timeout: Duration) -> ToolResult<()> {
        self.run("stop", name, &["stop", name], Some(timeout)).await
    }

    #[instrument(skip(self))]
    async fn remove(&self, name: &str) -> ToolResult<()> {
        let result = self
            .run("remove", name, &["rm", "-y", name], self.remove_timeout)
            .await;
        self.cache.invalidate(name);
        result
    }

    async fn list(&self) -> ToolResult<Vec<String>> {
        let list_error = |source: std::io::Error| ToolError::List {
            path: self.machine_dir.clone(),
            source,
        };

        let mut entries = match tokio::fs::read_dir(&self.machine_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(list_error(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(list_error)? {
            let file_type = entry.file_type().await.map_err(list_error)?;
            let name = entry.file_name().to_string_lossy().to_string();
            if file_type.is_dir() && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn exist(&self, name: &str) -> bool {
        let config_path = self.machine_dir.join(name).join("config.json");
        if !tokio::fs::try_exists(&config_path).await.unwrap_or(false) {
            return false;
        }

        self.succeeds(&["inspect", name]).await
    }

    async fn can_connect(&self, name: &str, skip_cache: bool) -> bool {
        if !skip_cache && self.cache.get(name) {
            return true;
        }

        let connected = self.succeeds(&["config", name]).await;
        if connected {
            self.cache.put(name);
        }
        connected
    }

    async fn credentials(&self, name: &str) -> ToolResult<DockerCredentials> {
        if !self.can_connect(name, true).await {
            return Err(ToolError::CannotConnect {
                name: name.to_string(),
            });
        }

        let host = self.output("url", name, &["url", name]).await?;
        let cert_path = self
            .output("inspect", name, &["inspect", name, "-f", CERT_PATH_FORMAT])
            .await?;

        Ok(DockerCredentials {
            host,
            cert_path,
            tls_verify: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tool(executable: &str, storage: &TempDir) -> DockerMachineCommand {
        DockerMachineCommand::new(&ToolConfig {
            executable: executable.to_string(),
            storage_path: storage.path().to_path_buf(),
            ..ToolConfig::default()
        })
    }

    #[test]
    fn test_cache_keeps_positive_results() {
        let cache = ConnectivityCache::new(Duration::from_secs(60));
        assert!(!cache.get("machine-1"));

        cache.put("machine-1");
        assert!(cache.get("machine-1"));

        cache.invalidate("machine-1");
        assert!(!cache.get("machine-1"));
    }

    #[test]
    fn test_cache_expiration() {
        let cache = ConnectivityCache::new(Duration::from_millis(1));
        cache.put("machine-1");

        std::thread::sleep(Duration::from_millis(10));

        assert!(!cache.get("machine-1"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_list_reads_machine_directories() {
        let storage = TempDir::new().unwrap();
        let machines = storage.path().join("machines");
        for dir in ["runner-b", "runner-a", ".hidden"] {
            std::fs::create_dir_all(machines.join(dir)).unwrap();
        }
        std::fs::write(machines.join("stray-file"), "x").unwrap();

        let names = tool("docker-machine", &storage).list().await.unwrap();
        assert_eq!(names, vec!["runner-a".to_string(), "runner-b".to_string()]);
    }

    #[tokio::test]
    async fn test_list_without_storage_dir_is_empty() {
        let storage = TempDir::new().unwrap();
        let names = tool("docker-machine", &storage).list().await.unwrap();
        assert!(names.is_empty());
    }

    #[tokio::test]
    async fn test_exist_requires_config_file() {
        let storage = TempDir::new().unwrap();
        std::fs::create_dir_all(storage.path().join("machines").join("runner-a")).unwrap();

        assert!(!tool("true", &storage).exist("runner-a").await);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let storage = TempDir::new().unwrap();
        let err = tool("/nonexistent/docker-machine", &storage)
            .provision("runner-a")
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { operation: "provision", .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_can_connect_caches_success_only() {
        let storage = TempDir::new().unwrap();

        let reachable = tool("true", &storage);
        assert!(reachable.can_connect("runner-a", false).await);
        assert!(reachable.cache.get("runner-a"));

        let unreachable = tool("false", &storage);
        assert!(!unreachable.can_connect("runner-a", false).await);
        assert!(unreachable.cache.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_credentials_fail_closed() {
        let storage = TempDir::new().unwrap();
        let err = tool("false", &storage).credentials("runner-a").await.unwrap_err();
        assert!(matches!(err, ToolError::CannotConnect { .. }));

        // Reachable but the tool prints nothing for `url`
        let err = tool("true", &storage).credentials("runner-a").await.unwrap_err();
        assert!(matches!(err, ToolError::EmptyOutput { operation: "url", .. }));
    }

    /// Tool whose every command hangs
    #[cfg(unix)]
    fn hanging_tool(storage: &TempDir) -> DockerMachineCommand {
        use std::os::unix::fs::PermissionsExt;

        let script = storage.path().join("hanging-docker-machine");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        DockerMachineCommand::new(&ToolConfig {
            executable: script.to_string_lossy().to_string(),
            storage_path: storage.path().to_path_buf(),
            create_timeout_secs: 1,
            remove_timeout_secs: 1,
            ..ToolConfig::default()
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hanging_tool_calls_time_out() {
        let storage = TempDir::new().unwrap();
        let tool = hanging_tool(&storage);

        let started = Instant::now();
        let err = tool.create("virtualbox", "runner-a", &[]).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout { operation: "create", .. }));

        let err = tool.provision("runner-a").await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout { operation: "provision", .. }));

        let err = tool.remove("runner-a").await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout { operation: "remove", .. }));

        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_failure_reports_status() {
        let storage = TempDir::new().unwrap();
        let err = tool("false", &storage)
            .stop("runner-a", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::CommandFailed { operation: "stop", .. }));
    }
}
