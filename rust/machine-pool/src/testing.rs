//! In-memory [`MachineCommand`] used by tests and the daemon's dry-run mode.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::command::MachineCommand;
use crate::config::DockerCredentials;
use crate::error::{ToolError, ToolResult};

#[derive(Debug, Default)]
struct Script {
    machines: BTreeSet<String>,
    unreachable: HashSet<String>,
    broken_credentials: HashSet<String>,
    fail_creates: bool,
    fail_provisions: bool,
    remaining_remove_failures: usize,
    created: Vec<String>,
    removed: Vec<String>,
}

/// Fake provisioning tool whose hosts live in memory.
///
/// Creation and stopping can be slowed down, and every operation can be made
/// to fail, to drive the pool through its error paths.
#[derive(Debug, Default)]
pub struct ScriptedMachineCommand {
    script: Mutex<Script>,
    create_delay: Duration,
    stop_delay: Duration,
    create_calls: AtomicUsize,
    provision_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    active_stops: AtomicUsize,
    max_concurrent_stops: AtomicUsize,
}

impl ScriptedMachineCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    /// Pretend a host already exists on disk
    pub fn add_machine(&self, name: &str) {
        self.script.lock().machines.insert(name.to_string());
    }

    pub fn set_unreachable(&self, name: &str, unreachable: bool) {
        let mut script = self.script.lock();
        if unreachable {
            script.unreachable.insert(name.to_string());
        } else {
            script.unreachable.remove(name);
        }
    }

    /// Reachable, but credential lookups fail
    pub fn break_credentials(&self, name: &str) {
        self.script.lock().broken_credentials.insert(name.to_string());
    }

    pub fn fail_creates(&self, fail: bool) {
        self.script.lock().fail_creates = fail;
    }

    pub fn fail_provisions(&self, fail: bool) {
        self.script.lock().fail_provisions = fail;
    }

    /// Make the next `count` removals fail
    pub fn fail_removes(&self, count: usize) {
        self.script.lock().remaining_remove_failures = count;
    }

    pub fn machines(&self) -> Vec<String> {
        self.script.lock().machines.iter().cloned().collect()
    }

    pub fn created(&self) -> Vec<String> {
        self.script.lock().created.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.script.lock().removed.clone()
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn provision_calls(&self) -> usize {
        self.provision_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Highest number of `stop` calls observed in flight at once
    pub fn max_concurrent_stops(&self) -> usize {
        self.max_concurrent_stops.load(Ordering::SeqCst)
    }

    fn failure(operation: &'static str, name: &str) -> ToolError {
        ToolError::CommandFailed {
            operation,
            name: name.to_string(),
            detail: "exit status: 1".to_string(),
        }
    }
}

#[async_trait]
impl MachineCommand for ScriptedMachineCommand {
    async fn create(&self, _driver: &str, name: &str, _options: &[String]) -> ToolResult<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }

        let mut script = self.script.lock();
        // A failed create still leaves a half-provisioned host behind
        script.machines.insert(name.to_string());
        if script.fail_creates {
            return Err(Self::failure("create", name));
        }
        script.created.push(name.to_string());
        Ok(())
    }

    async fn provision(&self, name: &str) -> ToolResult<()> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock();
        if script.fail_provisions {
            return Err(Self::failure("provision", name));
        }
        script.created.push(name.to_string());
        Ok(())
    }

    async fn stop(&self, _name: &str, _timeout: Duration) -> ToolResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active_stops.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_stops.fetch_max(active, Ordering::SeqCst);

        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }

        self.active_stops.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, name: &str) -> ToolResult<()> {
        let mut script = self.script.lock();
        if script.remaining_remove_failures > 0 {
            script.remaining_remove_failures -= 1;
            return Err(Self::failure("remove", name));
        }
        script.machines.remove(name);
        script.removed.push(name.to_string());
        Ok(())
    }

    async fn list(&self) -> ToolResult<Vec<String>> {
        Ok(self.machines())
    }

    async fn exist(&self, name: &str) -> bool {
        self.script.lock().machines.contains(name)
    }

    async fn can_connect(&self, name: &str, _skip_cache: bool) -> bool {
        let script = self.script.lock();
        script.machines.contains(name) && !script.unreachable.contains(name)
    }

    async fn credentials(&self, name: &str) -> ToolResult<DockerCredentials> {
        if !self.can_connect(name, true).await {
            return Err(ToolError::CannotConnect {
                name: name.to_string(),
            });
        }
        if self.script.lock().broken_credentials.contains(name) {
            return Err(Self::failure("inspect", name));
        }

        Ok(DockerCredentials {
            host: format!("tcp://{name}:2376"),
            cert_path: format!("/certs/{name}"),
            tls_verify: true,
        })
    }
}
