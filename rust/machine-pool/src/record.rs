use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::naming;
use crate::state::MachineState;

/// State and metadata of one managed host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub name: String,
    pub created: DateTime<Utc>,
    pub used: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Jobs run on this host.
    pub used_count: usize,
    pub state: MachineState,
    /// Cause of the most recent removal request.
    pub reason: String,
    /// Consecutive failures (provisioning while creating, removal while removing).
    pub retry_count: u32,
    /// Removal gave up after the configured number of attempts.
    #[serde(default)]
    pub removal_failed: bool,
}

impl MachineRecord {
    /// Record for a host found by an inventory pass.
    ///
    /// Discovered hosts count as already used once, so that a max-builds
    /// policy of one retires them instead of reusing them.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            created: now,
            used: now,
            last_seen: now,
            used_count: 1,
            state: MachineState::Idle,
            reason: String::new(),
            retry_count: 0,
            removal_failed: false,
        }
    }

    pub fn acquire(&mut self) {
        self.state = MachineState::Acquired;
    }

    pub fn create(&mut self) {
        self.state = MachineState::Creating;
        self.used_count = 0;
        self.retry_count = 0;
        self.last_seen = Utc::now();
    }

    pub fn remove(&mut self, reason: impl Into<String>) {
        self.state = MachineState::Removing;
        self.retry_count = 0;
        self.removal_failed = false;
        self.used = Utc::now();
        self.reason = reason.into();
    }

    /// Bind the host to a job.
    pub fn start_use(&mut self) {
        self.state = MachineState::Used;
        self.used_count += 1;
        self.used = Utc::now();
    }

    /// Machines in the creating phase may not be on disk yet: `create` runs
    /// asynchronously and is what writes the machine directory.
    pub fn is_persisted_on_disk(&self) -> bool {
        self.state != MachineState::Creating
    }

    pub fn is_used(&self) -> bool {
        self.state != MachineState::Idle
    }

    pub fn is_stuck_on_remove(&self, threshold: u32) -> bool {
        self.state == MachineState::Removing && self.retry_count >= threshold
    }

    pub fn is_dead(&self, dead_interval: Duration) -> bool {
        self.state == MachineState::Idle && elapsed_since(self.last_seen) > dead_interval
    }

    pub fn can_be_used(&self) -> bool {
        self.state == MachineState::Acquired
    }

    pub fn matches(&self, template: &str) -> bool {
        naming::matches_template(&self.name, template)
    }

    pub fn age(&self) -> Duration {
        elapsed_since(self.created)
    }

    pub fn unused_for(&self) -> Duration {
        elapsed_since(self.used)
    }

    /// Record plus derived fields, as written to the diagnostics directory
    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            details: self.clone(),
            time: Utc::now(),
            created_ago_secs: self.age().as_secs_f64(),
            unused_for_secs: self.unused_for().as_secs_f64(),
        }
    }

    /// Write `<dir>/<name>.yml`
    pub fn write_diagnostics(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let yaml = serde_yaml::to_string(&self.snapshot()).map_err(std::io::Error::other)?;

        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.yml", self.name));
        fs::write(&path, yaml)?;
        Ok(path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub details: MachineRecord,
    pub time: DateTime<Utc>,
    pub created_ago_secs: f64,
    pub unused_for_secs: f64,
}

pub(crate) fn elapsed_since(instant: DateTime<Utc>) -> Duration {
    (Utc::now() - instant).to_std().unwrap_or(Duration::ZERO)
}
