use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::record::MachineRecord;
use crate::state::MachineState;

/// In-memory inventory of every machine the pool knows about.
///
/// Each method takes the lock once, so every state change is a single
/// atomic operation on one record.
#[derive(Debug, Default)]
pub struct MachineRegistry {
    records: RwLock<HashMap<String, MachineRecord>>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for a name seen in the inventory, created on first sight.
    /// Stamps `last_seen`.
    pub fn observe(&self, name: &str) -> MachineRecord {
        let mut records = self.records.write();
        let record = records
            .entry(name.to_string())
            .or_insert_with(|| MachineRecord::new(name));
        record.last_seen = Utc::now();
        record.clone()
    }

    pub fn get(&self, name: &str) -> Option<MachineRecord> {
        self.records.read().get(name).cloned()
    }

    /// Pre-claim: move an idle machine to `Acquired`.
    ///
    /// Unknown names are registered as discovered hosts first. Returns false
    /// when the machine is already in use, so two workers racing for the
    /// same host never both win.
    pub fn try_acquire(&self, name: &str) -> bool {
        let mut records = self.records.write();
        let record = records
            .entry(name.to_string())
            .or_insert_with(|| MachineRecord::new(name));
        if record.is_used() {
            return false;
        }
        record.acquire();
        true
    }

    /// Register a machine about to be provisioned
    pub fn insert_creating(&self, name: &str) -> MachineRecord {
        let mut record = MachineRecord::new(name);
        record.create();
        self.records.write().insert(name.to_string(), record.clone());
        record
    }

    /// Apply `f` to the named record under the write lock
    pub fn update<R>(&self, name: &str, f: impl FnOnce(&mut MachineRecord) -> R) -> Option<R> {
        self.records.write().get_mut(name).map(f)
    }

    pub fn remove(&self, name: &str) -> Option<MachineRecord> {
        self.records.write().remove(name)
    }

    /// Machines still being created that the listing did not return yet
    pub fn intermediate_names(&self, listed: &[String]) -> Vec<String> {
        let listed: HashSet<&str> = listed.iter().map(String::as_str).collect();
        let records = self.records.read();

        let mut names: Vec<String> = records
            .values()
            .filter(|record| !record.is_persisted_on_disk())
            .filter(|record| !listed.contains(record.name.as_str()))
            .map(|record| record.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Drop dead records of this template that no listing returns anymore
    pub fn prune_dead(
        &self,
        template: &str,
        seen: &[String],
        dead_interval: Duration,
    ) -> Vec<String> {
        let seen: HashSet<&str> = seen.iter().map(String::as_str).collect();
        let mut records = self.records.write();

        let dead: Vec<String> = records
            .values()
            .filter(|record| record.matches(template))
            .filter(|record| record.is_dead(dead_interval))
            .filter(|record| !seen.contains(record.name.as_str()))
            .map(|record| record.name.clone())
            .collect();

        for name in &dead {
            records.remove(name);
        }
        dead
    }

    /// Per-state totals, skipping dead machines
    pub fn count(&self, stuck_threshold: u32, dead_interval: Duration) -> MachinesCounter {
        let records = self.records.read();
        let mut counter = MachinesCounter::default();
        for record in records.values().filter(|r| !r.is_dead(dead_interval)) {
            counter.count(record, stuck_threshold);
        }
        counter
    }

    pub fn snapshot(&self) -> Vec<MachineRecord> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

/// Machine totals by state, as seen by one inventory pass or metrics scrape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MachinesCounter {
    pub acquired: usize,
    pub creating: usize,
    pub idle: usize,
    pub used: usize,
    pub removing: usize,
    pub stuck_on_removing: usize,
}

impl MachinesCounter {
    pub fn count(&mut self, record: &MachineRecord, stuck_threshold: u32) {
        match record.state {
            MachineState::Idle => self.idle += 1,
            MachineState::Acquired => self.acquired += 1,
            MachineState::Creating => self.creating += 1,
            MachineState::Used => self.used += 1,
            MachineState::Removing
                if record.removal_failed || record.is_stuck_on_remove(stuck_threshold) =>
            {
                self.stuck_on_removing += 1;
            }
            MachineState::Removing => self.removing += 1,
        }
    }

    /// Machines that can take a job without provisioning a new one
    pub fn available(&self) -> usize {
        self.acquired + self.creating + self.idle
    }

    pub fn total(&self) -> usize {
        self.acquired
            + self.creating
            + self.idle
            + self.used
            + self.removing
            + self.stuck_on_removing
    }

    /// Gauge label and value for each state
    pub fn by_state(&self) -> [(&'static str, usize); 6] {
        [
            ("acquired", self.acquired),
            ("creating", self.creating),
            ("idle", self.idle),
            ("used", self.used),
            ("removing", self.removing),
            ("stuck-on-removing", self.stuck_on_removing),
        ]
    }
}
