//! Autoscaling pool of docker-machine hosts.
//!
//! [`MachinePoolManager`] answers three calls from job-dispatch workers:
//! `acquire` sizes the pool and pre-claims a host, `use_machine` binds a host
//! to a job and hands out its Docker credentials, and `release` returns it to
//! the idle pool or retires it. Creation and removal run as detached tasks
//! tracked by the manager and stopped by [`MachinePoolManager::shutdown`].

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::command::MachineCommand;
use crate::config::{Config, JobConfig, MachineSettings, PoolConfig, RunnerConfig};
use crate::error::{PoolError, PoolResult, ToolResult};
use crate::metrics::{
    ACTION_CREATED, ACTION_REMOVAL_FAILED, ACTION_REMOVED, ACTION_USED, PoolCollector,
    PoolMetrics,
};
use crate::naming;
use crate::record::MachineRecord;
use crate::registry::{MachineRegistry, MachinesCounter};
use crate::state::MachineState;

/// Handle to a pre-claimed or bound machine, passed between pool calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MachineLease {
    name: String,
}

impl MachineLease {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

type CreationResult = oneshot::Receiver<PoolResult<()>>;

/// Pool manager for one executor family.
pub struct MachinePoolManager {
    executor: String,
    command: Arc<dyn MachineCommand>,
    machines: Arc<MachineRegistry>,
    pool: PoolConfig,
    diagnostics_dir: Option<PathBuf>,
    metrics: PoolMetrics,

    /// Spans a whole inventory-and-sizing pass
    acquire_lock: Mutex<()>,
    /// Lets only one stuck machine be removed at a time
    stuck_remove_lock: Mutex<()>,

    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl std::fmt::Debug for MachinePoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachinePoolManager")
            .field("executor", &self.executor)
            .field("machines", &self.machines.len())
            .field("pending_tasks", &self.tasks.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl MachinePoolManager {
    pub fn new(
        executor: impl Into<String>,
        command: Arc<dyn MachineCommand>,
        config: &Config,
    ) -> PoolResult<Arc<Self>> {
        let executor = executor.into();
        let metrics = PoolMetrics::new(&executor)
            .map_err(|e| PoolError::ConfigurationError(format!("{e:#}")))?;

        Ok(Arc::new(Self {
            executor,
            command,
            machines: Arc::new(MachineRegistry::new()),
            pool: config.pool.clone(),
            diagnostics_dir: config
                .diagnostics
                .enabled
                .then(|| config.diagnostics.dir.clone()),
            metrics,
            acquire_lock: Mutex::new(()),
            stuck_remove_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }))
    }

    pub fn executor(&self) -> &str {
        &self.executor
    }

    pub fn machines(&self) -> &MachineRegistry {
        &self.machines
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    /// Collector exporting this pool's metrics; register it once
    pub fn collector(&self) -> PoolCollector {
        PoolCollector::new(
            self.metrics.clone(),
            Arc::clone(&self.machines),
            self.pool.stuck_remove_threshold,
            self.pool.dead_interval(),
        )
    }

    /// Refresh the inventory, size the idle pool and pre-claim a free machine.
    ///
    /// `Ok(None)` is a valid outcome: nothing was free but more capacity may
    /// be on its way. [`PoolError::NoFreeMachines`] is returned only when an
    /// idle pool is configured and it is empty.
    #[instrument(skip_all, fields(executor = %self.executor, runner = %runner.short_description()))]
    pub async fn acquire(self: &Arc<Self>, runner: &RunnerConfig) -> PoolResult<Option<MachineLease>> {
        self.ensure_running()?;
        let machine = runner
            .machine_settings()
            .ok_or(PoolError::MissingMachineOptions)?;

        let _guard = self.acquire_lock.lock().await;

        let template = naming::machine_name_template(runner);
        let names = self.load_machine_names(&template).await?;

        for name in self
            .machines
            .prune_dead(&template, &names, self.pool.dead_interval())
        {
            debug!(name = %name, "Forgot dead machine");
        }

        let (mut data, valid) = self.remove_redundant_machines(&names, runner, machine);
        self.create_machines(runner, machine, &mut data);

        debug!(
            idle = data.idle,
            creating = data.creating,
            used = data.used,
            removing = data.removing,
            min_idle_count = machine.idle_count,
            max_machines = runner.limit,
            "Docker Machine Details"
        );

        if let Some(lease) = self.find_free_machine(&valid, false).await {
            return Ok(Some(lease));
        }

        if machine.idle_count != 0 && data.idle == 0 {
            return Err(PoolError::NoFreeMachines);
        }

        debug!("No free machine acquired");
        Ok(None)
    }

    /// Bind a machine to a job.
    ///
    /// Uses `lease` when it is still pre-claimed and reachable, otherwise
    /// finds or creates another machine. The second element of the result is
    /// `Some` only for a machine picked here; the caller releases it.
    #[instrument(skip_all, fields(executor = %self.executor, runner = %runner.short_description()))]
    pub async fn use_machine(
        self: &Arc<Self>,
        runner: &Arc<RunnerConfig>,
        lease: Option<&MachineLease>,
    ) -> PoolResult<(JobConfig, Option<MachineLease>)> {
        self.ensure_running()?;

        let usable = match lease {
            Some(lease) => self.is_usable(lease).await,
            None => false,
        };

        let (name, new_lease) = match lease {
            Some(lease) if usable => (lease.name().to_string(), None),
            _ => {
                let found = self
                    .retry_find_or_create(runner)
                    .await
                    .map_err(|e| PoolError::FindOrCreate(Box::new(e)))?;
                (found.name().to_string(), Some(found))
            }
        };

        let credentials = match self.command.credentials(&name).await {
            Ok(credentials) => credentials,
            Err(source) => {
                if let Some(new_lease) = &new_lease {
                    self.release(runner, new_lease);
                }
                return Err(PoolError::Credentials { name, source });
            }
        };

        let job = JobConfig::with_credentials(Arc::clone(runner), credentials);

        if self.machines.update(&name, MachineRecord::start_use).is_none() {
            warn!(name = %name, "Machine disappeared while being bound to a job");
        }
        self.metrics.action(ACTION_USED);

        Ok((job, new_lease))
    }

    /// Return a machine after its job finished.
    ///
    /// Machines at their build limit are scheduled for removal; anything else
    /// goes back to the idle pool.
    pub fn release(self: &Arc<Self>, runner: &RunnerConfig, lease: &MachineLease) {
        let name = lease.name();
        let max_builds = runner.machine.as_ref().map_or(0, |m| m.max_builds);

        let over_limit = self.machines.update(name, |record| {
            if record.state == MachineState::Used {
                record.used = Utc::now();
            }
            max_builds > 0 && record.used_count >= max_builds
        });

        let Some(over_limit) = over_limit else {
            warn!(name, "Released machine is not known to the pool");
            return;
        };

        if over_limit {
            match self.schedule_removal(name, "Too many builds") {
                Ok(()) => return,
                Err(err) => error!(name, error = %err, "Machine removal failed"),
            }
        }

        self.machines.update(name, |record| {
            if record.state != MachineState::Removing {
                record.state = MachineState::Idle;
            }
        });
    }

    /// Mark a machine for removal and start removing it in the background
    pub fn schedule_removal(self: &Arc<Self>, name: &str, reason: impl Into<String>) -> PoolResult<()> {
        let reason = reason.into();

        let scheduled = self
            .machines
            .update(name, |record| {
                if record.state == MachineState::Removing && !record.removal_failed {
                    return None;
                }
                record.remove(reason);
                Some(record.clone())
            })
            .ok_or_else(|| PoolError::MachineNotFound(name.to_string()))?;

        let Some(record) = scheduled else {
            debug!(name, "Machine removal already in progress");
            return Ok(());
        };

        self.write_diagnostics(&record);
        warn!(
            name,
            reason = %record.reason,
            lifetime = ?record.age(),
            used_count = record.used_count,
            "Requesting machine removal"
        );

        let manager = Arc::clone(self);
        let name = name.to_string();
        self.tasks.spawn(async move {
            manager.finalize_removal(&name).await;
        });

        Ok(())
    }

    /// Cancel detached work and wait for it to wind down
    pub async fn shutdown(&self) {
        info!(executor = %self.executor, pending = self.tasks.len(), "Shutting down machine pool");
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn ensure_running(&self) -> PoolResult<()> {
        if self.cancel.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }
        Ok(())
    }

    async fn is_usable(&self, lease: &MachineLease) -> bool {
        let pre_claimed = self
            .machines
            .get(lease.name())
            .is_some_and(|record| record.can_be_used());

        pre_claimed && self.command.can_connect(lease.name(), true).await
    }

    /// Listed machines plus the ones still being created, limited to `template`
    async fn load_machine_names(&self, template: &str) -> PoolResult<Vec<String>> {
        let mut names = self.command.list().await.map_err(PoolError::ListMachines)?;
        let intermediate = self.machines.intermediate_names(&names);
        names.extend(intermediate);

        Ok(naming::filter_by_template(names, template))
    }

    fn remove_redundant_machines(
        self: &Arc<Self>,
        names: &[String],
        runner: &RunnerConfig,
        machine: &MachineSettings,
    ) -> (MachinesCounter, Vec<String>) {
        let mut data = MachinesCounter::default();
        let mut valid = Vec::with_capacity(names.len());

        for name in names {
            let record = self.machines.observe(name);

            let removal = if record.state == MachineState::Removing && record.removal_failed {
                Some(record.reason.clone())
            } else {
                redundancy(&record, runner, machine, &data).map(str::to_string)
            };

            match removal {
                Some(reason) => {
                    if let Err(err) = self.schedule_removal(name, reason) {
                        error!(name, error = %err, "Machine removal failed");
                    }
                }
                None => valid.push(name.clone()),
            }

            if let Some(current) = self.machines.get(name) {
                data.count(&current, self.pool.stuck_remove_threshold);
                self.write_diagnostics(&current);
            }
        }

        (data, valid)
    }

    fn create_machines(
        self: &Arc<Self>,
        runner: &RunnerConfig,
        machine: &MachineSettings,
        data: &mut MachinesCounter,
    ) {
        while data.available() < machine.idle_count
            && (runner.limit == 0 || data.total() < runner.limit)
        {
            // Nobody waits for pool-filling creations
            let _ = self.schedule_creation(machine, runner, MachineState::Idle);
            data.creating += 1;
        }
    }

    fn schedule_creation(
        self: &Arc<Self>,
        machine: &MachineSettings,
        runner: &RunnerConfig,
        target: MachineState,
    ) -> (MachineLease, CreationResult) {
        let name = naming::new_machine_name(runner);
        self.machines.insert_creating(&name);

        let (done, result) = oneshot::channel();
        let manager = Arc::clone(self);
        let settings = machine.clone();
        let lease = MachineLease::new(name.clone());

        self.tasks.spawn(async move {
            let outcome = tokio::select! {
                outcome = manager.create_machine(&settings, &name, target) => outcome,
                () = manager.cancel.cancelled() => {
                    warn!(name = %name, "Machine creation interrupted by shutdown");
                    Err(PoolError::ShuttingDown)
                }
            };
            let _ = done.send(outcome);
        });

        (lease, result)
    }

    async fn create_machine(
        self: &Arc<Self>,
        settings: &MachineSettings,
        name: &str,
        target: MachineState,
    ) -> PoolResult<()> {
        let started = Instant::now();

        let mut result = self
            .command
            .create(&settings.machine_driver, name, &settings.machine_options)
            .await;

        let mut provisions = 0;
        while let Err(err) = &result {
            if provisions >= self.pool.provision_retries {
                break;
            }
            provisions += 1;

            let retry_count = self
                .machines
                .update(name, |record| {
                    record.retry_count += 1;
                    record.retry_count
                })
                .unwrap_or(provisions);
            warn!(name, retry_count, error = %err, "Machine creation failed, trying to provision");

            tokio::time::sleep(self.pool.provision_retry_interval()).await;
            result = self.command.provision(name).await;
        }

        if let Err(source) = result {
            error!(
                name,
                elapsed = ?started.elapsed(),
                error = %source,
                "Machine creation failed, trying to remove"
            );
            if let Err(err) = self.schedule_removal(name, "Failed to create") {
                error!(name, error = %err, "Machine removal failed");
            }
            return Err(PoolError::CreationFailed {
                name: name.to_string(),
                source,
            });
        }

        let updated = self.machines.update(name, |record| {
            record.state = target;
            record.used = Utc::now();
        });
        if updated.is_none() {
            return Err(PoolError::CreationAbandoned(name.to_string()));
        }

        let duration = started.elapsed();
        self.metrics.observe_creation(duration);
        self.metrics.action(ACTION_CREATED);
        info!(name, duration = ?duration, state = %target, "Machine created");

        Ok(())
    }

    /// Newest machine that can be pre-claimed and answers; unreachable ones
    /// are scheduled for removal on the way
    async fn find_free_machine(
        self: &Arc<Self>,
        names: &[String],
        skip_cache: bool,
    ) -> Option<MachineLease> {
        for name in names.iter().rev() {
            if !self.machines.try_acquire(name) {
                continue;
            }

            if !self.command.can_connect(name, skip_cache).await {
                if let Err(err) = self.schedule_removal(name, "machine is unavailable") {
                    error!(name, error = %err, "Machine removal failed");
                }
                continue;
            }

            return Some(MachineLease::new(name.as_str()));
        }

        None
    }

    async fn retry_find_or_create(self: &Arc<Self>, runner: &RunnerConfig) -> PoolResult<MachineLease> {
        let attempts = self.pool.use_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.find_or_create(runner).await {
                Ok(lease) => return Ok(lease),
                Err(err) if err.is_shutting_down() => return Err(err),
                Err(err) => {
                    warn!(attempt, error = %err, "Couldn't find or create a machine");
                    last_error = Some(err);
                }
            }

            if attempt < attempts {
                tokio::select! {
                    () = tokio::time::sleep(self.pool.provision_retry_interval()) => {}
                    () = self.cancel.cancelled() => return Err(PoolError::ShuttingDown),
                }
            }
        }

        Err(last_error.unwrap_or(PoolError::NoFreeMachines))
    }

    async fn find_or_create(self: &Arc<Self>, runner: &RunnerConfig) -> PoolResult<MachineLease> {
        let machine = runner
            .machine_settings()
            .ok_or(PoolError::MissingMachineOptions)?;
        let template = naming::machine_name_template(runner);
        let names = self.load_machine_names(&template).await?;

        if let Some(lease) = self.find_free_machine(&names, true).await {
            return Ok(lease);
        }

        let (lease, created) = self.schedule_creation(machine, runner, MachineState::Acquired);
        match created.await {
            Ok(Ok(())) => Ok(lease),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(PoolError::CreationAbandoned(lease.name)),
        }
    }

    async fn finalize_removal(&self, name: &str) {
        let max_attempts = self.pool.max_remove_attempts.max(1);
        let mut failures = 0;

        loop {
            let attempt = tokio::select! {
                attempt = self.remove_machine(name) => attempt,
                () = self.cancel.cancelled() => {
                    info!(name, "Machine removal interrupted by shutdown");
                    return;
                }
            };

            let Err(err) = attempt else {
                break;
            };

            failures += 1;
            if failures >= max_attempts {
                self.machines.update(name, |record| record.removal_failed = true);
                error!(
                    name,
                    attempts = failures,
                    error = %err,
                    "Machine removal failed permanently"
                );
                self.metrics.action(ACTION_REMOVAL_FAILED);
                return;
            }
        }

        self.machines.remove(name);
        info!(name, "Machine removed");
        self.metrics.action(ACTION_REMOVED);
    }

    async fn remove_machine(&self, name: &str) -> ToolResult<()> {
        if !self.command.exist(name).await {
            warn!(name, "Skipping machine removal, because it doesn't exist");
            return Ok(());
        }

        let stuck = self
            .machines
            .get(name)
            .is_some_and(|record| record.is_stuck_on_remove(self.pool.stuck_remove_threshold));
        let stuck_guard = if stuck {
            Some(self.stuck_remove_lock.lock().await)
        } else {
            None
        };

        warn!(name, "Stopping machine");
        if let Err(err) = self.command.stop(name, self.pool.stop_timeout()).await {
            warn!(name, error = %err, "Error while stopping machine");
        }

        warn!(name, "Removing machine");
        let removed = self.command.remove(name).await;
        // Back-off below runs without blocking other stuck removals
        drop(stuck_guard);

        if let Err(err) = removed {
            let retry_count = self
                .machines
                .update(name, |record| {
                    record.retry_count += 1;
                    record.retry_count
                })
                .unwrap_or(1);
            let backoff = self.pool.remove_backoff(retry_count);
            warn!(name, retry_count, backoff = ?backoff, error = %err, "Machine removal failed, retrying");

            tokio::time::sleep(backoff).await;
            return Err(err);
        }

        Ok(())
    }

    /// Dump `record` to the diagnostics directory from a blocking task
    fn write_diagnostics(&self, record: &MachineRecord) {
        let Some(dir) = self.diagnostics_dir.clone() else {
            return;
        };

        let record = record.clone();
        self.tasks.spawn_blocking(move || {
            if let Err(e) = record.write_diagnostics(&dir) {
                warn!(name = %record.name, error = %e, "Failed to write machine diagnostics");
            }
        });
    }
}

/// Why an idle machine should go, if it should
fn redundancy(
    record: &MachineRecord,
    runner: &RunnerConfig,
    machine: &MachineSettings,
    data: &MachinesCounter,
) -> Option<&'static str> {
    if record.state != MachineState::Idle {
        return None;
    }

    if machine.max_builds > 0 && record.used_count >= machine.max_builds {
        return Some("too many builds");
    }

    if runner.limit > 0 && data.total() >= runner.limit {
        return Some("too many machines");
    }

    if record.unused_for() > machine.idle_time() && data.idle >= machine.idle_count {
        return Some("too many idle machines");
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedMachineCommand;
    use chrono::TimeDelta;

    fn runner(idle_count: usize, limit: usize, max_builds: usize) -> Arc<RunnerConfig> {
        Arc::new(RunnerConfig {
            name: "autoscaled".to_string(),
            token: "abcdefgh1234".to_string(),
            limit,
            machine: Some(MachineSettings {
                idle_count,
                idle_time_secs: 600,
                max_builds,
                machine_driver: "virtualbox".to_string(),
                machine_name: "auto-%s".to_string(),
                machine_options: vec!["virtualbox-memory=1024".to_string()],
            }),
            ..RunnerConfig::default()
        })
    }

    fn config(stuck_remove_threshold: u32) -> Config {
        Config {
            pool: PoolConfig {
                provision_retry_interval_ms: 1,
                remove_retry_interval_ms: 1,
                remove_retry_max_interval_ms: 4,
                stuck_remove_threshold,
                max_remove_attempts: 3,
                ..PoolConfig::default()
            },
            ..Config::default()
        }
    }

    fn manager(
        command: &Arc<ScriptedMachineCommand>,
        config: &Config,
    ) -> Arc<MachinePoolManager> {
        let command: Arc<dyn MachineCommand> = command.clone();
        MachinePoolManager::new("docker+machine", command, config).unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_redundancy_rules() {
        let runner = runner(1, 3, 2);
        let machine = runner.machine_settings().unwrap();
        let mut record = MachineRecord::new("runner-abcdefgh-auto-1");
        record.used_count = 0;

        let empty = MachinesCounter::default();
        assert_eq!(redundancy(&record, &runner, machine, &empty), None);

        record.used_count = 2;
        assert_eq!(redundancy(&record, &runner, machine, &empty), Some("too many builds"));

        record.used_count = 0;
        let full = MachinesCounter {
            used: 3,
            ..MachinesCounter::default()
        };
        assert_eq!(redundancy(&record, &runner, machine, &full), Some("too many machines"));

        record.used = Utc::now() - TimeDelta::hours(1);
        let one_idle = MachinesCounter {
            idle: 1,
            ..MachinesCounter::default()
        };
        assert_eq!(
            redundancy(&record, &runner, machine, &one_idle),
            Some("too many idle machines")
        );
        assert_eq!(redundancy(&record, &runner, machine, &empty), None);

        record.state = MachineState::Used;
        assert_eq!(redundancy(&record, &runner, machine, &full), None);
    }

    #[tokio::test]
    async fn test_missing_machine_options() {
        let command = Arc::new(ScriptedMachineCommand::new());
        let pool = manager(&command, &config(3));
        let runner = RunnerConfig::default();

        let err = pool.acquire(&runner).await.unwrap_err();
        assert!(matches!(err, PoolError::MissingMachineOptions));
    }

    #[tokio::test]
    async fn test_creation_retries_provisioning() {
        let command = Arc::new(ScriptedMachineCommand::new());
        command.fail_creates(true);
        let pool = manager(&command, &config(3));

        let (job, lease) = pool.use_machine(&runner(0, 0, 0), None).await.unwrap();
        let lease = lease.expect("machine created for this job");
        assert_eq!(job.docker.credentials.host, format!("tcp://{}:2376", lease.name()));
        assert_eq!(command.provision_calls(), 1);
        assert_eq!(pool.metrics().action_count(ACTION_CREATED), 1);
    }

    #[tokio::test]
    async fn test_failed_creation_schedules_removal() {
        let command = Arc::new(ScriptedMachineCommand::new());
        command.fail_creates(true);
        command.fail_provisions(true);
        let mut config = config(3);
        config.pool.use_attempts = 1;
        let pool = manager(&command, &config);

        let err = pool.use_machine(&runner(0, 0, 0), None).await.unwrap_err();
        let PoolError::FindOrCreate(inner) = err else {
            panic!("unexpected error: {err}");
        };
        assert!(matches!(*inner, PoolError::CreationFailed { .. }));
        assert_eq!(command.provision_calls(), 3);

        wait_until(|| pool.machines().is_empty()).await;
        assert_eq!(command.removed().len(), 1);
        assert!(command.machines().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_machine_is_removed() {
        let command = Arc::new(ScriptedMachineCommand::new());
        let runner = runner(0, 0, 0);
        let name = naming::new_machine_name(&runner);
        command.add_machine(&name);
        command.set_unreachable(&name, true);
        let pool = manager(&command, &config(3));

        assert_eq!(pool.acquire(&runner).await.unwrap(), None);

        wait_until(|| command.removed().contains(&name)).await;
        wait_until(|| pool.machines().get(&name).is_none()).await;
    }

    #[tokio::test]
    async fn test_removal_gives_up_and_is_rescheduled() {
        let command = Arc::new(ScriptedMachineCommand::new());
        let runner = runner(0, 0, 0);
        let name = naming::new_machine_name(&runner);
        command.add_machine(&name);
        command.fail_removes(3);
        let pool = manager(&command, &config(100));

        pool.machines().observe(&name);
        pool.schedule_removal(&name, "too many builds").unwrap();

        wait_until(|| pool.metrics().action_count(ACTION_REMOVAL_FAILED) == 1).await;
        let record = pool.machines().get(&name).unwrap();
        assert!(record.removal_failed);
        assert_eq!(record.retry_count, 3);
        let counter = pool.machines().count(100, Duration::from_secs(60));
        assert_eq!(counter.stuck_on_removing, 1);

        // Next inventory pass still lists the host and retries its removal
        pool.acquire(&runner).await.unwrap();
        wait_until(|| pool.machines().get(&name).is_none()).await;
        assert_eq!(pool.metrics().action_count(ACTION_REMOVED), 1);
    }

    #[tokio::test]
    async fn test_duplicate_removal_is_ignored() {
        let command = Arc::new(
            ScriptedMachineCommand::new().with_stop_delay(Duration::from_millis(50)),
        );
        command.add_machine("auto-1");
        let pool = manager(&command, &config(100));
        pool.machines().observe("auto-1");

        pool.schedule_removal("auto-1", "too many builds").unwrap();
        pool.schedule_removal("auto-1", "machine is unavailable").unwrap();

        wait_until(|| pool.machines().is_empty()).await;
        assert_eq!(command.stop_calls(), 1);
        assert!(matches!(
            pool.schedule_removal("auto-1", "again"),
            Err(PoolError::MachineNotFound(_))
        ));
    }

    async fn remove_two_machines(stuck_remove_threshold: u32) -> usize {
        let command = Arc::new(
            ScriptedMachineCommand::new().with_stop_delay(Duration::from_millis(100)),
        );
        let pool = manager(&command, &config(stuck_remove_threshold));
        for name in ["auto-1", "auto-2"] {
            command.add_machine(name);
            pool.machines().observe(name);
        }

        pool.schedule_removal("auto-1", "machine is unavailable").unwrap();
        pool.schedule_removal("auto-2", "machine is unavailable").unwrap();
        wait_until(|| pool.machines().is_empty()).await;

        command.max_concurrent_stops()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stuck_removals_are_serialized() {
        // A threshold of zero makes every removal count as stuck
        assert_eq!(remove_two_machines(0).await, 1);
        assert_eq!(remove_two_machines(100).await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stuck_removal_backoff_does_not_block_others() {
        let command = Arc::new(ScriptedMachineCommand::new());
        let mut config = config(0);
        config.pool.remove_retry_interval_ms = 3000;
        config.pool.remove_retry_max_interval_ms = 3000;
        let pool = manager(&command, &config);
        for name in ["auto-a", "auto-b"] {
            command.add_machine(name);
            pool.machines().observe(name);
        }

        // First rm of auto-a fails and puts it into its back-off
        command.fail_removes(1);
        pool.schedule_removal("auto-a", "machine is unavailable").unwrap();
        wait_until(|| pool.machines().get("auto-a").is_some_and(|r| r.retry_count == 1)).await;

        let started = Instant::now();
        pool.schedule_removal("auto-b", "machine is unavailable").unwrap();
        wait_until(|| pool.machines().get("auto-b").is_none()).await;

        assert!(
            started.elapsed() < Duration::from_secs(1),
            "auto-b waited {:?}",
            started.elapsed()
        );
        assert!(pool.machines().get("auto-a").is_some());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let command = Arc::new(ScriptedMachineCommand::new());
        let pool = manager(&command, &config(3));

        pool.shutdown().await;

        assert!(pool.is_shutting_down());
        let err = pool.acquire(&runner(1, 0, 0)).await.unwrap_err();
        assert!(err.is_shutting_down());
        let err = pool.use_machine(&runner(1, 0, 0), None).await.unwrap_err();
        assert!(err.is_shutting_down());
    }
}
