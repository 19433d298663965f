use machine_pool::tracing as trace_mod;

use anyhow::{Context, Result};
use prometheus::Registry;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use machine_pool::command::{DockerMachineCommand, MachineCommand};
use machine_pool::config::{Config, DOCKER_MACHINE_EXECUTOR, RunnerConfig};
use machine_pool::metrics::start_metrics_server;
use machine_pool::provider::MachinePoolManager;
use machine_pool::testing::ScriptedMachineCommand;

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = trace_mod::init_tracing() {
        eprintln!("Failed to initialize tracing: {}", e);
    }

    info!("Starting machine pool");

    let config = Config::load().context("Failed to load configuration")?;

    // MACHINE_POOL_DRY_RUN keeps every machine in memory
    let command: Arc<dyn MachineCommand> = if dry_run() {
        warn!("Dry run: machines are simulated in memory");
        Arc::new(ScriptedMachineCommand::new())
    } else {
        Arc::new(DockerMachineCommand::new(&config.tool))
    };

    let pool = MachinePoolManager::new(DOCKER_MACHINE_EXECUTOR, command, &config)?;

    let registry = Registry::new();
    registry
        .register(Box::new(pool.collector()))
        .context("Failed to register machine pool metrics")?;

    let runners: Vec<Arc<RunnerConfig>> = config
        .machine_runners()
        .filter(|runner| runner.machine_settings().is_some())
        .cloned()
        .map(Arc::new)
        .collect();
    if runners.is_empty() {
        warn!("No {} runners with machine settings configured", DOCKER_MACHINE_EXECUTOR);
    }

    let metrics_port = config.metrics.port;
    let metrics_registry = registry.clone();
    let metrics_server = tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_registry, metrics_port).await {
            error!("Failed to start metrics server: {}", e);
        }
    });

    info!(
        runners = runners.len(),
        check_interval = ?config.check_interval(),
        "Machine pool started"
    );

    let mut interval = tokio::time::interval(config.check_interval());
    loop {
        tokio::select! {
            _ = interval.tick() => check_runners(&pool, &runners).await,
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
        }
    }

    info!("Shutting down machine pool");
    metrics_server.abort();
    pool.shutdown().await;
    trace_mod::shutdown_tracing();

    Ok(())
}

/// Keep each runner's idle pool sized, handing back any machine it pre-claims
async fn check_runners(pool: &Arc<MachinePoolManager>, runners: &[Arc<RunnerConfig>]) {
    for runner in runners {
        match pool.acquire(runner).await {
            Ok(Some(lease)) => {
                debug!(runner = %runner.name, name = lease.name(), "Free machine available");
                pool.release(runner, &lease);
            }
            Ok(None) => debug!(runner = %runner.name, "No free machine yet"),
            Err(e) if e.is_capacity_exhausted() => {
                info!(runner = %runner.name, "No free idle machines, waiting for creations");
            }
            Err(e) => error!(runner = %runner.name, error = %e, "Machine pool check failed"),
        }
    }
}

fn dry_run() -> bool {
    std::env::var("MACHINE_POOL_DRY_RUN")
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(false)
}
