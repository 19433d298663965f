use anyhow::{Context, Result};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use crate::registry::MachineRegistry;

pub const ACTION_CREATED: &str = "created";
pub const ACTION_USED: &str = "used";
pub const ACTION_REMOVED: &str = "removed";
pub const ACTION_REMOVAL_FAILED: &str = "removal_failed";

/// Counters and histogram updated by one pool manager.
#[derive(Clone, Debug)]
pub struct PoolMetrics {
    actions: IntCounterVec,
    creation_duration: Histogram,
    states: IntGaugeVec,
}

impl PoolMetrics {
    pub fn new(executor: &str) -> Result<Self> {
        let actions = IntCounterVec::new(
            Opts::new(
                "autoscaling_actions_total",
                "The total number of actions executed by the provider.",
            )
            .const_label("executor", executor),
            &["action"],
        )
        .context("Failed to create autoscaling_actions_total metric")?;

        let creation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "autoscaling_machine_creation_duration_seconds",
                "Histogram of machine creation time.",
            )
            .const_label("executor", executor)
            .buckets(prometheus::exponential_buckets(30.0, 1.25, 10)?),
        )
        .context("Failed to create autoscaling_machine_creation_duration_seconds metric")?;

        let states = IntGaugeVec::new(
            Opts::new(
                "autoscaling_machine_states",
                "The current number of machines per state in this provider.",
            )
            .const_label("executor", executor),
            &["state"],
        )
        .context("Failed to create autoscaling_machine_states metric")?;

        // Export every action from the first scrape on
        for action in [ACTION_CREATED, ACTION_USED, ACTION_REMOVED] {
            actions.with_label_values(&[action]);
        }

        Ok(Self {
            actions,
            creation_duration,
            states,
        })
    }

    pub fn action(&self, action: &str) {
        self.actions.with_label_values(&[action]).inc();
    }

    pub fn action_count(&self, action: &str) -> u64 {
        self.actions.with_label_values(&[action]).get()
    }

    pub fn observe_creation(&self, duration: Duration) {
        self.creation_duration.observe(duration.as_secs_f64());
    }

    pub fn creation_count(&self) -> u64 {
        self.creation_duration.get_sample_count()
    }
}

/// Prometheus collector for one pool manager.
///
/// The per-state gauge is recomputed from the registry on every scrape.
pub struct PoolCollector {
    metrics: PoolMetrics,
    registry: Arc<MachineRegistry>,
    stuck_threshold: u32,
    dead_interval: Duration,
}

impl PoolCollector {
    pub(crate) fn new(
        metrics: PoolMetrics,
        registry: Arc<MachineRegistry>,
        stuck_threshold: u32,
        dead_interval: Duration,
    ) -> Self {
        Self {
            metrics,
            registry,
            stuck_threshold,
            dead_interval,
        }
    }
}

impl std::fmt::Debug for PoolCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolCollector")
            .field("machines", &self.registry.len())
            .field("stuck_threshold", &self.stuck_threshold)
            .finish_non_exhaustive()
    }
}

impl Collector for PoolCollector {
    fn desc(&self) -> Vec<&Desc> {
        let mut descs = self.metrics.actions.desc();
        descs.extend(self.metrics.creation_duration.desc());
        descs.extend(self.metrics.states.desc());
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let counter = self.registry.count(self.stuck_threshold, self.dead_interval);
        for (state, machines) in counter.by_state() {
            self.metrics
                .states
                .with_label_values(&[state])
                .set(i64::try_from(machines).unwrap_or(i64::MAX));
        }

        let mut families = self.metrics.actions.collect();
        families.extend(self.metrics.creation_duration.collect());
        families.extend(self.metrics.states.collect());
        families
    }
}

/// Text exposition of everything in `registry`
pub fn render(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    // If encoding fails, return empty metrics rather than panic
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Bind the metrics port and serve until the task is dropped
pub async fn start_metrics_server(registry: Registry, port: u16) -> Result<()> {
    use std::net::SocketAddr;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics server")?;

    tracing::info!("Metrics server listening on http://0.0.0.0:{}", port);

    serve_metrics(listener, registry).await
}

/// Answer every connection on `listener` with the current exposition
pub async fn serve_metrics(listener: TcpListener, registry: Registry) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((mut stream, _)) => {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let body = render(&registry);
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    if let Err(e) = stream.write_all(resp.as_bytes()).await {
                        tracing::error!("Metrics write error: {:?}", e);
                    }
                    let _ = stream.shutdown().await;
                });
            }
            Err(e) => {
                tracing::error!("Failed to accept connection: {:?}", e);
            }
        }
    }
}
