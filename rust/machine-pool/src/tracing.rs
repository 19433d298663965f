use opentelemetry::{global, trace::TracerProvider};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{Resource, trace};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use std::env;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{PoolError, PoolResult};

const DEFAULT_FILTER: &str = "machine_pool=info";

/// Initialize tracing, exporting spans over OTLP when `OTEL_ENABLED=true`
pub fn init_tracing() -> PoolResult<()> {
    let service_name =
        env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "machine-pool".to_string());
    let endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    if !otel_enabled() {
        return init_basic_tracing();
    }

    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .with_timeout(Duration::from_secs(3))
        .build()
        .map_err(|e| PoolError::ConfigurationError(format!("Failed to create exporter: {e}")))?;

    let tracer_provider = trace::TracerProvider::builder()
        .with_resource(Resource::new(vec![
            opentelemetry::KeyValue::new(SERVICE_NAME, service_name.clone()),
            opentelemetry::KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        ]))
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .build();

    global::set_tracer_provider(tracer_provider.clone());

    let otel_layer =
        tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer("machine-pool"));

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
        .try_init()
        .map_err(|e| PoolError::ConfigurationError(format!("Failed to install subscriber: {e}")))?;

    tracing::info!(
        service = service_name,
        endpoint = endpoint,
        "OpenTelemetry tracing initialized"
    );

    Ok(())
}

/// Initialize console tracing only; JSON lines when `LOG_FORMAT=json`
pub fn init_basic_tracing() -> PoolResult<()> {
    let subscriber = tracing_subscriber::registry().with(env_filter());

    let result = if env::var("LOG_FORMAT").unwrap_or_default() == "json" {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).try_init()
    };

    result.map_err(|e| PoolError::ConfigurationError(format!("Failed to install subscriber: {e}")))
}

/// Flush and stop the OTLP exporter
pub fn shutdown_tracing() {
    if otel_enabled() {
        global::shutdown_tracer_provider();
    }
}

fn otel_enabled() -> bool {
    env::var("OTEL_ENABLED")
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(false)
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_otel_disabled_by_default() {
        // SAFETY: These are test environment variables and we're in a controlled test environment
        unsafe {
            env::remove_var("OTEL_ENABLED");
        }
        assert!(!otel_enabled());

        // SAFETY: These are test environment variables and we're in a controlled test environment
        unsafe {
            env::set_var("OTEL_ENABLED", "true");
        }
        assert!(otel_enabled());

        // SAFETY: These are test environment variables and we're in a controlled test environment
        unsafe {
            env::remove_var("OTEL_ENABLED");
        }
    }

    #[test]
    #[serial]
    fn test_init_basic_tracing() {
        let _ = init_basic_tracing();

        // A second subscriber in the same process is rejected, not a panic
        assert!(init_basic_tracing().is_err());
    }
}
