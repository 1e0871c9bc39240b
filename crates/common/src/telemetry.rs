use crate::Environment;
use crate::logging::{env_filter, install};
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Meter;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::{MetricExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    Resource,
    metrics::{PeriodicReader, SdkMeterProvider},
    propagation::TraceContextPropagator,
    trace::{Sampler, SdkTracerProvider},
};
use opentelemetry_semantic_conventions::attribute::SERVICE_VERSION;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;

const METRIC_EXPORT_INTERVAL: Duration = Duration::from_secs(10);

/// OTLP export of traces and metrics for one stage process.
///
/// Both providers are flushed and shut down when the guard is dropped. The
/// batch exporters spawn onto Tokio, so create the guard inside a runtime
/// that outlives it:
///
/// ```ignore
/// let runtime = tokio::runtime::Runtime::new()?;
/// let telemetry = runtime.block_on(async {
///     TelemetryGuard::init("source-stage", &endpoint, Environment::from_env())
/// })?;
/// let reads = telemetry.meter().u64_counter("channel_reads_total").build();
/// ```
pub struct TelemetryGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
    service_name: &'static str,
}

impl TelemetryGuard {
    /// Register the global providers and install the `tracing` subscriber,
    /// with the same console output as [`setup_logging`](crate::setup_logging)
    /// plus a layer that forwards spans to the collector at `endpoint`.
    pub fn init(
        service_name: &'static str,
        endpoint: &str,
        environment: Environment,
    ) -> anyhow::Result<Self> {
        let resource = stage_resource(service_name, environment);
        let tracer_provider = build_tracer_provider(endpoint, resource.clone())?;
        let meter_provider = build_meter_provider(endpoint, resource)?;

        global::set_text_map_propagator(TraceContextPropagator::new());
        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());

        let tracer = tracer_provider.tracer(service_name);
        install(
            tracing_subscriber::registry()
                .with(env_filter())
                .with(tracing_opentelemetry::layer().with_tracer(tracer)),
            environment,
        );

        Ok(Self {
            tracer_provider,
            meter_provider,
            service_name,
        })
    }

    /// Meter scoped to this service.
    pub fn meter(&self) -> Meter {
        global::meter(self.service_name)
    }
}

fn stage_resource(service_name: &'static str, environment: Environment) -> Resource {
    Resource::builder()
        .with_service_name(service_name)
        .with_attributes([
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
            KeyValue::new("deployment.environment", environment.as_str()),
        ])
        .build()
}

fn build_tracer_provider(endpoint: &str, resource: Resource) -> anyhow::Result<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_resource(resource)
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::AlwaysOn)))
        .with_batch_exporter(exporter)
        .build())
}

fn build_meter_provider(endpoint: &str, resource: Resource) -> anyhow::Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(METRIC_EXPORT_INTERVAL)
        .build();

    Ok(SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build())
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // The subscriber may already be torn down, stderr still works
        let shutdowns = [
            ("tracer", self.tracer_provider.shutdown()),
            ("meter", self.meter_provider.shutdown()),
        ];
        for (provider, result) in shutdowns {
            if let Err(e) = result {
                eprintln!("Failed to shut down {provider} provider: {e:?}");
            }
        }
    }
}

/// Creates an info-level span and enters it.
#[macro_export]
macro_rules! span {
    ($name:literal $(, $($fields:tt)*)?) => {
        tracing::info_span!($name $(, $($fields)*)?).entered()
    };
}

/// Creates a debug-level span and enters it.
#[macro_export]
macro_rules! span_debug {
    ($name:literal $(, $($fields:tt)*)?) => {
        tracing::debug_span!($name $(, $($fields)*)?).entered()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_macros_accept_fields() {
        let outer = span!("stage", channel = "positions");
        let inner = span_debug!("rendezvous", readers = 2);
        drop(inner);
        drop(outer);
    }

    #[test]
    fn test_resource_names_service_and_environment() {
        let resource = stage_resource("sink-stage", Environment::Production);

        assert_eq!(
            resource
                .get(&opentelemetry::Key::from_static_str("service.name"))
                .map(|v| v.to_string()),
            Some("sink-stage".to_string())
        );
        assert_eq!(
            resource
                .get(&opentelemetry::Key::from_static_str("deployment.environment"))
                .map(|v| v.to_string()),
            Some("production".to_string())
        );
    }
}
