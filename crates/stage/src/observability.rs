use crate::config::StageConfig;
use common::{TelemetryGuard, setup_logging};
use opentelemetry::global;
use opentelemetry::metrics::Meter;
use tokio::runtime::Runtime;

/// Logging, and OTLP export when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
///
/// Keep it alive for the whole process; dropping it flushes telemetry.
pub struct Observability {
    // Dropped before the runtime its exporters run on
    telemetry: Option<TelemetryGuard>,
    _runtime: Option<Runtime>,
    service_name: &'static str,
}

impl Observability {
    pub fn init(service_name: &'static str, config: &StageConfig) -> anyhow::Result<Self> {
        let Some(endpoint) = config.otel_endpoint.as_deref() else {
            setup_logging(config.environment);
            return Ok(Self {
                telemetry: None,
                _runtime: None,
                service_name,
            });
        };

        let runtime = Runtime::new()?;
        let guard = runtime
            .block_on(async { TelemetryGuard::init(service_name, endpoint, config.environment) })?;
        tracing::info!(endpoint, "Telemetry export enabled");

        Ok(Self {
            telemetry: Some(guard),
            _runtime: Some(runtime),
            service_name,
        })
    }

    pub fn meter(&self) -> Meter {
        match &self.telemetry {
            Some(guard) => guard.meter(),
            None => global::meter(self.service_name),
        }
    }
}
