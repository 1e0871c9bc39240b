use crate::config::Environment;
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info";

/// Filter from `RUST_LOG`, defaulting to "info".
pub(crate) fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install `subscriber` globally with the output format for `environment`:
/// JSON lines in production, pretty multi-line output in development.
pub(crate) fn install<S>(subscriber: S, environment: Environment)
where
    S: Subscriber + for<'a> LookupSpan<'a> + Send + Sync + 'static,
{
    match environment {
        Environment::Production => {
            subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_level(true)
                        .with_current_span(true),
                )
                .init();
        }
        Environment::Development => {
            subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_ansi(true)
                        .with_target(false),
                )
                .init();
        }
    }
}

/// Initialize logging for a process that does not export telemetry.
///
/// Use [`TelemetryGuard::init`](crate::TelemetryGuard::init) instead when an
/// OTLP endpoint is configured, it installs the same output plus the
/// OpenTelemetry bridge.
pub fn setup_logging(environment: Environment) {
    install(tracing_subscriber::registry().with(env_filter()), environment);
}
