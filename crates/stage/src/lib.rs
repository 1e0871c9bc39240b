pub mod config;
pub mod metrics;
pub mod observability;
pub mod shutdown;

pub use config::StageConfig;
pub use metrics::StageMetrics;
pub use observability::Observability;
