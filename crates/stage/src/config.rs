use channel::paths::{self, DEFAULT_CAPACITY, DEFAULT_RENDEZVOUS_TIMEOUT, DEFAULT_SHM_DIR};
use channel::{ChannelConfig, MAX_SLOTS};
use common::config::{env_millis, env_or};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub use common::Environment;

pub const DEFAULT_CHANNEL: &str = "positions";

#[derive(Debug, Clone)]
pub struct StageConfig {
    pub environment: Environment,
    pub channel_name: String,
    pub capacity: usize,
    pub shm_dir: PathBuf,
    /// `None` lets the Sink wait for slow Sources forever.
    pub rendezvous_timeout: Option<Duration>,
    pub publish_hz: f64,
    pub connect_retries: u32,
    pub otel_endpoint: Option<String>,
}

impl StageConfig {
    /// Load configuration from environment variables with sensible defaults
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            environment: Environment::from_env(),
            channel_name: env::var("CHANNEL_NAME").unwrap_or_else(|_| DEFAULT_CHANNEL.to_string()),
            capacity: env_or("CHANNEL_CAPACITY", DEFAULT_CAPACITY),
            shm_dir: env::var("SHM_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_SHM_DIR)),
            rendezvous_timeout: env_millis(
                "RENDEZVOUS_TIMEOUT_MS",
                Some(DEFAULT_RENDEZVOUS_TIMEOUT),
            ),
            publish_hz: env_or("PUBLISH_HZ", 30.0),
            connect_retries: env_or("CONNECT_RETRIES", 10),
            otel_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|s| !s.is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        paths::validate_name(&self.channel_name)?;
        if !(1..=MAX_SLOTS).contains(&self.capacity) {
            anyhow::bail!(
                "CHANNEL_CAPACITY must be between 1 and {}, got {}",
                MAX_SLOTS,
                self.capacity
            );
        }
        if !(self.publish_hz.is_finite() && self.publish_hz > 0.0) {
            anyhow::bail!("PUBLISH_HZ must be positive, got {}", self.publish_hz);
        }
        Ok(())
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig::default()
            .with_shm_dir(&self.shm_dir)
            .with_capacity(self.capacity)
            .with_rendezvous_timeout(self.rendezvous_timeout)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.publish_hz)
    }

    /// Create default configuration for testing
    #[cfg(test)]
    pub fn test_default() -> Self {
        Self {
            environment: Environment::Development,
            channel_name: DEFAULT_CHANNEL.to_string(),
            capacity: DEFAULT_CAPACITY,
            shm_dir: PathBuf::from(DEFAULT_SHM_DIR),
            rendezvous_timeout: Some(DEFAULT_RENDEZVOUS_TIMEOUT),
            publish_hz: 30.0,
            connect_retries: 10,
            otel_endpoint: None,
        }
    }
}
