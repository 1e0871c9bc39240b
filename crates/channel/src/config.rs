use crate::paths::{DEFAULT_CAPACITY, DEFAULT_RENDEZVOUS_TIMEOUT, DEFAULT_SHM_DIR};
use crate::retry::RetryConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Per-handle channel settings.
///
/// `capacity` only matters to the Sink that creates the segment; Sources
/// take it from the segment.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub shm_dir: PathBuf,
    pub capacity: usize,
    /// `None` waits for slow Sources forever.
    pub rendezvous_timeout: Option<Duration>,
    pub attach_retry: RetryConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            shm_dir: PathBuf::from(DEFAULT_SHM_DIR),
            capacity: DEFAULT_CAPACITY,
            rendezvous_timeout: Some(DEFAULT_RENDEZVOUS_TIMEOUT),
            attach_retry: RetryConfig::default(),
        }
    }
}

impl ChannelConfig {
    pub fn with_shm_dir(mut self, shm_dir: impl Into<PathBuf>) -> Self {
        self.shm_dir = shm_dir.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_rendezvous_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.rendezvous_timeout = timeout;
        self
    }
}
