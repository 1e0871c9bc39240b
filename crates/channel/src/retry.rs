use std::time::Duration;

/// Backoff used while attaching to a segment whose creator has not finished
/// building it yet.
///
/// Defaults give a creator roughly half a second:
/// - 16 attempts with 200µs base delay
/// - Exponential backoff capped at 50ms
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of polls before giving up
    pub max_attempts: u32,
    /// Initial delay between polls (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap (backoff won't exceed this)
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 16,
            base_delay: Duration::from_micros(200),
            max_delay: Duration::from_millis(50),
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt using exponential backoff
    pub(crate) fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }

    /// Poll `f` until it yields a value, sleeping between attempts.
    ///
    /// Errors from `f` propagate immediately. Returns `Ok(None)` when every
    /// attempt came back empty.
    pub(crate) fn poll<T, E>(
        &self,
        mut f: impl FnMut() -> Result<Option<T>, E>,
    ) -> Result<Option<T>, E> {
        for attempt in 0..self.max_attempts {
            if let Some(value) = f()? {
                return Ok(Some(value));
            }
            if attempt + 1 < self.max_attempts {
                std::thread::sleep(self.delay_for_attempt(attempt));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 16);
        assert_eq!(config.base_delay, Duration::from_micros(200));
        assert_eq!(config.max_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_exponential_backoff_calculation() {
        let config = RetryConfig::default();

        assert_eq!(config.delay_for_attempt(0), Duration::from_micros(200));
        assert_eq!(config.delay_for_attempt(1), Duration::from_micros(400));
        assert_eq!(config.delay_for_attempt(3), Duration::from_micros(1600));
        // 200µs * 2^8 = 51.2ms, capped
        assert_eq!(config.delay_for_attempt(8), Duration::from_millis(50));
        assert_eq!(config.delay_for_attempt(40), Duration::from_millis(50));
    }

    #[test]
    fn test_poll_returns_first_value() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_micros(1),
            max_delay: Duration::from_micros(10),
        };
        let mut calls = 0;

        let result: Result<Option<u32>, ()> = config.poll(|| {
            calls += 1;
            Ok((calls == 3).then_some(calls))
        });

        assert_eq!(result, Ok(Some(3)));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_poll_gives_up_and_propagates_errors() {
        let config = RetryConfig {
            max_attempts: 4,
            base_delay: Duration::from_micros(1),
            max_delay: Duration::from_micros(10),
        };

        let mut calls = 0;
        let empty: Result<Option<u32>, ()> = config.poll(|| {
            calls += 1;
            Ok(None)
        });
        assert_eq!(empty, Ok(None));
        assert_eq!(calls, 4);

        let failed: Result<Option<u32>, &str> = config.poll(|| Err("boom"));
        assert_eq!(failed, Err("boom"));
    }
}
