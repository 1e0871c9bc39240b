use std::time::Duration;

/// Longest single sleep between attempts.
const MAX_DELAY_MS: u64 = 5_000;

/// Retry `f` with exponential backoff while `should_retry` accepts its error.
///
/// Errors rejected by `should_retry` are returned at once. At least one
/// attempt is made even when `max_retries` is 0.
pub fn retry_if<F, P, T, E>(
    mut f: F,
    mut should_retry: P,
    max_retries: u32,
    base_delay_ms: u64,
    operation_name: &str,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    P: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = max_retries.max(1);
    let mut attempt = 0;

    loop {
        let e = match f() {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };
        attempt += 1;

        if !should_retry(&e) {
            tracing::error!("{} failed: {}", operation_name, e);
            return Err(e);
        }

        if attempt >= attempts {
            tracing::error!(
                "{} failed after {} attempts: {}",
                operation_name,
                attempts,
                e
            );
            return Err(e);
        }

        let delay_ms = base_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt - 1))
            .min(MAX_DELAY_MS);
        tracing::warn!(
            "{} failed (attempt {}/{}): {}. Retrying in {}ms...",
            operation_name,
            attempt,
            attempts,
            e,
            delay_ms
        );
        std::thread::sleep(Duration::from_millis(delay_ms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeds_after_failures() {
        let mut calls = 0;
        let result: Result<u32, String> = retry_if(
            || {
                calls += 1;
                if calls < 3 {
                    Err(format!("not yet ({calls})"))
                } else {
                    Ok(calls)
                }
            },
            |_| true,
            5,
            1,
            "flaky",
        );

        assert_eq!(result, Ok(3));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let mut calls = 0;
        let result: Result<(), &str> = retry_if(
            || {
                calls += 1;
                Err("down")
            },
            |_| true,
            4,
            1,
            "always failing",
        );

        assert_eq!(result, Err("down"));
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_permanent_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), &str> = retry_if(
            || {
                calls += 1;
                Err("full")
            },
            |e| *e != "full",
            10,
            1,
            "connect",
        );

        assert_eq!(result, Err("full"));
        assert_eq!(calls, 1, "A permanent error must be returned at once");
    }

    #[test]
    fn test_zero_retries_still_attempts_once() {
        let mut calls = 0;
        let result: Result<u8, &str> = retry_if(
            || {
                calls += 1;
                Ok(1)
            },
            |_| true,
            0,
            1,
            "once",
        );

        assert_eq!(result, Ok(1));
        assert_eq!(calls, 1);
    }
}
