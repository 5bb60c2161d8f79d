use crate::config::RetryConfig;
use crate::error::Result;
use std::time::Duration;

/// Bounded exponential backoff for store operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier.max(1.0),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the given retry (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.max_backoff)
    }

    /// Runs `op` until it succeeds, fails with a final error, or attempts run out.
    ///
    /// Lock timeouts get the full attempt budget; transient I/O failures are
    /// retried once before being surfaced.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        let mut io_retried = false;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    if let crate::error::SentinelError::Storage { .. } = e {
                        if io_retried {
                            return Err(e);
                        }
                        io_retried = true;
                    }
                    let delay = self.backoff_for(attempt);
                    log::warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        what,
                        attempt,
                        self.max_attempts,
                        delay,
                        e
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SentinelError;
    use std::cell::Cell;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            backoff_multiplier: 2.0,
        })
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_for(10), Duration::from_millis(100));
    }

    #[test]
    fn test_concurrency_retried_until_success() {
        let calls = Cell::new(0);
        let result = fast_policy().run("op", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(SentinelError::Concurrency("locked".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_concurrency_surfaces_after_budget() {
        let calls = Cell::new(0);
        let result: Result<()> = fast_policy().run("op", || {
            calls.set(calls.get() + 1);
            Err(SentinelError::Concurrency("locked".into()))
        });
        assert!(matches!(result, Err(SentinelError::Concurrency(_))));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_transient_io_retried_once() {
        let calls = Cell::new(0);
        let result: Result<()> = fast_policy().run("op", || {
            calls.set(calls.get() + 1);
            Err(SentinelError::Storage {
                message: "disk I/O error".into(),
                transient: true,
            })
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_validation_not_retried() {
        let calls = Cell::new(0);
        let result: Result<()> = fast_policy().run("op", || {
            calls.set(calls.get() + 1);
            Err(SentinelError::Validation("bad".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
