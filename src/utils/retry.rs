//! Retry utilities for fault tolerance
//!
//! Provides bounded retry policies for transient failures: a fixed short
//! backoff for the service channel and exponential backoff for file writes.

use std::time::Duration;
use tokio::time::sleep;

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Constant delay between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay to wait after the given (zero based) attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let delay = Duration::from_secs_f64(self.initial_delay.as_secs_f64() * factor);
        std::cmp::min(delay, self.max_delay)
    }

    /// Upper bound of the time spent waiting across all attempts
    pub fn total_budget(&self) -> Duration {
        (0..self.max_attempts).map(|a| self.delay_for(a)).sum()
    }
}

/// Retry an async operation with backoff
pub async fn retry_async_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if attempt >= config.max_attempts {
                    return Err(e);
                }
                let delay = config.delay_for(attempt - 1);
                tracing::debug!(
                    "Operation failed (attempt {}/{}): {}. Retrying in {:?}...",
                    attempt,
                    config.max_attempts,
                    e,
                    delay
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_fixed_delays() {
        let config = RetryConfig::fixed(3, Duration::from_millis(25));
        assert_eq!(config.delay_for(0), Duration::from_millis(25));
        assert_eq!(config.delay_for(2), Duration::from_millis(25));
        assert_eq!(config.total_budget(), Duration::from_millis(75));
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            backoff_multiplier: 2.0,
        };
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(4), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_retry_stops_at_max_attempts() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::fixed(3, Duration::from_millis(1));
        let result: Result<(), String> = retry_async_with_backoff(&config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("nope".to_string())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::fixed(5, Duration::from_millis(1));
        let result: Result<u32, String> = retry_async_with_backoff(&config, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err("later".to_string())
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result, Ok(2));
    }
}
