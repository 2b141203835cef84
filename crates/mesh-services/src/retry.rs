//! Bounded retry with a fixed delay between attempts.
//!
//! The contract is on attempt count and delay only: no exponential growth,
//! no jitter, and no sleep after the final attempt.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use mesh_core::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

/// The last error seen once every attempt has failed.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last: E,
}

impl RetryPolicy {
    /// `attempts` is clamped to at least one.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn connect(config: &RetryConfig) -> Self {
        Self::new(config.connect_attempts, config.backoff())
    }

    pub fn register(config: &RetryConfig) -> Self {
        Self::new(config.register_attempts, config.backoff())
    }

    pub fn deregister(config: &RetryConfig) -> Self {
        Self::new(config.deregister_attempts, config.backoff())
    }

    pub fn discovery(config: &RetryConfig) -> Self {
        Self::new(config.discovery_attempts, config.backoff())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    ///
    /// `op` receives the 1-based attempt number. Each failure is logged with
    /// `what` and the attempt count.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, Exhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.attempts => {
                    return Err(Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    tracing::info!(
                        operation = what,
                        error = %e,
                        retry_count = attempt,
                        "operation failed, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
