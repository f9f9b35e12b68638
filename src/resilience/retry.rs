// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry with exponential backoff for backend connections.
//!
//! Only connection setup retries. Per-request failures go straight back to
//! the caller: a cache hiccup is absorbed by falling through to the store,
//! and a store error is the answer.
//!
//! # Example
//!
//! ```
//! use banner_engine::RetryConfig;
//! use std::time::Duration;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.attempts, 5);
//! assert_eq!(startup.initial_delay, Duration::from_millis(200));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Backoff schedule for connection attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts before giving up, including the first.
    pub attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::startup()
    }
}

impl RetryConfig {
    /// Fast-fail schedule for initial connections.
    /// 5 attempts, failing after roughly 3 seconds of backoff, so a bad URL
    /// surfaces at startup instead of on the first request.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    #[cfg(test)]
    fn test() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }
}

/// Run `connect` until it succeeds or `schedule` runs out of attempts.
///
/// `backend` labels the log lines (`"sql"`, `"redis"`, ...). The error of
/// the last attempt is returned as is.
pub async fn retry<F, Fut, T, E>(
    backend: &'static str,
    schedule: &RetryConfig,
    mut connect: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = schedule.initial_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match connect().await {
            Ok(connected) => {
                if attempt > 1 {
                    info!(backend, attempt, "Backend reachable after backoff");
                }
                return Ok(connected);
            }
            Err(err) => err,
        };

        if attempt >= schedule.attempts {
            warn!(backend, attempt, error = %err, "Backend unreachable, giving up");
            return Err(err);
        }

        debug!(backend, attempt, error = %err, ?delay, "Backend not ready, backing off");
        sleep(delay).await;
        delay = schedule.next_delay(delay);
    }
}
