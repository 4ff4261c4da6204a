// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: retry delays and interruptible retry waits.
//!
//! - [`RetryConfig`]: backoff schedule for transient failures
//! - [`await_retry`]: sleep that ends early when connectivity returns or
//!   the replication is paused/canceled
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use doc_replication::resilience::{await_retry, RetryConfig, RetryWait};
//! use tokio::sync::watch;
//!
//! let retry = RetryConfig::constant(std::time::Duration::from_secs(5));
//! let (_online_tx, online_rx) = watch::channel(true);
//! let (_stop_tx, stop_rx) = watch::channel(false);
//!
//! match await_retry(retry.delay_for_attempt(1), Some(online_rx), stop_rx).await {
//!     RetryWait::Stopped => return,
//!     RetryWait::Elapsed | RetryWait::Online => { /* try again */ }
//! }
//! # }
//! ```

use std::time::Duration;
use tokio::sync::watch;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    /// Set to `usize::MAX` for infinite retries.
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry, 1.0 = constant).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Infinite retries with the same delay every time.
    ///
    /// This is the handler retry policy: a replication never gives up on
    /// its transport, it waits `retry_time` between attempts.
    pub fn constant(delay: Duration) -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: delay,
            max_delay: delay,
            backoff_factor: 1.0,
        }
    }

    /// Infinite retry for long-running replications (never give up!).
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 10+      300s (cap)
    /// ```
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
        }
    }

    /// Fast retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }

    /// True once `attempt` retries have been used up.
    pub fn exhausted(&self, attempt: usize) -> bool {
        attempt >= self.max_attempts
    }
}

/// Why a retry wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryWait {
    /// The full delay passed.
    Elapsed,
    /// Connectivity came back before the delay passed.
    Online,
    /// The stop signal was raised (pause or cancel).
    Stopped,
}

/// Wait `delay`, or less if `online` turns true or `stop` turns true.
///
/// `online` is optional; without it only the delay and the stop signal count.
pub async fn await_retry(
    delay: Duration,
    online: Option<watch::Receiver<bool>>,
    mut stop: watch::Receiver<bool>,
) -> RetryWait {
    if *stop.borrow_and_update() {
        return RetryWait::Stopped;
    }

    let online_again = async move {
        match online {
            Some(mut rx) => {
                // Only a transition counts; being online already means the failure was not connectivity
                rx.borrow_and_update();
                loop {
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                    if *rx.borrow_and_update() {
                        return;
                    }
                }
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = stop.wait_for(|stopped| *stopped) => RetryWait::Stopped,
        _ = online_again => RetryWait::Online,
        _ = tokio::time::sleep(delay) => RetryWait::Elapsed,
    }
}
