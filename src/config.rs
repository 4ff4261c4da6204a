// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for a replication.
//!
//! Configuration is passed to [`ReplicationState::new()`](crate::ReplicationState::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use doc_replication::config::ReplicationConfig;
//!
//! let config = ReplicationConfig {
//!     live: false,
//!     ..ReplicationConfig::new("sync-users")
//! };
//! assert_eq!(config.pull.batch_size, 100);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── identifier: String          # Scopes meta rows and checkpoints
//! ├── live: bool                  # Keep streaming after the first pass
//! ├── retry_time: "5s"            # Wait between handler retries
//! ├── live_interval: Option<"10s"> # Periodic RESYNC while live
//! ├── auto_start / keep_meta / wait_before_persist
//! ├── pull: PullConfig            # batch_size
//! └── push: PushConfig            # batch_size
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! identifier: "sync-users"
//! live: true
//! retry_time: "5s"
//! live_interval: "30s"
//! pull:
//!   batch_size: 50
//! push:
//!   batch_size: 20
//! ```

use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings of one replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Unique name of this replication.
    /// Meta rows and checkpoints are scoped by it, so changing it restarts from scratch.
    pub identifier: String,

    /// Keep replicating after the first full pass.
    /// `false` runs one convergence pass and then cancels itself.
    #[serde(default = "default_true")]
    pub live: bool,

    /// Time to wait before retrying a failed pull/push handler call.
    #[serde(default = "default_retry_time")]
    pub retry_time: String,

    /// Multiplier applied to `retry_time` per consecutive failure (1.0 = constant).
    #[serde(default = "default_backoff_factor")]
    pub retry_backoff_factor: f64,

    /// Ceiling for the retry delay when backing off.
    #[serde(default = "default_max_retry_time")]
    pub max_retry_time: String,

    /// Emit a RESYNC at this interval while live.
    /// For pull handlers without a live stream.
    #[serde(default)]
    pub live_interval: Option<String>,

    /// Start as soon as the replication is created.
    #[serde(default = "default_true")]
    pub auto_start: bool,

    /// Send `_rev`/`_meta` to the master and accept them from it.
    #[serde(default)]
    pub keep_meta: bool,

    /// Delay before the upstream processes live fork changes.
    /// Lets bursts of local writes collapse into one push.
    #[serde(default)]
    pub wait_before_persist: Option<String>,

    #[serde(default)]
    pub pull: PullConfig,

    #[serde(default)]
    pub push: PushConfig,
}

impl ReplicationConfig {
    /// Defaults for the given identifier.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            live: true,
            retry_time: default_retry_time(),
            retry_backoff_factor: default_backoff_factor(),
            max_retry_time: default_max_retry_time(),
            live_interval: None,
            auto_start: true,
            keep_meta: false,
            wait_before_persist: None,
            pull: PullConfig::default(),
            push: PushConfig::default(),
        }
    }

    /// Create a config for testing: fast retries, small batches.
    pub fn for_testing(identifier: &str) -> Self {
        Self {
            retry_time: "20ms".to_string(),
            max_retry_time: "100ms".to_string(),
            pull: PullConfig { batch_size: 10 },
            push: PushConfig { batch_size: 10 },
            ..Self::new(identifier)
        }
    }

    /// Parse `retry_time` to a Duration.
    pub fn retry_time_duration(&self) -> Duration {
        parse_duration_or("retry_time", &self.retry_time, Duration::from_secs(5))
    }

    /// Parse `max_retry_time` to a Duration.
    pub fn max_retry_time_duration(&self) -> Duration {
        parse_duration_or("max_retry_time", &self.max_retry_time, Duration::from_secs(300))
    }

    /// Parse `live_interval`. `None` disables periodic RESYNC.
    pub fn live_interval_duration(&self) -> Option<Duration> {
        self.live_interval
            .as_deref()
            .map(|s| parse_duration_or("live_interval", s, Duration::from_secs(10)))
            .filter(|d| !d.is_zero())
    }

    /// Parse `wait_before_persist`.
    pub fn wait_before_persist_duration(&self) -> Option<Duration> {
        self.wait_before_persist
            .as_deref()
            .map(|s| parse_duration_or("wait_before_persist", s, Duration::ZERO))
            .filter(|d| !d.is_zero())
    }

    /// Handler retry schedule derived from `retry_time` and friends.
    pub fn retry_config(&self) -> RetryConfig {
        let initial = self.retry_time_duration();
        let factor = if self.retry_backoff_factor.is_finite() && self.retry_backoff_factor >= 1.0 {
            self.retry_backoff_factor
        } else {
            1.0
        };
        RetryConfig {
            max_attempts: usize::MAX,
            initial_delay: initial,
            max_delay: self.max_retry_time_duration().max(initial),
            backoff_factor: factor,
        }
    }

    /// Check settings that cannot be fixed up with a default.
    pub fn validate(&self) -> crate::Result<()> {
        if self.identifier.trim().is_empty() {
            return Err(crate::ReplicationError::Config(
                "identifier must not be empty".to_string(),
            ));
        }
        if self.identifier.contains('|') {
            return Err(crate::ReplicationError::Config(format!(
                "identifier must not contain '|': {}",
                self.identifier
            )));
        }
        if self.pull.batch_size == 0 || self.push.batch_size == 0 {
            return Err(crate::ReplicationError::Config(
                "batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_duration_or(field: &str, value: &str, fallback: Duration) -> Duration {
    match humantime::parse_duration(value) {
        Ok(d) => d,
        Err(e) => {
            warn!(field, value, error = %e, fallback_ms = fallback.as_millis() as u64, "Invalid duration, using default");
            fallback
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_retry_time() -> String {
    "5s".to_string()
}

fn default_backoff_factor() -> f64 {
    1.0
}

fn default_max_retry_time() -> String {
    "5m".to_string()
}

fn default_batch_size() -> usize {
    100
}

// ═══════════════════════════════════════════════════════════════════════════════
// Per-direction settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Downstream (master → fork) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    /// Documents requested per `masterChangesSince` call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

/// Upstream (fork → master) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Rows per `masterWrite` call, and documents per fork scan.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
