// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics through the `metrics` facade for:
//! - Documents pulled, applied and pushed
//! - Conflicts and conflict writes
//! - Checkpoint and meta write outcomes
//! - Handler errors and retry waits
//! - Cycle durations and replication state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Every metric carries the replication `identifier` label where one exists.
//!
//! # Usage
//!
//! ```rust,no_run
//! use doc_replication::metrics;
//! use std::time::Duration;
//!
//! metrics::record_documents_pulled("sync-users", 42);
//! metrics::record_cycle("sync-users", doc_replication::Direction::Up, Duration::from_millis(12));
//! ```

use crate::checkpoint::Direction;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record documents received from `masterChangesSince` or the live stream.
pub fn record_documents_pulled(identifier: &str, count: usize) {
    counter!("replication_documents_pulled_total", "identifier" => identifier.to_string()).increment(count as u64);
}

/// Record documents written into the fork by the downstream.
pub fn record_documents_applied(identifier: &str, count: usize) {
    counter!("replication_documents_applied_total", "identifier" => identifier.to_string()).increment(count as u64);
}

/// Record pulled documents that already matched the fork.
pub fn record_documents_unchanged(identifier: &str, count: usize) {
    counter!("replication_documents_unchanged_total", "identifier" => identifier.to_string()).increment(count as u64);
}

/// Record rows accepted by `masterWrite`.
pub fn record_documents_pushed(identifier: &str, count: usize) {
    counter!("replication_documents_pushed_total", "identifier" => identifier.to_string()).increment(count as u64);
}

/// Record fork changes skipped because master already has them.
pub fn record_documents_skipped(identifier: &str, count: usize) {
    counter!("replication_documents_skipped_total", "identifier" => identifier.to_string()).increment(count as u64);
}

/// Record conflicts returned by `masterWrite`.
pub fn record_conflicts(identifier: &str, count: usize) {
    counter!("replication_conflicts_total", "identifier" => identifier.to_string()).increment(count as u64);
}

/// Record resolved documents written back into the fork.
pub fn record_conflict_writes(identifier: &str, count: usize) {
    counter!("replication_conflict_writes_total", "identifier" => identifier.to_string()).increment(count as u64);
}

/// Record a checkpoint write attempt.
pub fn record_checkpoint_write(identifier: &str, direction: Direction, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_checkpoint_writes_total",
        "identifier" => identifier.to_string(),
        "direction" => direction.as_str(),
        "status" => status
    )
    .increment(1);
}

/// Record meta rows rebased after a 409.
pub fn record_meta_conflict_retry(rows: usize) {
    counter!("replication_meta_conflict_retries_total").increment(rows as u64);
}

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn sqlite_retries_total(operation: &str) {
    counter!("replication_sqlite_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a failed pull/push handler call.
pub fn record_handler_error(identifier: &str, direction: Direction) {
    counter!(
        "replication_handler_errors_total",
        "identifier" => identifier.to_string(),
        "direction" => direction.as_str()
    )
    .increment(1);
}

/// Record a retry wait and how it ended.
pub fn record_retry_wait(identifier: &str, direction: Direction, outcome: &str) {
    counter!(
        "replication_retry_waits_total",
        "identifier" => identifier.to_string(),
        "direction" => direction.as_str(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a fatal storage error inside an engine cycle.
pub fn record_storage_error(identifier: &str, direction: Direction) {
    counter!(
        "replication_storage_errors_total",
        "identifier" => identifier.to_string(),
        "direction" => direction.as_str()
    )
    .increment(1);
}

/// Record one engine cycle.
pub fn record_cycle(identifier: &str, direction: Direction, duration: Duration) {
    histogram!(
        "replication_cycle_duration_seconds",
        "identifier" => identifier.to_string(),
        "direction" => direction.as_str()
    )
    .record(duration.as_secs_f64());
}

/// Record a RESYNC pass.
pub fn record_resync(identifier: &str, direction: Direction) {
    counter!(
        "replication_resyncs_total",
        "identifier" => identifier.to_string(),
        "direction" => direction.as_str()
    )
    .increment(1);
}

/// Gauge: 1 while either direction has work queued or running.
pub fn set_active(identifier: &str, active: bool) {
    gauge!("replication_active", "identifier" => identifier.to_string()).set(if active { 1.0 } else { 0.0 });
}

/// Gauge for replication lifecycle state.
pub fn set_replication_state(identifier: &str, state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "Paused" => 2.0,
        "Canceled" => 3.0,
        "Removed" => 4.0,
        _ => -1.0,
    };
    gauge!("replication_state", "identifier" => identifier.to_string()).set(value);
}
