// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for banner-engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `banner_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: resolve_active, create_banner, rotate_version, ...
//! - `status`: success, error
//! - `error_kind`: not_found, conflict, transient, invalid

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::storage::traits::ErrorKind;

/// Record an engine operation outcome
pub fn record_operation(operation: &str, status: &str) {
    counter!(
        "banner_engine_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "banner_engine_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a failed operation by error kind
pub fn record_error(operation: &str, kind: ErrorKind) {
    counter!(
        "banner_engine_errors_total",
        "operation" => operation.to_string(),
        "error_kind" => kind.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// READ PATH - cache effectiveness and coalescing
// ═══════════════════════════════════════════════════════════════════════════

/// Record a cache lookup result: "hit", "miss", or "error"
pub fn record_cache_lookup(result: &str) {
    counter!(
        "banner_engine_cache_lookups_total",
        "result" => result.to_string()
    )
    .increment(1);
}

/// Record a cache write that failed after a successful store read
pub fn record_cache_write_error() {
    counter!("banner_engine_cache_write_errors_total").increment(1);
}

/// Record a caller that joined an in-flight fetch instead of querying the store
pub fn record_coalesced_wait() {
    counter!("banner_engine_coalesced_waits_total").increment(1);
}

/// Record a store-fresh read that bypassed the cache
pub fn record_fresh_read() {
    counter!("banner_engine_fresh_reads_total").increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// DELETION - background bulk deletes
// ═══════════════════════════════════════════════════════════════════════════

/// Record a background deletion outcome: "completed", "failed", or "cancelled"
pub fn record_deletion(outcome: &str) {
    counter!(
        "banner_engine_deletions_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record banners removed by a background deletion
pub fn record_deleted_banners(count: u64) {
    counter!("banner_engine_deleted_banners_total").increment(count);
}

/// Set number of deletion units queued or running
pub fn set_deletions_in_flight(count: usize) {
    gauge!("banner_engine_deletions_in_flight").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Set engine state (for monitoring state machine transitions)
pub fn set_engine_state(state: &str) {
    counter!(
        "banner_engine_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Set backend health status (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "banner_engine_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Record how long the shutdown drain took
pub fn record_drain_duration(duration: Duration) {
    histogram!("banner_engine_drain_seconds").record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}
