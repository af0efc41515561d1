// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the datasource.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `multichannel_store_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `region`: cache region name
//! - `operation`: get_by_id, store, get_result, ...
//! - `status`: success, error

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a datasource operation outcome
pub fn record_operation(operation: &str, status: &str) {
    counter!(
        "multichannel_store_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "multichannel_store_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a cache lookup in one region
pub fn record_cache_lookup(region: &str, hit: bool) {
    counter!(
        "multichannel_store_cache_lookups_total",
        "region" => region.to_string(),
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// Record entries evicted from a bounded region
pub fn record_eviction(region: &str, count: usize) {
    counter!(
        "multichannel_store_cache_evictions_total",
        "region" => region.to_string()
    )
    .increment(count as u64);
}

/// Set current entry count of a region
pub fn set_region_entries(region: &str, entries: usize) {
    gauge!(
        "multichannel_store_cache_entries",
        "region" => region.to_string()
    )
    .set(entries as f64);
}

/// Record cache invalidation
pub fn record_invalidation(reason: &str, objects: usize) {
    counter!(
        "multichannel_store_invalidated_objects_total",
        "reason" => reason.to_string()
    )
    .increment(objects as u64);
}

/// Record a prefetch decision
pub fn record_prefetch(trigger: &str, objects: usize) {
    counter!(
        "multichannel_store_prefetch_total",
        "trigger" => trigger.to_string()
    )
    .increment(1);
    histogram!("multichannel_store_prefetch_objects").record(objects as f64);
}

/// Record one sync checker tick
pub fn record_checker_tick(changed_channels: usize, changed_objects: usize, duration: Duration) {
    counter!("multichannel_store_checker_ticks_total").increment(1);
    counter!("multichannel_store_checker_changed_channels_total").increment(changed_channels as u64);
    counter!("multichannel_store_checker_changed_objects_total").increment(changed_objects as u64);
    histogram!("multichannel_store_checker_tick_seconds").record(duration.as_secs_f64());
}

/// Record objects eagerly loaded by warming
pub fn record_warmed(objects: usize) {
    counter!("multichannel_store_warmed_objects_total").increment(objects as u64);
}

/// Record a background job failure
pub fn record_job_error(job: &str) {
    counter!(
        "multichannel_store_job_errors_total",
        "job" => job.to_string()
    )
    .increment(1);
}

/// Record filesystem attribute writes by outcome: written, linked, unchanged
pub fn record_file_write(outcome: &str) {
    counter!(
        "multichannel_store_file_writes_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record deferred file removals by outcome: removed, referenced, failed
pub fn record_file_removal(outcome: &str, count: usize) {
    counter!(
        "multichannel_store_file_removals_total",
        "outcome" => outcome.to_string()
    )
    .increment(count as u64);
}

/// Set queued file removals
pub fn set_pending_removals(count: usize) {
    gauge!("multichannel_store_pending_file_removals").set(count as f64);
}

/// Record replication results for one channel
pub fn record_sync(channel: u32, inserted: usize, updated: usize, deleted: usize) {
    let channel = channel.to_string();
    counter!("multichannel_store_sync_objects_total", "channel" => channel.clone(), "action" => "inserted")
        .increment(inserted as u64);
    counter!("multichannel_store_sync_objects_total", "channel" => channel.clone(), "action" => "updated")
        .increment(updated as u64);
    counter!("multichannel_store_sync_objects_total", "channel" => channel, "action" => "deleted")
        .increment(deleted as u64);
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

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($op:expr) => {
        $crate::metrics::LatencyTimer::new($op)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    // These only check the helpers don't panic without a recorder installed.

    #[test]
    fn test_counters() {
        record_operation("store", "success");
        record_cache_lookup("object-by-id", true);
        record_cache_lookup("object-by-id", false);
        record_eviction("shared", 3);
        record_invalidation("checker", 10);
        record_prefetch("count", 100);
        record_job_error("sync-checker");
        record_file_write("linked");
        record_file_removal("removed", 2);
        record_sync(1, 3, 2, 1);
        record_warmed(5);
    }

    #[test]
    fn test_gauges_and_histograms() {
        set_region_entries("shared", 42);
        set_pending_removals(7);
        record_checker_tick(1, 4, Duration::from_millis(3));
        record_latency("get_result", Duration::from_micros(250));
    }

    #[test]
    fn test_latency_timer() {
        let _timer = time_operation!("store");
        std::thread::sleep(Duration::from_millis(1));
    }
}
