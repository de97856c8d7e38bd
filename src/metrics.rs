//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Replication FSM state and transitions
//! - Messages sent, acknowledged and retransmitted
//! - Data-control resync requests and reschedules
//! - Destination writer skips and rejections
//! - Log-entry replication lag
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Recording is a no-op until the embedding process installs a recorder.
//!
//! # Usage
//!
//! ```rust,no_run
//! use log_replication_engine::metrics;
//!
//! metrics::record_messages_sent("standby-1", "snapshot", 10);
//! metrics::set_fsm_state("standby-1", "IN_SNAPSHOT_SYNC");
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Source Side
// =============================================================================

/// Record replication messages handed to the transport.
pub fn record_messages_sent(remote: &str, kind: &str, count: usize) {
    counter!(
        "replication_messages_sent_total",
        "remote" => remote.to_string(),
        "kind" => kind.to_string()
    )
    .increment(count as u64);
}

/// Record messages confirmed by the destination.
pub fn record_messages_acked(remote: &str, kind: &str, count: usize) {
    counter!(
        "replication_messages_acked_total",
        "remote" => remote.to_string(),
        "kind" => kind.to_string()
    )
    .increment(count as u64);
}

/// Record messages sent again after a timeout or error ack.
pub fn record_retransmits(remote: &str, kind: &str, count: usize) {
    counter!(
        "replication_retransmits_total",
        "remote" => remote.to_string(),
        "kind" => kind.to_string()
    )
    .increment(count as u64);
}

/// Record log entries skipped because they touch no replicated stream.
pub fn record_noise_entries(remote: &str, count: usize) {
    counter!("replication_noise_entries_total", "remote" => remote.to_string()).increment(count as u64);
}

/// Record a completed snapshot sync.
pub fn record_snapshot_sync_complete(remote: &str, messages: u64, duration: Duration) {
    counter!("replication_snapshot_syncs_total", "remote" => remote.to_string()).increment(1);
    histogram!("replication_snapshot_sync_messages", "remote" => remote.to_string()).record(messages as f64);
    histogram!("replication_snapshot_sync_duration_seconds", "remote" => remote.to_string())
        .record(duration.as_secs_f64());
}

/// Set log-entry replication lag in log addresses (tail minus last acked).
pub fn set_log_entry_lag(remote: &str, lag: i64) {
    gauge!("replication_log_entry_lag_addresses", "remote" => remote.to_string()).set(lag.max(0) as f64);
}

// =============================================================================
// FSM
// =============================================================================

/// Set current FSM state as a numeric gauge (for alerting).
pub fn set_fsm_state(remote: &str, state: &str) {
    let value = match state {
        "INITIALIZED" => 0.0,
        "IN_SNAPSHOT_SYNC" => 1.0,
        "IN_LOG_ENTRY_SYNC" => 2.0,
        "IN_REQUIRE_SNAPSHOT_SYNC" => 3.0,
        "STOPPED" => 4.0,
        _ => -1.0,
    };
    gauge!("replication_fsm_state", "remote" => remote.to_string()).set(value);
}

/// Record an FSM transition.
pub fn record_fsm_transition(remote: &str, from: &str, to: &str) {
    counter!(
        "replication_fsm_transitions_total",
        "remote" => remote.to_string(),
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

/// Record an error reaching the FSM, by class.
pub fn record_error(remote: &str, class: &str) {
    counter!(
        "replication_errors_total",
        "remote" => remote.to_string(),
        "class" => class.to_string()
    )
    .increment(1);
}

// =============================================================================
// Data Control
// =============================================================================

/// Record a resync request to the application.
pub fn record_data_control_request(remote: &str, outcome: &str) {
    counter!(
        "replication_data_control_requests_total",
        "remote" => remote.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a resync request re-sent by the reschedule timer.
pub fn record_snapshot_sync_reschedule(remote: &str) {
    counter!("replication_snapshot_sync_reschedules_total", "remote" => remote.to_string()).increment(1);
}

// =============================================================================
// Destination Side
// =============================================================================

/// Record messages applied by a destination writer.
pub fn record_messages_applied(remote: &str, kind: &str, count: usize) {
    counter!(
        "replication_messages_applied_total",
        "remote" => remote.to_string(),
        "kind" => kind.to_string()
    )
    .increment(count as u64);
}

/// Record a message skipped by the metadata guard.
pub fn record_writer_skip(remote: &str, reason: &str) {
    counter!(
        "replication_writer_skips_total",
        "remote" => remote.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a message rejected by a writer.
pub fn record_writer_rejection(remote: &str, reason: &str) {
    counter!(
        "replication_writer_rejections_total",
        "remote" => remote.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record the shadow-to-live apply phase.
pub fn record_snapshot_apply(remote: &str, entries: usize, duration: Duration) {
    histogram!("replication_snapshot_apply_entries", "remote" => remote.to_string()).record(entries as f64);
    histogram!("replication_snapshot_apply_duration_seconds", "remote" => remote.to_string())
        .record(duration.as_secs_f64());
}

/// Set the number of log entries buffered out of order.
pub fn set_pending_log_entries(remote: &str, count: usize) {
    gauge!("replication_pending_log_entries", "remote" => remote.to_string()).set(count as f64);
}

// =============================================================================
// Storage
// =============================================================================

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn storage_retries_total(operation: &str) {
    counter!("replication_storage_retries_total", "operation" => operation.to_string()).increment(1);
}
