// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for rule-relay.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The parent process is responsible for choosing the exporter
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `rule_relay_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `outcome`: success, failed, skipped_stale, duplicate, ...
//! - `kind`: error category / compile trigger
//! - `stage`: publish, consume, sweep, dead_letter

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a publish attempt on the send path
pub fn record_publish(outcome: &str) {
    counter!(
        "rule_relay_publishes_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an asynchronous broker confirm
pub fn record_confirm(acked: bool) {
    let outcome = if acked { "ack" } else { "nack" };
    counter!(
        "rule_relay_publish_confirms_total",
        "outcome" => outcome
    )
    .increment(1);
}

/// Record the outcome of handling one update delivery
pub fn record_consume(outcome: &str) {
    counter!(
        "rule_relay_consumed_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a rule compilation, labelled by what triggered it
pub fn record_compile(kind: &str) {
    counter!(
        "rule_relay_compiles_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a hot-swap attempt outcome (applied, skipped_stale, ...)
pub fn record_hot_swap(outcome: &str) {
    counter!(
        "rule_relay_hot_swaps_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record rows republished / finalized by one sweep pass
pub fn record_sweep(republished: usize, finalized: usize) {
    counter!("rule_relay_sweep_republished_total").increment(republished as u64);
    counter!("rule_relay_sweep_finalized_total").increment(finalized as u64);
    counter!("rule_relay_sweeps_total").increment(1);
}

/// Record a dead-letter handling outcome
pub fn record_dead_letter(outcome: &str) {
    counter!(
        "rule_relay_dead_letters_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a rule execution with its fired-rule count
pub fn record_execution(status: &str, fired: usize) {
    counter!(
        "rule_relay_executions_total",
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("rule_relay_rules_fired").record(fired as f64);
}

/// Record a categorized error for alerting
pub fn record_error(stage: &str, kind: &str) {
    counter!(
        "rule_relay_errors_total",
        "stage" => stage.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record stage latency
pub fn record_latency(stage: &str, duration: Duration) {
    histogram!(
        "rule_relay_stage_seconds",
        "stage" => stage.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set the current number of compiled rules held in the cache
pub fn set_cached_rules(count: usize) {
    gauge!("rule_relay_cached_rules").set(count as f64);
}

/// Set the current number of PENDING rows due for retry (sampled per sweep)
pub fn set_pending_retries(count: usize) {
    gauge!("rule_relay_pending_retries").set(count as f64);
}

/// Record relay lifecycle state transitions
pub fn set_relay_state(state: &str) {
    counter!(
        "rule_relay_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records stage latency on drop
pub struct LatencyTimer {
    stage: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.stage, self.start.elapsed());
    }
}
