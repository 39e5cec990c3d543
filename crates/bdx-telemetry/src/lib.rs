// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Structured telemetry for the birdex engine.
//!
//! [`init_tracing`] wires up `tracing-subscriber` once at process start.
//! [`TickMetrics`] and [`MetricsCollector`]/[`MetricsSummary`] aggregate
//! per-tick planner outcomes across a run, mirroring the shape of an
//! operational dashboard feed even though this crate exposes nothing over
//! the network — summaries are meant to be logged or printed by the CLI.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// Output format for [`init_tracing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, ANSI-colored lines. The default for interactive use.
    Pretty,
    /// One JSON object per line, for log aggregators.
    Json,
}

/// Initialize the global `tracing` subscriber.
///
/// Verbosity is driven by `RUST_LOG` (default `info` if unset). Call once,
/// as early as possible in `main`; a second call is a logic error in the
/// caller, not something this function guards against.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

/// Counts of planner decisions and ingest outcomes accumulated over one
/// engine tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickMetrics {
    /// Opaque id of the tick this metrics value belongs to.
    pub tick_id: String,
    /// Instances that produced a new materialization.
    pub materialized: u64,
    /// Instances whose materialization key matched the checkpoint.
    pub short_circuited: u64,
    /// Instances deferred (lock contention, prerequisite not ready).
    pub deferred: u64,
    /// Instances skipped (not due, or root/fanout root disabled).
    pub skipped: u64,
    /// Instances that materialized despite a validation warning.
    pub validation_warnings: u64,
    /// Instances skipped due to a validation error.
    pub validation_errors: u64,
    /// Instances that failed with an error.
    pub errored: u64,
    /// Ingest runs that completed successfully.
    pub ingest_success: u64,
    /// Ingest runs that completed with an error.
    pub ingest_error: u64,
    /// Ingest runs deferred by advisory-lock contention.
    pub ingest_deferred: u64,
    /// Wall-clock duration of the tick, in milliseconds.
    pub duration_ms: u64,
}

impl TickMetrics {
    /// Start a zeroed metrics value for the given tick id.
    #[must_use]
    pub fn new(tick_id: impl Into<String>) -> Self {
        Self {
            tick_id: tick_id.into(),
            ..Self::default()
        }
    }

    /// Record one [`bdx_core::PlannerDecision`]-shaped outcome by its
    /// wire name, keeping this crate free of a `bdx-core` dependency for
    /// what is otherwise a pure counting operation.
    pub fn record_decision(&mut self, decision: &str) {
        match decision {
            "materialized" => self.materialized += 1,
            "short_circuited" => self.short_circuited += 1,
            "deferred" => self.deferred += 1,
            "skipped" => self.skipped += 1,
            "validation_warning" => self.validation_warnings += 1,
            "validation_error" => self.validation_errors += 1,
            "error" => self.errored += 1,
            other => tracing::warn!(decision = other, "unrecognized planner decision in metrics"),
        }
    }

    /// Total instances the planner considered this tick.
    #[must_use]
    pub fn instances_considered(&self) -> u64 {
        self.materialized
            + self.short_circuited
            + self.deferred
            + self.skipped
            + self.validation_errors
            + self.errored
    }
}

/// Aggregated statistics across multiple ticks.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSummary {
    /// Number of ticks recorded.
    pub tick_count: usize,
    /// Sum of `materialized` across recorded ticks.
    pub total_materialized: u64,
    /// Sum of `errored` across recorded ticks.
    pub total_errored: u64,
    /// Sum of `deferred` across recorded ticks.
    pub total_deferred: u64,
    /// Mean tick duration in milliseconds.
    pub mean_duration_ms: f64,
    /// 99th-percentile tick duration in milliseconds.
    pub p99_duration_ms: f64,
}

fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] as f64 * (1.0 - frac) + sorted[upper] as f64 * frac
}

/// Thread-safe collector of [`TickMetrics`] across a run, used by
/// `bdx-runloop` to feed the `worker tick` command's human-readable
/// summary.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<Vec<TickMetrics>>>,
}

impl MetricsCollector {
    /// Create a new, empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one tick's metrics.
    pub fn record(&self, metrics: TickMetrics) {
        let mut data = self.inner.lock().expect("metrics lock poisoned");
        data.push(metrics);
    }

    /// Every tick recorded so far, in recording order.
    #[must_use]
    pub fn ticks(&self) -> Vec<TickMetrics> {
        let data = self.inner.lock().expect("metrics lock poisoned");
        data.clone()
    }

    /// Compute an aggregated summary of every tick recorded so far.
    #[must_use]
    pub fn summary(&self) -> MetricsSummary {
        let data = self.inner.lock().expect("metrics lock poisoned");
        if data.is_empty() {
            return MetricsSummary::default();
        }
        let mut durations: Vec<u64> = data.iter().map(|t| t.duration_ms).collect();
        durations.sort_unstable();
        let total: u64 = durations.iter().sum();
        MetricsSummary {
            tick_count: data.len(),
            total_materialized: data.iter().map(|t| t.materialized).sum(),
            total_errored: data.iter().map(|t| t.errored).sum(),
            total_deferred: data.iter().map(|t| t.deferred).sum(),
            mean_duration_ms: total as f64 / data.len() as f64,
            p99_duration_ms: percentile(&durations, 99.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_decision_buckets_every_planner_outcome() {
        let mut metrics = TickMetrics::new("tick-1");
        for decision in [
            "materialized",
            "short_circuited",
            "deferred",
            "skipped",
            "validation_warning",
            "validation_error",
            "error",
        ] {
            metrics.record_decision(decision);
        }
        assert_eq!(metrics.materialized, 1);
        assert_eq!(metrics.short_circuited, 1);
        assert_eq!(metrics.deferred, 1);
        assert_eq!(metrics.skipped, 1);
        assert_eq!(metrics.validation_warnings, 1);
        assert_eq!(metrics.validation_errors, 1);
        assert_eq!(metrics.errored, 1);
    }

    #[test]
    fn instances_considered_excludes_warnings_double_count() {
        let mut metrics = TickMetrics::new("tick-1");
        metrics.record_decision("materialized");
        metrics.record_decision("validation_warning");
        // a validation warning still materializes, so it must not also
        // land in instances_considered as a separate bucket
        assert_eq!(metrics.instances_considered(), 1);
    }

    #[test]
    fn collector_summary_is_empty_by_default() {
        let collector = MetricsCollector::new();
        assert_eq!(collector.summary(), MetricsSummary::default());
    }

    #[test]
    fn collector_aggregates_across_ticks() {
        let collector = MetricsCollector::new();
        let mut a = TickMetrics::new("tick-1");
        a.materialized = 3;
        a.duration_ms = 100;
        let mut b = TickMetrics::new("tick-2");
        b.materialized = 2;
        b.errored = 1;
        b.duration_ms = 200;
        collector.record(a);
        collector.record(b);

        let summary = collector.summary();
        assert_eq!(summary.tick_count, 2);
        assert_eq!(summary.total_materialized, 5);
        assert_eq!(summary.total_errored, 1);
        assert!((summary.mean_duration_ms - 150.0).abs() < f64::EPSILON);
    }
}
