// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Cancellable periodic driver for [`bdx_engine::Engine::tick`].
//!
//! [`TickLoop`] invokes a tick on a fixed interval until it observes
//! SIGINT or SIGTERM, recording each tick's [`bdx_engine::TickSummary`]
//! into a [`bdx_telemetry::MetricsCollector`]. `run_until_shutdown` is the
//! daemon entry point; `run_once` is what the CLI's `worker tick` command
//! calls for a single, unscheduled pass.

use bdx_engine::{Engine, TickSummary};
use bdx_telemetry::{MetricsCollector, TickMetrics};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info};

fn record_metrics(collector: &MetricsCollector, summary: &TickSummary, duration_ms: u64) {
    let mut metrics = TickMetrics::new(summary.tick_id.clone());
    metrics.duration_ms = duration_ms;
    metrics.materialized = summary.materialized;
    metrics.short_circuited = summary.short_circuited;
    metrics.deferred = summary.deferred;
    metrics.skipped = summary.skipped;
    metrics.validation_warnings = summary.validation_warnings;
    metrics.validation_errors = summary.validation_errors;
    metrics.errored = summary.errors;
    collector.record(metrics);
}

/// Run exactly one tick and return its summary, recording it into
/// `collector`. Used by the CLI's single-shot `worker tick` command,
/// where there is no loop or signal handling to speak of.
pub async fn run_once(engine: &Arc<Engine>, collector: &MetricsCollector) -> Result<TickSummary, bdx_error::BdxError> {
    let started = Instant::now();
    let summary = Engine::tick(engine).await?;
    record_metrics(collector, &summary, started.elapsed().as_millis() as u64);
    Ok(summary)
}

/// Resolves once SIGINT or SIGTERM is received. On non-Unix platforms
/// only Ctrl+C is observed; SIGTERM has no portable equivalent there.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

/// Periodic driver over [`Engine::tick`].
///
/// Each tick runs to completion once started: a shutdown signal observed
/// mid-tick is honored at the next loop boundary, not by aborting the
/// in-flight tick. The engine's own per-instance advisory lock and
/// idempotent materialization key already make an interrupted-and-resumed
/// tick safe, so there is no need to cancel work partway through.
pub struct TickLoop {
    engine: Arc<Engine>,
    tick_interval: Duration,
    metrics: MetricsCollector,
}

impl TickLoop {
    /// Build a loop over `engine`, ticking every `tick_interval`.
    #[must_use]
    pub fn new(engine: Arc<Engine>, tick_interval: Duration) -> Self {
        Self {
            engine,
            tick_interval,
            metrics: MetricsCollector::new(),
        }
    }

    /// The metrics collector this loop records every tick into. Shared
    /// with callers that want to inspect a running summary (e.g. a
    /// `/metrics`-style endpoint), though `bdx-runloop` itself exposes no
    /// such endpoint.
    #[must_use]
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Run ticks on `tick_interval` until SIGINT or SIGTERM is observed,
    /// then return the accumulated metrics. The first tick runs
    /// immediately; it does not wait one interval first.
    pub async fn run_until_shutdown(self) -> MetricsCollector {
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => {
                    info!("shutdown signal received, exiting run loop");
                    break;
                }
                _ = interval.tick() => {
                    match run_once(&self.engine, &self.metrics).await {
                        Ok(summary) => info!(
                            tick_id = %summary.tick_id,
                            materialized = summary.materialized,
                            short_circuited = summary.short_circuited,
                            deferred = summary.deferred,
                            errors = summary.errors,
                            "tick complete"
                        ),
                        Err(err) => error!(error = %err, "tick failed"),
                    }
                }
            }
        }

        self.metrics
    }
}
