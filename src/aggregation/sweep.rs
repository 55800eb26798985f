//! Periodic forced finalization of idle groups, plus the outbox relay that
//! republishes batches whose first publish never got acknowledged.

use super::emit::{Emitter, FinalizeOutcome, FinalizePath};
use super::policy::AggregationPolicy;
use crate::config::AggregationConfig;
use crate::observability::Metrics;
use crate::store::{GroupStore, StoreError};
use chrono::Duration as ChronoDuration;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub finalized: usize,
    pub lost_race: usize,
    pub failed: usize,
    pub republished: usize,
    pub republish_failed: usize,
    /// Another pass held the running flag; nothing was done.
    pub skipped: bool,
}

impl SweepReport {
    fn is_quiet(&self) -> bool {
        self.scanned == 0 && self.republished == 0 && self.republish_failed == 0
    }
}

pub struct Sweeper {
    emitter: Emitter,
    store: Arc<dyn GroupStore>,
    policy: AggregationPolicy,
    interval: Duration,
    outbox_retry_after: ChronoDuration,
    running: AtomicBool,
    metrics: Metrics,
}

struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Sweeper {
    pub fn new(emitter: Emitter, policy: AggregationPolicy, config: &AggregationConfig) -> Self {
        Self {
            store: emitter.store().clone(),
            metrics: emitter.metrics().clone(),
            emitter,
            policy,
            interval: config.sweep_interval(),
            outbox_retry_after: ChronoDuration::seconds(
                i64::try_from(config.outbox_retry_after_seconds).unwrap_or(i64::MAX / 1_000),
            ),
            running: AtomicBool::new(false),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One pass. A pass that starts while another is running returns at once.
    pub async fn run_once(&self) -> SweepReport {
        if self.running.swap(true, Ordering::AcqRel) {
            tracing::debug!("Sweep already in progress; skipping");
            return SweepReport {
                skipped: true,
                ..SweepReport::default()
            };
        }
        let _flag = RunningFlag(&self.running);

        let mut report = SweepReport::default();
        self.finalize_stale(&mut report).await;
        self.relay_outbox(&mut report).await;

        if report.is_quiet() {
            tracing::trace!("Sweep found nothing to do");
        } else {
            tracing::info!(
                "Sweep: scanned={} finalized={} lost_race={} failed={} \
                 republished={} republish_failed={}",
                report.scanned,
                report.finalized,
                report.lost_race,
                report.failed,
                report.republished,
                report.republish_failed
            );
        }
        report
    }

    async fn finalize_stale(&self, report: &mut SweepReport) {
        let retry = self.emitter.store_retry();
        let candidates = match retry
            .retry("scan_older_than", StoreError::is_transient, || {
                self.store.scan_older_than(self.policy.stale_threshold())
            })
            .await
        {
            Ok(groups) => groups,
            Err(e) => {
                self.metrics.record_sweep_failure();
                report.failed += 1;
                tracing::error!("Sweep scan failed: {e}");
                return;
            }
        };

        let now = self.store.now();
        for group in candidates {
            report.scanned += 1;
            if !self.policy.is_stale(&group, now) {
                continue;
            }
            match self.emitter.finalize(&group, FinalizePath::Sweeper).await {
                Ok(FinalizeOutcome::Published(_) | FinalizeOutcome::Deferred(_)) => {
                    report.finalized += 1;
                }
                Ok(FinalizeOutcome::LostRace) => report.lost_race += 1,
                Err(e) => {
                    self.metrics.record_sweep_failure();
                    report.failed += 1;
                    tracing::error!("Sweep finalize of group {} failed: {e}", group.group_key);
                }
            }
        }
    }

    async fn relay_outbox(&self, report: &mut SweepReport) {
        let retry = self.emitter.store_retry();
        let pending = match retry
            .retry("pending_batches", StoreError::is_transient, || {
                self.store.pending_batches(self.outbox_retry_after)
            })
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                self.metrics.record_sweep_failure();
                report.republish_failed += 1;
                tracing::error!("Outbox scan failed: {e}");
                return;
            }
        };

        for batch in pending {
            match self.emitter.republish(&batch).await {
                Ok(()) => {
                    report.republished += 1;
                    tracing::info!("Republished {} from outbox", batch.idempotency_key);
                }
                Err(e) => {
                    self.metrics.record_sweep_failure();
                    report.republish_failed += 1;
                    tracing::warn!("Republish of {} failed: {e}", batch.idempotency_key);
                }
            }
        }
    }

    /// Tick until cancelled. Ticks missed while a pass overruns are skipped.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!("Sweeper started (every {:?})", self.interval);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.run_once().await;
                }
            }
        }
        tracing::info!("Sweeper stopped");
    }
}
