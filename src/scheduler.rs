// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry sweeper: the delivery-failure safety net.
//!
//! Every sweep scans for PENDING rows whose `next_retry_at` has passed —
//! each one is an intent the consumers never settled, whatever the cause
//! (publish lost, consumer crash, content not yet visible). Rows under the
//! ceiling get their bookkeeping bumped and a content-less republish; rows
//! at the ceiling are handed to the dead-letter handler and finalized.
//!
//! The sweeper is the SOLE writer of `retry_count` and `next_retry_at`.
//! Sweeps are stateless: all scheduling lives in the rows themselves, so a
//! restarted process resumes exactly where the last one stopped.

use crate::broker::Broker;
use crate::config::RelayConfig;
use crate::dead_letter::DeadLetterHandler;
use crate::intent::now_millis;
use crate::record::MessageLogRecord;
use crate::store::MessageLogStore;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Outcome of one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub republished: usize,
    pub finalized: usize,
}

pub struct RetrySweeper {
    log: Arc<dyn MessageLogStore>,
    broker: Arc<dyn Broker>,
    dead_letter: Arc<DeadLetterHandler>,
    config: RelayConfig,
}

impl RetrySweeper {
    pub fn new(
        log: Arc<dyn MessageLogStore>,
        broker: Arc<dyn Broker>,
        dead_letter: Arc<DeadLetterHandler>,
        config: RelayConfig,
    ) -> Self {
        Self {
            log,
            broker,
            dead_letter,
            config,
        }
    }

    /// Sweep on the configured interval until shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = self.sweep().await;
                    if stats.republished > 0 || stats.finalized > 0 {
                        info!(
                            republished = stats.republished,
                            finalized = stats.finalized,
                            "retry sweep pass complete"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("shutdown signalled; retry sweeper exiting");
                        return;
                    }
                }
            }
        }
    }

    /// One sweep pass. Failures on individual rows are logged and skipped —
    /// the next pass picks them up again.
    pub async fn sweep(&self) -> SweepStats {
        let _timer = crate::metrics::LatencyTimer::new("sweep");
        let now = now_millis();

        let rows = match self.log.due_for_retry(now).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "retry sweep query failed");
                crate::metrics::record_error("sweep", "transient");
                return SweepStats::default();
            }
        };

        crate::metrics::set_pending_retries(rows.len());

        let mut stats = SweepStats::default();
        for row in rows {
            if row.retry_count >= self.config.retry_ceiling {
                if self.finalize(&row).await {
                    stats.finalized += 1;
                }
            } else if self.republish(&row, now).await {
                stats.republished += 1;
            }
        }

        crate::metrics::record_sweep(stats.republished, stats.finalized);
        stats
    }

    /// Bump bookkeeping, then republish content-less. Bookkeeping first: a
    /// publish that lands without the bump could hot-loop the row, while a
    /// bump without the publish just waits out one backoff.
    async fn republish(&self, row: &MessageLogRecord, now: i64) -> bool {
        let next_count = row.retry_count + 1;
        let backoff = self.config.retry_backoff(row.retry_count);
        let next_retry_at = now + backoff.as_millis() as i64;

        if let Err(e) = self
            .log
            .record_retry(&row.intent_id, next_count, next_retry_at)
            .await
        {
            warn!(intent_id = %row.intent_id, error = %e, "failed to record retry; skipping row");
            return false;
        }

        match self.broker.publish(&row.to_intent()).await {
            Ok(()) => {
                debug!(
                    intent_id = %row.intent_id,
                    retry_count = next_count,
                    backoff_secs = backoff.as_secs(),
                    "republished pending intent"
                );
                true
            }
            Err(e) => {
                // bookkeeping already advanced; the next eligible sweep
                // will try again
                warn!(intent_id = %row.intent_id, error = %e, "republish failed");
                crate::metrics::record_error("sweep", "transient");
                false
            }
        }
    }

    /// Ceiling reached: dead-letter and finalize. If recording the dead
    /// letter fails the row stays PENDING and the next pass retries the
    /// finalization, so an intent is dead-lettered at most once but never
    /// silently dropped.
    async fn finalize(&self, row: &MessageLogRecord) -> bool {
        let reason = format!(
            "retry ceiling reached after {} redeliveries{}",
            row.retry_count,
            row.error_msg
                .as_deref()
                .map(|m| format!("; last error: {m}"))
                .unwrap_or_default()
        );

        warn!(
            intent_id = %row.intent_id,
            rule_key = %row.rule_key,
            retry_count = row.retry_count,
            "intent exhausted its retries; dead-lettering"
        );
        crate::metrics::record_error("sweep", "exhausted");

        self.dead_letter.record_exhausted(row, &reason).await
    }
}
