// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Delivery path: parse, dedup, resolve content, hot-swap, settle.
//!
//! The handler is written to be safe under at-least-once delivery: every
//! branch either acks (work done or provably already done), nacks with
//! requeue (transient, worth another delivery), or nacks without requeue
//! (poison, off to the dead-letter queue). The consumer never mutates
//! `retry_count` — that bookkeeping belongs to the sweeper alone.
//!
//! Idempotency is layered: a volatile marker short-circuits most
//! redeliveries, the durable SUCCESS row catches the rest, and the cache's
//! version-monotonic swap is the backstop when both are cold.

use crate::broker::{Broker, Delivery};
use crate::cache::RuleCache;
use crate::config::RelayConfig;
use crate::error::{truncate_msg, RelayError};
use crate::intent::UpdateIntent;
use crate::record::MessageStatus;
use crate::shared_cache::{IdempotencyStore, RuleContentStore};
use crate::store::{LogStoreError, MessageLogStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct UpdateConsumer {
    log: Arc<dyn MessageLogStore>,
    cache: Arc<RuleCache>,
    content: Arc<dyn RuleContentStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    config: RelayConfig,
}

impl UpdateConsumer {
    pub fn new(
        log: Arc<dyn MessageLogStore>,
        cache: Arc<RuleCache>,
        content: Arc<dyn RuleContentStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        config: RelayConfig,
    ) -> Self {
        Self {
            log,
            cache,
            content,
            idempotency,
            config,
        }
    }

    /// Consume update deliveries until the broker closes or shutdown is
    /// signalled. Multiple workers may run this concurrently.
    pub async fn run(self: Arc<Self>, broker: Arc<dyn Broker>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                delivery = broker.next_update() => {
                    match delivery {
                        Some(delivery) => self.handle(delivery).await,
                        None => {
                            info!("update queue closed; consumer worker exiting");
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("shutdown signalled; consumer worker exiting");
                        return;
                    }
                }
            }
        }
    }

    /// Process one delivery end to end, settling it with the broker.
    pub async fn handle(&self, delivery: Delivery) {
        let _timer = crate::metrics::LatencyTimer::new("consume");

        // No correlation id means the message cannot be deduplicated or
        // logged. Poison, not retryable.
        let Some(intent_id) = delivery.intent_id.clone() else {
            warn!("delivery without intent id; rejecting to dead-letter");
            crate::metrics::record_consume("malformed");
            reject(delivery, false).await;
            return;
        };

        // Fast dedup: the volatile marker catches most redeliveries without
        // touching the durable log. A marker-store outage just means we fall
        // through to the slower checks.
        match self.idempotency.is_processed(&intent_id).await {
            Ok(true) => {
                debug!(intent_id, "duplicate delivery, marker hit");
                crate::metrics::record_consume("duplicate");
                settle(delivery).await;
                return;
            }
            Ok(false) => {}
            Err(e) => warn!(intent_id, error = %e, "idempotency check failed, continuing"),
        }

        let intent = match UpdateIntent::from_wire(&intent_id, &delivery.payload) {
            Ok(intent) => intent,
            Err(e) => {
                warn!(intent_id, error = %e, "malformed intent payload; rejecting");
                crate::metrics::record_consume("malformed");
                crate::metrics::record_error("consume", "validation");
                self.finalize_failed(&intent_id, &format!("malformed payload: {e}"))
                    .await;
                reject(delivery, false).await;
                return;
            }
        };

        // Durable dedup: a terminal row means a previous delivery finished
        // the job (or poisoned it). Either way there is nothing left to do.
        match self.log.get(&intent_id).await {
            Ok(Some(record)) if record.status.is_terminal() => {
                debug!(intent_id, status = %record.status, "duplicate delivery of settled intent");
                crate::metrics::record_consume("duplicate");
                if record.status == MessageStatus::Success {
                    self.mark_processed(&intent_id).await;
                }
                settle(delivery).await;
                return;
            }
            Ok(_) => {}
            Err(e) => warn!(intent_id, error = %e, "log lookup failed, continuing"),
        }

        match self.apply(&intent).await {
            Ok(applied) => {
                self.set_status(&intent_id, MessageStatus::Success, None).await;
                self.mark_processed(&intent_id).await;
                crate::metrics::record_consume(if applied { "applied" } else { "stale_skip" });
                info!(
                    intent_id,
                    rule_key = %intent.rule_key,
                    rule_version = %intent.rule_version,
                    applied,
                    "intent processed"
                );
                settle(delivery).await;
            }
            Err(e) if e.is_retryable() => {
                crate::metrics::record_error("consume", e.kind());
                self.handle_transient(intent, delivery, &e).await;
            }
            Err(e) => {
                // validation / compile: redelivery cannot fix the payload
                warn!(intent_id, error = %e, "non-retryable failure; rejecting to dead-letter");
                crate::metrics::record_consume("rejected");
                crate::metrics::record_error("consume", e.kind());
                self.finalize_failed(&intent_id, &e.to_string()).await;
                reject(delivery, false).await;
            }
        }
    }

    /// Resolve content and hot-swap the cache. Returns whether the swap
    /// actually installed (false = stale or duplicate, already subsumed).
    async fn apply(&self, intent: &UpdateIntent) -> Result<bool, RelayError> {
        let content = match &intent.rule_content {
            Some(content) => content.clone(),
            None => self
                .content
                .get(&intent.rule_key, intent.rule_version.as_str())
                .await?
                .ok_or_else(|| {
                    RelayError::Transient(format!(
                        "content unavailable for {}@{}",
                        intent.rule_key, intent.rule_version
                    ))
                })?,
        };

        // the remaining failure mode is a compile error, which is terminal,
        // so the PROCESSING window is safe to enter
        self.set_status(&intent.intent_id, MessageStatus::Processing, None)
            .await;

        self.cache
            .hot_swap(&intent.rule_key, &intent.rule_version, &content)
            .await
    }

    /// Transient failure: leave the row where it is for the sweeper, and let
    /// the broker redeliver — unless the sweeper has already burned the
    /// retry ceiling, in which case the intent is finalized here.
    async fn handle_transient(&self, intent: UpdateIntent, delivery: Delivery, err: &RelayError) {
        let retry_count = match self.log.get(&intent.intent_id).await {
            Ok(Some(record)) => record.retry_count,
            Ok(None) => 0,
            Err(e) => {
                warn!(intent_id = %intent.intent_id, error = %e, "log lookup failed during transient handling");
                0
            }
        };

        if retry_count >= self.config.retry_ceiling {
            warn!(
                intent_id = %intent.intent_id,
                retry_count,
                error = %err,
                "transient failure past the retry ceiling; finalizing"
            );
            crate::metrics::record_consume("exhausted");
            self.finalize_failed(&intent.intent_id, &err.to_string()).await;
            reject(delivery, false).await;
        } else {
            debug!(
                intent_id = %intent.intent_id,
                retry_count,
                error = %err,
                "transient failure; requeueing"
            );
            crate::metrics::record_consume("requeued");
            self.set_status(&intent.intent_id, MessageStatus::Pending, Some(&err.to_string()))
                .await;
            reject(delivery, true).await;
        }
    }

    /// Best-effort forward status move. A missing row (producer crashed
    /// before insert, or a foreign publisher) is logged, not fatal; an
    /// illegal transition means another writer got there first.
    async fn set_status(&self, intent_id: &str, status: MessageStatus, error_msg: Option<&str>) {
        let truncated = error_msg.map(|m| truncate_msg(m, self.config.error_msg_max_len));
        match self
            .log
            .update_status(intent_id, status, truncated.as_deref())
            .await
        {
            Ok(()) => {}
            Err(LogStoreError::NotFound(_)) => {
                debug!(intent_id, %status, "no log row for intent; skipping status update");
            }
            Err(LogStoreError::IllegalTransition { from, to, .. }) => {
                debug!(intent_id, %from, %to, "status already moved past; skipping");
            }
            Err(e) => error!(intent_id, %status, error = %e, "failed to update message status"),
        }
    }

    async fn finalize_failed(&self, intent_id: &str, reason: &str) {
        self.set_status(intent_id, MessageStatus::Failed, Some(reason))
            .await;
    }

    async fn mark_processed(&self, intent_id: &str) {
        let ttl = Duration::from_secs(self.config.idempotency_ttl_secs);
        if let Err(e) = self.idempotency.mark_processed(intent_id, ttl).await {
            warn!(intent_id, error = %e, "failed to write idempotency marker");
        }
    }
}

async fn settle(delivery: Delivery) {
    if let Err(e) = delivery.ack().await {
        error!(error = %e, "failed to ack delivery");
    }
}

async fn reject(delivery: Delivery, requeue: bool) {
    if let Err(e) = delivery.nack(requeue).await {
        error!(error = %e, requeue, "failed to nack delivery");
    }
}
