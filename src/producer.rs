// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Send path: validate, log, publish.
//!
//! The producer writes the durable PENDING row BEFORE handing the intent to
//! the broker, so a crash between the two leaves a row the retry sweeper
//! will republish — an intent can be delivered twice, never lost. Publish
//! confirms are consumed on a background task for observability only; the
//! send path never blocks on them.

use crate::backoff::{self, BackoffConfig};
use crate::broker::{Broker, PublishConfirm};
use crate::config::RelayConfig;
use crate::error::{truncate_msg, RelayError};
use crate::intent::{RuleVersion, UpdateIntent};
use crate::record::{MessageLogRecord, MessageStatus};
use crate::shared_cache::RuleContentStore;
use crate::store::MessageLogStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct UpdateProducer {
    broker: Arc<dyn Broker>,
    log: Arc<dyn MessageLogStore>,
    content: Arc<dyn RuleContentStore>,
    config: RelayConfig,
}

impl UpdateProducer {
    pub fn new(
        broker: Arc<dyn Broker>,
        log: Arc<dyn MessageLogStore>,
        content: Arc<dyn RuleContentStore>,
        config: RelayConfig,
    ) -> Self {
        Self {
            broker,
            log,
            content,
            config,
        }
    }

    /// Publish a rule update intent. Returns the generated intent id as soon
    /// as the broker accepts the message; the confirm arrives asynchronously.
    ///
    /// A broker failure here is NOT fatal to the intent: the PENDING row is
    /// already durable and the sweeper republishes it after the grace period.
    pub async fn send(
        &self,
        rule_key: &str,
        rule_version: impl Into<RuleVersion>,
        rule_content: Option<String>,
    ) -> Result<String, RelayError> {
        let _timer = crate::metrics::LatencyTimer::new("publish");
        let intent = self.prepare(rule_key, rule_version, rule_content).await?;

        match self.broker.publish(&intent).await {
            Ok(()) => {
                crate::metrics::record_publish("success");
                info!(
                    intent_id = %intent.intent_id,
                    rule_key = %intent.rule_key,
                    rule_version = %intent.rule_version,
                    "published rule update intent"
                );
                Ok(intent.intent_id)
            }
            Err(e) => {
                crate::metrics::record_publish("failed");
                crate::metrics::record_error("publish", "transient");
                warn!(
                    intent_id = %intent.intent_id,
                    error = %e,
                    "publish failed; row stays PENDING for the sweeper"
                );
                self.note_error(&intent.intent_id, &e.to_string()).await;
                Err(RelayError::Transient(format!("publish: {e}")))
            }
        }
    }

    /// Publish with synchronous in-process retry (exponential backoff,
    /// `2^attempt` seconds). On exhaustion the row is finalized FAILED and
    /// [`RelayError::Exhausted`] is returned — this path is for callers that
    /// need a definitive answer now and do not want the sweeper involved.
    pub async fn send_with_retry(
        &self,
        rule_key: &str,
        rule_version: impl Into<RuleVersion>,
        rule_content: Option<String>,
        max_attempts: usize,
    ) -> Result<String, RelayError> {
        let intent = self.prepare(rule_key, rule_version, rule_content).await?;
        let backoff = BackoffConfig::publish().with_max_attempts(max_attempts.max(1));

        let log = self.log.clone();
        let intent_id = intent.intent_id.clone();
        let max_len = self.config.error_msg_max_len;

        let result = backoff::retry_with(
            "publish",
            &backoff,
            || self.broker.publish(&intent),
            |attempt, err| {
                crate::metrics::record_publish("failed");
                // fire-and-forget: attach the failure to the row so an
                // operator sees why the send path is struggling
                let log = log.clone();
                let intent_id = intent_id.clone();
                let msg = truncate_msg(&format!("publish attempt {attempt}: {err}"), max_len);
                tokio::spawn(async move {
                    if let Err(e) = log
                        .update_status(&intent_id, MessageStatus::Pending, Some(&msg))
                        .await
                    {
                        warn!(intent_id = %intent_id, error = %e, "failed to note publish error");
                    }
                });
            },
        )
        .await;

        match result {
            Ok(()) => {
                crate::metrics::record_publish("success");
                info!(intent_id = %intent.intent_id, "published after retry");
                Ok(intent.intent_id)
            }
            Err(e) => {
                let reason = truncate_msg(&format!("publish exhausted: {e}"), max_len);
                if let Err(e) = self
                    .log
                    .update_status(&intent.intent_id, MessageStatus::Failed, Some(&reason))
                    .await
                {
                    error!(intent_id = %intent.intent_id, error = %e, "failed to finalize exhausted send");
                }
                crate::metrics::record_error("publish", "exhausted");
                Err(RelayError::Exhausted {
                    attempts: backoff.max_attempts as u32,
                    reason,
                })
            }
        }
    }

    /// Current log record for an intent, if any.
    pub async fn message_status(
        &self,
        intent_id: &str,
    ) -> Result<Option<MessageLogRecord>, RelayError> {
        Ok(self.log.get(intent_id).await?)
    }

    /// Manually republish an existing intent, content-less (consumers
    /// re-resolve the content from the shared store). Rejected for rows that
    /// already reached SUCCESS.
    pub async fn resend(&self, intent_id: &str) -> Result<(), RelayError> {
        let record = self
            .log
            .get(intent_id)
            .await?
            .ok_or_else(|| RelayError::Validation(format!("unknown intent: {intent_id}")))?;

        if record.status == MessageStatus::Success {
            return Err(RelayError::Validation(format!(
                "intent {intent_id} already applied"
            )));
        }

        self.broker
            .publish(&record.to_intent())
            .await
            .map_err(|e| RelayError::Transient(format!("publish: {e}")))?;

        crate::metrics::record_publish("resend");
        info!(intent_id, rule_key = %record.rule_key, "manually republished intent");
        Ok(())
    }

    /// Validate, stash content in the shared store, and create the PENDING
    /// row. Shared head of both send paths.
    async fn prepare(
        &self,
        rule_key: &str,
        rule_version: impl Into<RuleVersion>,
        rule_content: Option<String>,
    ) -> Result<UpdateIntent, RelayError> {
        let rule_version = rule_version.into();
        if rule_key.trim().is_empty() {
            return Err(RelayError::Validation("rule_key must not be empty".into()));
        }
        if rule_version.is_empty() {
            return Err(RelayError::Validation(
                "rule_version must not be empty".into(),
            ));
        }

        let intent = UpdateIntent::new(rule_key, rule_version, rule_content);

        if let Some(content) = &intent.rule_content {
            self.content
                .put(
                    &intent.rule_key,
                    intent.rule_version.as_str(),
                    content,
                    Duration::from_secs(self.config.content_ttl_secs),
                )
                .await?;
        }

        let record = MessageLogRecord::pending(
            &intent,
            Duration::from_secs(self.config.publish_grace_secs),
        );
        self.log.insert(&record).await?;

        Ok(intent)
    }

    async fn note_error(&self, intent_id: &str, msg: &str) {
        let msg = truncate_msg(msg, self.config.error_msg_max_len);
        if let Err(e) = self
            .log
            .update_status(intent_id, MessageStatus::Pending, Some(&msg))
            .await
        {
            warn!(intent_id, error = %e, "failed to note publish error on log row");
        }
    }
}

/// Drain the broker's publish-confirm stream until it closes or shutdown is
/// signalled. Confirms are observability only; correctness never depends on
/// them arriving.
pub fn spawn_confirm_listener(
    mut confirms: mpsc::UnboundedReceiver<PublishConfirm>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                confirm = confirms.recv() => {
                    let Some(confirm) = confirm else { return };
                    crate::metrics::record_confirm(confirm.ack);
                    if confirm.ack {
                        debug!(intent_id = %confirm.intent_id, "broker confirmed publish");
                    } else {
                        warn!(
                            intent_id = %confirm.intent_id,
                            reason = confirm.reason.as_deref().unwrap_or("unknown"),
                            "broker rejected publish; sweeper will republish"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::shared_cache::InMemoryContentStore;
    use crate::store::InMemoryLogStore;

    fn producer_with(broker: Arc<InMemoryBroker>) -> (UpdateProducer, Arc<InMemoryLogStore>, Arc<InMemoryContentStore>) {
        let log = Arc::new(InMemoryLogStore::new());
        let content = Arc::new(InMemoryContentStore::new());
        let producer = UpdateProducer::new(
            broker,
            log.clone(),
            content.clone(),
            RelayConfig::test(),
        );
        (producer, log, content)
    }

    #[tokio::test]
    async fn test_send_creates_pending_row_and_publishes() {
        let broker = Arc::new(InMemoryBroker::new());
        let (producer, log, content) = producer_with(broker.clone());

        let id = producer
            .send("pricing.discount", "2", Some("rule text".into()))
            .await
            .unwrap();

        let record = log.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Pending);
        assert_eq!(record.rule_key, "pricing.discount");
        assert_eq!(broker.published_count(), 1);

        // content stashed for content-less redeliveries
        let stored = content.get("pricing.discount", "2").await.unwrap();
        assert_eq!(stored.as_deref(), Some("rule text"));
    }

    #[tokio::test]
    async fn test_send_rejects_blank_fields() {
        let broker = Arc::new(InMemoryBroker::new());
        let (producer, log, _) = producer_with(broker.clone());

        let err = producer.send("", "1", None).await.unwrap_err();
        assert_eq!(err.kind(), "validation");

        let err = producer.send("k1", "  ", None).await.unwrap_err();
        assert_eq!(err.kind(), "validation");

        assert_eq!(broker.published_count(), 0);
        // nothing was logged either
        assert!(log.due_for_retry(i64::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_leaves_row_pending() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_publish_failing(true);
        let (producer, log, _) = producer_with(broker);

        let err = producer.send("k1", "1", None).await.unwrap_err();
        assert!(err.is_retryable());

        // the row survives for the sweeper, error noted
        let rows = log.due_for_retry(i64::MAX).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, MessageStatus::Pending);
        assert!(rows[0].error_msg.as_deref().unwrap_or("").contains("outage"));
    }

    #[tokio::test]
    async fn test_send_with_retry_exhaustion_finalizes_failed() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_publish_failing(true);
        let (producer, log, _) = producer_with(broker);

        let err = producer
            .send_with_retry("k1", "1", None, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Exhausted { attempts: 2, .. }));

        let rows = log.due_for_retry(i64::MAX).await.unwrap();
        // FAILED rows are not retry candidates
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_send_with_retry_first_try_success() {
        let broker = Arc::new(InMemoryBroker::new());
        let (producer, log, _) = producer_with(broker.clone());

        let id = producer
            .send_with_retry("k1", "1", Some("content".into()), 3)
            .await
            .unwrap();

        assert_eq!(broker.published_count(), 1);
        let record = log.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn test_message_status_lookup() {
        let broker = Arc::new(InMemoryBroker::new());
        let (producer, _, _) = producer_with(broker);

        let id = producer.send("k1", "1", None).await.unwrap();
        let record = producer.message_status(&id).await.unwrap().unwrap();
        assert_eq!(record.intent_id, id);

        assert!(producer.message_status("no-such-id").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resend_republishes_content_less() {
        let broker = Arc::new(InMemoryBroker::new());
        let (producer, _, _) = producer_with(broker.clone());

        let id = producer.send("k1", "1", Some("content".into())).await.unwrap();
        producer.resend(&id).await.unwrap();
        assert_eq!(broker.published_count(), 2);

        // first delivery carries content, resend does not
        let first = broker.next_update().await.unwrap();
        let intent = UpdateIntent::from_wire(&id, &first.payload).unwrap();
        assert!(intent.rule_content.is_some());
        first.ack().await.unwrap();

        let second = broker.next_update().await.unwrap();
        let intent = UpdateIntent::from_wire(&id, &second.payload).unwrap();
        assert!(intent.rule_content.is_none());
        second.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_resend_unknown_or_applied_rejected() {
        let broker = Arc::new(InMemoryBroker::new());
        let (producer, log, _) = producer_with(broker);

        let err = producer.resend("no-such-id").await.unwrap_err();
        assert_eq!(err.kind(), "validation");

        let id = producer.send("k1", "1", None).await.unwrap();
        log.update_status(&id, MessageStatus::Success, None).await.unwrap();
        let err = producer.resend(&id).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn test_confirm_listener_drains_stream() {
        let broker = Arc::new(InMemoryBroker::new());
        let confirms = broker.take_confirms().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_confirm_listener(confirms, shutdown_rx);

        let (producer, _, _) = producer_with(broker.clone());
        producer.send("k1", "1", None).await.unwrap();

        drop(broker);
        drop(producer);
        // channel closes once all senders drop; listener exits cleanly
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_confirm_listener_exits_on_shutdown() {
        let broker = Arc::new(InMemoryBroker::new());
        let confirms = broker.take_confirms().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_confirm_listener(confirms, shutdown_rx);

        shutdown_tx.send(true).unwrap();
        // broker (and its confirm sender) still alive
        handle.await.unwrap();
        drop(broker);
    }
}
