// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dead-letter terminal: persist, alert, settle.
//!
//! Everything that arrives here has already lost: the payload was poison,
//! the content never compiled, or the retry ceiling was burned. The job is
//! to make the failure visible (durable entry + alert) and to stop the
//! message from circulating. The handler acks a dead letter only when at
//! least one of persist/alert succeeded; otherwise it is left unsettled for
//! the broker to redeliver.

use crate::broker::{Broker, Delivery};
use crate::error::{truncate_msg, RelayError};
use crate::intent::{now_millis, UpdateIntent};
use crate::record::{MessageLogRecord, MessageStatus};
use crate::store::{LogStoreError, MessageLogStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::AnyPool;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// One terminally failed intent, as recorded for the operator.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub intent_id: String,
    pub rule_key: Option<String>,
    pub rule_version: Option<String>,
    /// Raw payload, lossily decoded; kept for forensics on unparseable
    /// messages.
    pub payload: Option<String>,
    pub reason: String,
    pub occurred_at: i64,
}

impl DeadLetterEntry {
    /// Entry for an exhausted log row (sweeper path).
    pub fn from_record(record: &MessageLogRecord, reason: impl Into<String>) -> Self {
        Self {
            intent_id: record.intent_id.clone(),
            rule_key: Some(record.rule_key.clone()),
            rule_version: Some(record.rule_version.to_string()),
            payload: None,
            reason: reason.into(),
            occurred_at: now_millis(),
        }
    }
}

/// Durable destination for dead letters.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn persist(&self, entry: &DeadLetterEntry) -> Result<(), RelayError>;
}

/// Operator notification channel.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn alert(&self, entry: &DeadLetterEntry) -> Result<(), RelayError>;
}

/// Alerter that raises a structured error-level log event. The default when
/// no paging integration is wired in.
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn alert(&self, entry: &DeadLetterEntry) -> Result<(), RelayError> {
        error!(
            intent_id = %entry.intent_id,
            rule_key = entry.rule_key.as_deref().unwrap_or("?"),
            rule_version = entry.rule_version.as_deref().unwrap_or("?"),
            reason = %entry.reason,
            "rule update intent dead-lettered"
        );
        Ok(())
    }
}

/// In-process sink, used by tests and memory-only deployments.
pub struct InMemoryDeadLetterSink {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl InMemoryDeadLetterSink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for InMemoryDeadLetterSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn persist(&self, entry: &DeadLetterEntry) -> Result<(), RelayError> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

/// SQL sink sharing the message log's pool. Append-only table; retention is
/// an external concern.
pub struct SqlDeadLetterSink {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlDeadLetterSink {
    pub async fn new(pool: AnyPool, is_sqlite: bool) -> Result<Self, RelayError> {
        let sink = Self { pool, is_sqlite };
        sink.init_schema().await?;
        Ok(sink)
    }

    async fn init_schema(&self) -> Result<(), RelayError> {
        let sql = if self.is_sqlite {
            r#"
            CREATE TABLE IF NOT EXISTS dead_letter (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                intent_id TEXT NOT NULL,
                rule_key TEXT,
                rule_version TEXT,
                payload TEXT,
                reason TEXT NOT NULL,
                occurred_at INTEGER NOT NULL
            )
            "#
        } else {
            r#"
            CREATE TABLE IF NOT EXISTS dead_letter (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                intent_id VARCHAR(64) NOT NULL,
                rule_key VARCHAR(255),
                rule_version VARCHAR(50),
                payload TEXT,
                reason TEXT NOT NULL,
                occurred_at BIGINT NOT NULL,
                INDEX idx_intent (intent_id)
            )
            "#
        };

        sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map_err(|e| RelayError::Transient(format!("dead_letter schema: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for SqlDeadLetterSink {
    async fn persist(&self, entry: &DeadLetterEntry) -> Result<(), RelayError> {
        sqlx::query(
            "INSERT INTO dead_letter \
             (intent_id, rule_key, rule_version, payload, reason, occurred_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.intent_id)
        .bind(entry.rule_key.as_deref())
        .bind(entry.rule_version.as_deref())
        .bind(entry.payload.as_deref())
        .bind(&entry.reason)
        .bind(entry.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Transient(format!("dead_letter insert: {e}")))?;

        Ok(())
    }
}

pub struct DeadLetterHandler {
    sink: Arc<dyn DeadLetterSink>,
    alerter: Arc<dyn Alerter>,
    log: Arc<dyn MessageLogStore>,
}

impl DeadLetterHandler {
    pub fn new(
        sink: Arc<dyn DeadLetterSink>,
        alerter: Arc<dyn Alerter>,
        log: Arc<dyn MessageLogStore>,
    ) -> Self {
        Self { sink, alerter, log }
    }

    /// Consume the dead-letter queue until the broker closes or shutdown is
    /// signalled.
    pub async fn run(
        self: Arc<Self>,
        broker: Arc<dyn Broker>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                delivery = broker.next_dead_letter() => {
                    match delivery {
                        Some(delivery) => self.handle(delivery).await,
                        None => {
                            info!("dead-letter queue closed; handler exiting");
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("shutdown signalled; dead-letter handler exiting");
                        return;
                    }
                }
            }
        }
    }

    /// Process one dead-lettered delivery. Parsing is best-effort — the
    /// payload may be the very garbage that got it here.
    pub async fn handle(&self, delivery: Delivery) {
        let intent_id = delivery.intent_id.clone().unwrap_or_else(|| "unknown".into());
        let payload_text = String::from_utf8_lossy(&delivery.payload).into_owned();

        let (rule_key, rule_version) = match UpdateIntent::from_wire(&intent_id, &delivery.payload)
        {
            Ok(intent) => (Some(intent.rule_key), Some(intent.rule_version.to_string())),
            Err(_) => (None, None),
        };

        let reason = self
            .log
            .get(&intent_id)
            .await
            .ok()
            .flatten()
            .and_then(|r| r.error_msg)
            .unwrap_or_else(|| "dead-lettered by broker".into());

        let entry = DeadLetterEntry {
            intent_id: intent_id.clone(),
            rule_key,
            rule_version,
            payload: Some(truncate_msg(&payload_text, 4096)),
            reason,
            occurred_at: now_millis(),
        };

        if self.process(&entry).await {
            self.finalize_record(&intent_id).await;
            if let Err(e) = delivery.ack().await {
                error!(intent_id, error = %e, "failed to ack dead letter");
            }
        } else {
            // leave unsettled; the broker redelivers when the lease expires
            warn!(intent_id, "dead letter neither persisted nor alerted; leaving unsettled");
            crate::metrics::record_dead_letter("unsettled");
        }
    }

    /// Record an exhausted row as a dead letter (the sweeper's entry point;
    /// no broker delivery involved). Returns whether it was recorded.
    pub async fn record_exhausted(&self, record: &MessageLogRecord, reason: &str) -> bool {
        let entry = DeadLetterEntry::from_record(record, reason);
        let recorded = self.process(&entry).await;
        if recorded {
            self.finalize_record(&record.intent_id).await;
        }
        recorded
    }

    /// Persist then alert, in that order. True when at least one succeeded.
    async fn process(&self, entry: &DeadLetterEntry) -> bool {
        let persisted = match self.sink.persist(entry).await {
            Ok(()) => {
                crate::metrics::record_dead_letter("persisted");
                true
            }
            Err(e) => {
                error!(intent_id = %entry.intent_id, error = %e, "failed to persist dead letter");
                crate::metrics::record_dead_letter("persist_failed");
                false
            }
        };

        let alerted = match self.alerter.alert(entry).await {
            Ok(()) => true,
            Err(e) => {
                error!(intent_id = %entry.intent_id, error = %e, "failed to alert on dead letter");
                false
            }
        };

        persisted || alerted
    }

    /// Pin the log row to FAILED. Usually a no-op — whoever routed the
    /// message here finalized it already.
    async fn finalize_record(&self, intent_id: &str) {
        match self
            .log
            .update_status(intent_id, MessageStatus::Failed, None)
            .await
        {
            Ok(()) | Err(LogStoreError::NotFound(_)) => {}
            Err(LogStoreError::IllegalTransition { from, .. }) => {
                debug!(intent_id, %from, "dead-lettered row already terminal");
            }
            Err(e) => warn!(intent_id, error = %e, "failed to finalize dead-lettered row"),
        }
    }
}
