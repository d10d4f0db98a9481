use crate::record::{MessageLogRecord, MessageStatus};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LogStoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("illegal status transition {from} -> {to} for {intent_id}")]
    IllegalTransition {
        intent_id: String,
        from: MessageStatus,
        to: MessageStatus,
    },
    #[error("log store backend error: {0}")]
    Backend(String),
}

/// Durable store for [`MessageLogRecord`] rows.
///
/// Implementations enforce the forward-only status machine: an update that
/// would move a row backwards (or out of a terminal state) fails with
/// [`LogStoreError::IllegalTransition`]. Single-row updates are the unit of
/// atomicity; no multi-row transactions are required.
#[async_trait]
pub trait MessageLogStore: Send + Sync {
    /// Insert a fresh record. Fails on duplicate intent id.
    async fn insert(&self, record: &MessageLogRecord) -> Result<(), LogStoreError>;

    /// Fetch a record by intent id.
    async fn get(&self, intent_id: &str) -> Result<Option<MessageLogRecord>, LogStoreError>;

    /// Move a record's status forward, optionally recording an error message.
    async fn update_status(
        &self,
        intent_id: &str,
        status: MessageStatus,
        error_msg: Option<&str>,
    ) -> Result<(), LogStoreError>;

    /// Set retry bookkeeping on a row. The retry sweeper is the sole caller
    /// once an intent is in flight; `retry_count` must never decrease.
    async fn record_retry(
        &self,
        intent_id: &str,
        retry_count: u32,
        next_retry_at: i64,
    ) -> Result<(), LogStoreError>;

    /// PENDING rows whose `next_retry_at` is at or before `now` (epoch
    /// millis). Includes rows at the retry ceiling so the sweeper can
    /// finalize them.
    async fn due_for_retry(&self, now: i64) -> Result<Vec<MessageLogRecord>, LogStoreError>;
}
