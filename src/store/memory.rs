use super::traits::{LogStoreError, MessageLogStore};
use crate::intent::now_millis;
use crate::record::{MessageLogRecord, MessageStatus};
use async_trait::async_trait;
use dashmap::DashMap;

/// In-memory message log, used by tests and single-process deployments.
pub struct InMemoryLogStore {
    records: DashMap<String, MessageLogRecord>,
}

impl InMemoryLogStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for InMemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageLogStore for InMemoryLogStore {
    async fn insert(&self, record: &MessageLogRecord) -> Result<(), LogStoreError> {
        use dashmap::mapref::entry::Entry;
        match self.records.entry(record.intent_id.clone()) {
            Entry::Occupied(_) => Err(LogStoreError::Backend(format!(
                "duplicate intent id {}",
                record.intent_id
            ))),
            Entry::Vacant(v) => {
                v.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, intent_id: &str) -> Result<Option<MessageLogRecord>, LogStoreError> {
        Ok(self.records.get(intent_id).map(|r| r.value().clone()))
    }

    async fn update_status(
        &self,
        intent_id: &str,
        status: MessageStatus,
        error_msg: Option<&str>,
    ) -> Result<(), LogStoreError> {
        let mut record = self
            .records
            .get_mut(intent_id)
            .ok_or_else(|| LogStoreError::NotFound(intent_id.to_string()))?;

        if !record.status.can_transition(status) {
            return Err(LogStoreError::IllegalTransition {
                intent_id: intent_id.to_string(),
                from: record.status,
                to: status,
            });
        }

        record.status = status;
        if let Some(msg) = error_msg {
            record.error_msg = Some(msg.to_string());
        }
        record.updated_at = now_millis();
        Ok(())
    }

    async fn record_retry(
        &self,
        intent_id: &str,
        retry_count: u32,
        next_retry_at: i64,
    ) -> Result<(), LogStoreError> {
        let mut record = self
            .records
            .get_mut(intent_id)
            .ok_or_else(|| LogStoreError::NotFound(intent_id.to_string()))?;

        // retry_count only increases
        record.retry_count = record.retry_count.max(retry_count);
        record.next_retry_at = next_retry_at;
        record.updated_at = now_millis();
        Ok(())
    }

    async fn due_for_retry(&self, now: i64) -> Result<Vec<MessageLogRecord>, LogStoreError> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.status == MessageStatus::Pending && r.next_retry_at <= now)
            .map(|r| r.value().clone())
            .collect())
    }
}
