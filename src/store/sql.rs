// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL message log backend.
//!
//! One row per intent, status stored as a stable integer code:
//!
//! ```sql
//! CREATE TABLE message_log (
//!   intent_id VARCHAR(64) PRIMARY KEY,
//!   rule_key VARCHAR(255) NOT NULL,
//!   rule_version VARCHAR(50) NOT NULL,
//!   status INT NOT NULL,          -- 0 PENDING, 1 PROCESSING, 2 SUCCESS, 3 FAILED
//!   retry_count INT NOT NULL,
//!   next_retry_at BIGINT NOT NULL,
//!   error_msg TEXT,
//!   created_at BIGINT NOT NULL,
//!   updated_at BIGINT NOT NULL
//! )
//! ```
//!
//! The forward-only status machine is enforced inside the UPDATE itself
//! (`WHERE status IN (allowed_from)`), so a single-row statement is the unit
//! of atomicity and concurrent writers cannot move a row backwards.
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver treats MySQL TEXT as BLOB, so text columns are read as
//! `String` first with a `Vec<u8>` fallback so reads work on both backends.

use super::traits::{LogStoreError, MessageLogStore};
use crate::backoff::{retry, BackoffConfig};
use crate::intent::now_millis;
use crate::record::{MessageLogRecord, MessageStatus};
use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::sync::Once;
use std::time::Duration;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlLogStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlLogStore {
    /// Connect and initialize the schema, with startup-mode retry so a bad
    /// connection string fails fast.
    pub async fn new(connection_string: &str) -> Result<Self, LogStoreError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("log_store_connect", &BackoffConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(10))
                .connect(connection_string)
                .await
                .map_err(|e| LogStoreError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// Clone of the pool, for sharing with the SQL dead-letter sink.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), LogStoreError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| LogStoreError::Backend(format!("failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| LogStoreError::Backend(format!("failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), LogStoreError> {
        let sql = if self.is_sqlite {
            r#"
            CREATE TABLE IF NOT EXISTS message_log (
                intent_id TEXT PRIMARY KEY,
                rule_key TEXT NOT NULL,
                rule_version TEXT NOT NULL,
                status INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at INTEGER NOT NULL DEFAULT 0,
                error_msg TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#
        } else {
            r#"
            CREATE TABLE IF NOT EXISTS message_log (
                intent_id VARCHAR(64) PRIMARY KEY,
                rule_key VARCHAR(255) NOT NULL,
                rule_version VARCHAR(50) NOT NULL,
                status INT NOT NULL DEFAULT 0,
                retry_count INT NOT NULL DEFAULT 0,
                next_retry_at BIGINT NOT NULL DEFAULT 0,
                error_msg TEXT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                INDEX idx_status_retry (status, next_retry_at)
            )
            "#
        };

        retry("log_store_init_schema", &BackoffConfig::startup(), || async {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| LogStoreError::Backend(e.to_string()))
        })
        .await?;

        Ok(())
    }

    /// Status codes an update to `target` may come from. Self-transitions
    /// are allowed (re-asserting a state is harmless).
    fn allowed_from(target: MessageStatus) -> &'static str {
        match target {
            MessageStatus::Pending => "0",
            MessageStatus::Processing => "0, 1",
            MessageStatus::Success => "0, 1, 2",
            MessageStatus::Failed => "0, 1, 3",
        }
    }

    fn row_to_record(row: &sqlx::any::AnyRow) -> Result<MessageLogRecord, LogStoreError> {
        // Text columns: String first (SQLite), bytes fallback (MySQL via Any)
        let read_text = |name: &str| -> Option<String> {
            row.try_get::<String, _>(name).ok().or_else(|| {
                row.try_get::<Vec<u8>, _>(name)
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
            })
        };

        let intent_id = read_text("intent_id")
            .ok_or_else(|| LogStoreError::Backend("missing intent_id column".into()))?;
        let rule_key = read_text("rule_key")
            .ok_or_else(|| LogStoreError::Backend("missing rule_key column".into()))?;
        let rule_version = read_text("rule_version")
            .ok_or_else(|| LogStoreError::Backend("missing rule_version column".into()))?;

        let status_code: i64 = row
            .try_get("status")
            .map_err(|e| LogStoreError::Backend(e.to_string()))?;
        let status = MessageStatus::from_code(status_code as i32).ok_or_else(|| {
            LogStoreError::Backend(format!("unknown status code {} for {}", status_code, intent_id))
        })?;

        let retry_count: i64 = row.try_get("retry_count").unwrap_or(0);
        let next_retry_at: i64 = row.try_get("next_retry_at").unwrap_or(0);
        let created_at: i64 = row.try_get("created_at").unwrap_or(0);
        let updated_at: i64 = row.try_get("updated_at").unwrap_or(0);

        Ok(MessageLogRecord {
            intent_id,
            rule_key,
            rule_version: rule_version.into(),
            status,
            retry_count: retry_count as u32,
            next_retry_at,
            error_msg: read_text("error_msg"),
            created_at,
            updated_at,
        })
    }
}

#[async_trait]
impl MessageLogStore for SqlLogStore {
    async fn insert(&self, record: &MessageLogRecord) -> Result<(), LogStoreError> {
        sqlx::query(
            "INSERT INTO message_log \
             (intent_id, rule_key, rule_version, status, retry_count, next_retry_at, error_msg, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.intent_id)
        .bind(&record.rule_key)
        .bind(record.rule_version.as_str())
        .bind(record.status.code())
        .bind(record.retry_count as i64)
        .bind(record.next_retry_at)
        .bind(record.error_msg.as_deref())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| LogStoreError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, intent_id: &str) -> Result<Option<MessageLogRecord>, LogStoreError> {
        let row = sqlx::query("SELECT * FROM message_log WHERE intent_id = ?")
            .bind(intent_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LogStoreError::Backend(e.to_string()))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_status(
        &self,
        intent_id: &str,
        status: MessageStatus,
        error_msg: Option<&str>,
    ) -> Result<(), LogStoreError> {
        let sql = format!(
            "UPDATE message_log \
             SET status = ?, error_msg = COALESCE(?, error_msg), updated_at = ? \
             WHERE intent_id = ? AND status IN ({})",
            Self::allowed_from(status)
        );

        let result = sqlx::query(&sql)
            .bind(status.code())
            .bind(error_msg)
            .bind(now_millis())
            .bind(intent_id)
            .execute(&self.pool)
            .await
            .map_err(|e| LogStoreError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            // Distinguish "no such row" from "row refused to move backwards"
            match self.get(intent_id).await? {
                None => Err(LogStoreError::NotFound(intent_id.to_string())),
                Some(record) => Err(LogStoreError::IllegalTransition {
                    intent_id: intent_id.to_string(),
                    from: record.status,
                    to: status,
                }),
            }
        } else {
            Ok(())
        }
    }

    async fn record_retry(
        &self,
        intent_id: &str,
        retry_count: u32,
        next_retry_at: i64,
    ) -> Result<(), LogStoreError> {
        // CASE keeps retry_count monotone without a read-modify-write race
        let result = sqlx::query(
            "UPDATE message_log \
             SET retry_count = CASE WHEN retry_count < ? THEN ? ELSE retry_count END, \
                 next_retry_at = ?, updated_at = ? \
             WHERE intent_id = ?",
        )
        .bind(retry_count as i64)
        .bind(retry_count as i64)
        .bind(next_retry_at)
        .bind(now_millis())
        .bind(intent_id)
        .execute(&self.pool)
        .await
        .map_err(|e| LogStoreError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            Err(LogStoreError::NotFound(intent_id.to_string()))
        } else {
            Ok(())
        }
    }

    async fn due_for_retry(&self, now: i64) -> Result<Vec<MessageLogRecord>, LogStoreError> {
        let rows = sqlx::query(
            "SELECT * FROM message_log WHERE status = 0 AND next_retry_at <= ? ORDER BY next_retry_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LogStoreError::Backend(e.to_string()))?;

        rows.iter().map(Self::row_to_record).collect()
    }
}
