// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared volatile caches: rule content by key+version, and idempotency
//! markers by intent id.
//!
//! Both are advisory, eventually-consistent stores shared across worker
//! processes (Redis in production, in-process maps for tests and
//! single-process deployments). Losing either never causes
//! double-application: the rule cache's version check is the idempotency
//! backstop, the markers just short-circuit redelivery before it touches
//! the durable log.
//!
//! Keyspace:
//! - content:  `rule:content:{rule_key}:{rule_version}` (SETEX)
//! - markers:  `rule:processed:{intent_id}` (SETEX, 24h default)

use crate::error::RelayError;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::{Duration, Instant};
use tracing::warn;

/// Key-versioned store of rule source text.
#[async_trait]
pub trait RuleContentStore: Send + Sync {
    /// Content for (key, version), or `None` when absent/expired.
    async fn get(&self, rule_key: &str, rule_version: &str) -> Result<Option<String>, RelayError>;

    /// Store content with a TTL.
    async fn put(
        &self,
        rule_key: &str,
        rule_version: &str,
        content: &str,
        ttl: Duration,
    ) -> Result<(), RelayError>;
}

/// Time-bounded processed-intent markers.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Whether the intent id is already marked processed.
    async fn is_processed(&self, intent_id: &str) -> Result<bool, RelayError>;

    /// Mark the intent id processed, expiring after `ttl`.
    async fn mark_processed(&self, intent_id: &str, ttl: Duration) -> Result<(), RelayError>;
}

// --- In-memory backends ---

/// In-process content store with per-entry expiry.
pub struct InMemoryContentStore {
    entries: DashMap<String, (String, Instant)>,
}

impl InMemoryContentStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn key(rule_key: &str, rule_version: &str) -> String {
        format!("{rule_key}:{rule_version}")
    }
}

impl Default for InMemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuleContentStore for InMemoryContentStore {
    async fn get(&self, rule_key: &str, rule_version: &str) -> Result<Option<String>, RelayError> {
        let key = Self::key(rule_key, rule_version);
        match self.entries.get(&key) {
            Some(entry) if entry.1 > Instant::now() => Ok(Some(entry.0.clone())),
            Some(_) => {
                drop(self.entries.remove(&key));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        rule_key: &str,
        rule_version: &str,
        content: &str,
        ttl: Duration,
    ) -> Result<(), RelayError> {
        self.entries.insert(
            Self::key(rule_key, rule_version),
            (content.to_string(), Instant::now() + ttl),
        );
        Ok(())
    }
}

/// In-process idempotency markers with per-entry expiry.
pub struct InMemoryIdempotencyStore {
    markers: DashMap<String, Instant>,
}

impl InMemoryIdempotencyStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            markers: DashMap::new(),
        }
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn is_processed(&self, intent_id: &str) -> Result<bool, RelayError> {
        match self.markers.get(intent_id) {
            Some(expiry) if *expiry > Instant::now() => Ok(true),
            Some(_) => {
                drop(self.markers.remove(intent_id));
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn mark_processed(&self, intent_id: &str, ttl: Duration) -> Result<(), RelayError> {
        self.markers
            .insert(intent_id.to_string(), Instant::now() + ttl);
        Ok(())
    }
}

// --- Redis backends ---

/// Redis-backed content and idempotency store, shared across workers.
pub struct RedisSharedCache {
    connection: ConnectionManager,
}

impl RedisSharedCache {
    pub async fn new(connection_string: &str) -> Result<Self, RelayError> {
        let client = Client::open(connection_string)
            .map_err(|e| RelayError::Transient(format!("redis open: {e}")))?;

        let connection = crate::backoff::retry(
            "redis_connect",
            &crate::backoff::BackoffConfig::startup(),
            || async { ConnectionManager::new(client.clone()).await },
        )
        .await
        .map_err(|e: redis::RedisError| RelayError::Transient(format!("redis connect: {e}")))?;

        Ok(Self { connection })
    }

    fn content_key(rule_key: &str, rule_version: &str) -> String {
        format!("rule:content:{rule_key}:{rule_version}")
    }

    fn marker_key(intent_id: &str) -> String {
        format!("rule:processed:{intent_id}")
    }
}

#[async_trait]
impl RuleContentStore for RedisSharedCache {
    async fn get(&self, rule_key: &str, rule_version: &str) -> Result<Option<String>, RelayError> {
        let mut conn = self.connection.clone();
        conn.get(Self::content_key(rule_key, rule_version))
            .await
            .map_err(|e| RelayError::Transient(format!("redis get: {e}")))
    }

    async fn put(
        &self,
        rule_key: &str,
        rule_version: &str,
        content: &str,
        ttl: Duration,
    ) -> Result<(), RelayError> {
        let mut conn = self.connection.clone();
        conn.set_ex::<_, _, ()>(
            Self::content_key(rule_key, rule_version),
            content,
            ttl.as_secs(),
        )
        .await
        .map_err(|e| RelayError::Transient(format!("redis setex: {e}")))
    }
}

#[async_trait]
impl IdempotencyStore for RedisSharedCache {
    async fn is_processed(&self, intent_id: &str) -> Result<bool, RelayError> {
        let mut conn = self.connection.clone();
        conn.exists(Self::marker_key(intent_id))
            .await
            .map_err(|e| RelayError::Transient(format!("redis exists: {e}")))
    }

    async fn mark_processed(&self, intent_id: &str, ttl: Duration) -> Result<(), RelayError> {
        let mut conn = self.connection.clone();
        // Marker writes are advisory; the terminal log row still backstops
        // dedup if this write is lost.
        conn.set_ex::<_, _, ()>(Self::marker_key(intent_id), "processed", ttl.as_secs())
            .await
            .map_err(|e| {
                warn!(intent_id, error = %e, "failed to write idempotency marker");
                RelayError::Transient(format!("redis setex: {e}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_content_roundtrip() {
        let store = InMemoryContentStore::new();

        store
            .put("k1", "2", "rule text", Duration::from_secs(60))
            .await
            .unwrap();

        let content = store.get("k1", "2").await.unwrap();
        assert_eq!(content.as_deref(), Some("rule text"));
    }

    #[tokio::test]
    async fn test_content_versions_are_distinct() {
        let store = InMemoryContentStore::new();

        store.put("k1", "1", "v1", Duration::from_secs(60)).await.unwrap();
        store.put("k1", "2", "v2", Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.get("k1", "1").await.unwrap().as_deref(), Some("v1"));
        assert_eq!(store.get("k1", "2").await.unwrap().as_deref(), Some("v2"));
        assert!(store.get("k1", "3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_content_expires() {
        let store = InMemoryContentStore::new();

        store.put("k1", "1", "v1", Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(store.get("k1", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_marker_roundtrip() {
        let store = InMemoryIdempotencyStore::new();

        assert!(!store.is_processed("id-1").await.unwrap());
        store
            .mark_processed("id-1", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.is_processed("id-1").await.unwrap());
        assert!(!store.is_processed("id-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_marker_expires() {
        let store = InMemoryIdempotencyStore::new();

        store.mark_processed("id-1", Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(!store.is_processed("id-1").await.unwrap());
    }
}
