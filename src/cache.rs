// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Concurrent rule cache with version-monotonic hot swap.
//!
//! The cache maps rule keys to their currently active executable unit. It is
//! read concurrently by request-serving executors and written by consumer
//! workers; the two never block each other across keys.
//!
//! Invariants:
//! - Readers observe either the entirely-old or entirely-new unit for a key,
//!   never a half-constructed one (entry replacement is a single map insert).
//! - At most one compile-and-install is in flight per key: installs serialize
//!   on a per-key async mutex, never a global lock.
//! - A key's version never regresses. [`RuleCache::hot_swap`] with an older
//!   version is a silent no-op returning `false`, which is how out-of-order
//!   broker deliveries are resolved without strict sequencing.

use crate::compiler::{ExecutableUnit, RuleCompiler};
use crate::error::RelayError;
use crate::intent::RuleVersion;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// An authoritative rule definition: the newest enabled source for a key.
#[derive(Debug, Clone)]
pub struct RuleDefinition {
    pub rule_key: String,
    pub rule_version: RuleVersion,
    pub content: String,
}

/// Authoritative store of rule definitions (the relational store behind the
/// authoring surface). Backend failures should surface as
/// [`RelayError::Transient`].
#[async_trait]
pub trait RuleDefinitionStore: Send + Sync {
    /// Latest enabled definition for a key, or `None` when the rule does
    /// not exist or is disabled.
    async fn find_active(&self, rule_key: &str) -> Result<Option<RuleDefinition>, RelayError>;
}

struct CacheEntry {
    unit: ExecutableUnit,
    version: RuleVersion,
    content_fingerprint: u64,
}

/// Concurrent map from rule key to the active executable unit.
pub struct RuleCache {
    compiler: Arc<dyn RuleCompiler>,
    definitions: Arc<dyn RuleDefinitionStore>,
    entries: DashMap<String, CacheEntry>,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RuleCache {
    pub fn new(compiler: Arc<dyn RuleCompiler>, definitions: Arc<dyn RuleDefinitionStore>) -> Self {
        Self {
            compiler,
            definitions,
            entries: DashMap::new(),
            key_locks: DashMap::new(),
        }
    }

    fn key_lock(&self, rule_key: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(rule_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn fingerprint(content: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        content.hash(&mut hasher);
        hasher.finish()
    }

    /// Get the active unit for a key, compiling lazily from the
    /// authoritative store on first use.
    pub async fn get_or_load(&self, rule_key: &str) -> Result<ExecutableUnit, RelayError> {
        if let Some(entry) = self.entries.get(rule_key) {
            return Ok(entry.unit.clone());
        }

        let lock = self.key_lock(rule_key);
        let _guard = lock.lock().await;

        // another caller may have loaded while we waited
        if let Some(entry) = self.entries.get(rule_key) {
            return Ok(entry.unit.clone());
        }

        let definition = self
            .definitions
            .find_active(rule_key)
            .await?
            .ok_or_else(|| {
                RelayError::Validation(format!("rule not found or disabled: {rule_key}"))
            })?;

        let unit = self
            .compiler
            .compile(&definition.content)
            .map_err(|e| RelayError::Compile(e.details))?;

        info!(rule_key, version = %definition.rule_version, "lazily compiled rule on first use");
        crate::metrics::record_compile("lazy");

        self.entries.insert(
            rule_key.to_string(),
            CacheEntry {
                unit: unit.clone(),
                version: definition.rule_version,
                content_fingerprint: Self::fingerprint(&definition.content),
            },
        );

        Ok(unit)
    }

    /// Atomically install a freshly compiled unit for `rule_key`, if and
    /// only if `version` does not regress the entry.
    ///
    /// Returns `Ok(false)` without touching the entry when a newer version
    /// is already installed, or when the same version with identical content
    /// is already applied (equal-version redelivery). The same version with
    /// *different* content re-installs — a content fix at an unchanged
    /// version number.
    ///
    /// Compilation happens outside the per-key critical section; only the
    /// compare-and-install holds the lock.
    pub async fn hot_swap(
        &self,
        rule_key: &str,
        version: &RuleVersion,
        content: &str,
    ) -> Result<bool, RelayError> {
        let fingerprint = Self::fingerprint(content);

        // cheap pre-check saves a pointless compile on stale deliveries
        if let Some(entry) = self.entries.get(rule_key) {
            if entry.version > *version
                || (entry.version == *version && entry.content_fingerprint == fingerprint)
            {
                debug!(rule_key, %version, installed = %entry.version, "hot swap skipped, not newer");
                crate::metrics::record_hot_swap("skipped_stale");
                return Ok(false);
            }
        }

        let unit = self
            .compiler
            .compile(content)
            .map_err(|e| RelayError::Compile(e.details))?;

        let lock = self.key_lock(rule_key);
        let _guard = lock.lock().await;

        // re-check under the lock; a concurrent swap may have won
        if let Some(entry) = self.entries.get(rule_key) {
            if entry.version > *version
                || (entry.version == *version && entry.content_fingerprint == fingerprint)
            {
                debug!(rule_key, %version, installed = %entry.version, "hot swap lost the race, not newer");
                crate::metrics::record_hot_swap("skipped_stale");
                return Ok(false);
            }
        }

        self.entries.insert(
            rule_key.to_string(),
            CacheEntry {
                unit,
                version: version.clone(),
                content_fingerprint: fingerprint,
            },
        );

        info!(rule_key, %version, "hot-swapped rule");
        crate::metrics::record_hot_swap("applied");
        crate::metrics::set_cached_rules(self.entries.len());
        Ok(true)
    }

    /// Force recompilation from the authoritative store, bypassing the
    /// version-monotonicity check. Operator-triggered refresh.
    pub async fn reload(&self, rule_key: &str) -> Result<ExecutableUnit, RelayError> {
        let lock = self.key_lock(rule_key);
        let _guard = lock.lock().await;

        let definition = self
            .definitions
            .find_active(rule_key)
            .await?
            .ok_or_else(|| {
                RelayError::Validation(format!("rule not found or disabled: {rule_key}"))
            })?;

        let unit = self
            .compiler
            .compile(&definition.content)
            .map_err(|e| RelayError::Compile(e.details))?;

        warn!(rule_key, version = %definition.rule_version, "forced rule reload");
        crate::metrics::record_compile("reload");

        self.entries.insert(
            rule_key.to_string(),
            CacheEntry {
                unit: unit.clone(),
                version: definition.rule_version,
                content_fingerprint: Self::fingerprint(&definition.content),
            },
        );

        Ok(unit)
    }

    /// Currently installed version for a key, if loaded.
    #[must_use]
    pub fn current_version(&self, rule_key: &str) -> Option<RuleVersion> {
        self.entries.get(rule_key).map(|e| e.version.clone())
    }

    /// All rule keys with a loaded unit.
    #[must_use]
    pub fn loaded_keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompileError, CompiledRule, RuleSession};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeUnit;

    impl CompiledRule for FakeUnit {
        fn new_session(&self) -> Box<dyn RuleSession> {
            unimplemented!("not exercised by cache tests")
        }
    }

    struct FakeCompiler {
        compiles: AtomicUsize,
    }

    impl FakeCompiler {
        fn new() -> Self {
            Self {
                compiles: AtomicUsize::new(0),
            }
        }
    }

    impl RuleCompiler for FakeCompiler {
        fn compile(&self, source: &str) -> Result<ExecutableUnit, CompileError> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            if source.contains("syntax error") {
                return Err(CompileError::new("bad source"));
            }
            Ok(Arc::new(FakeUnit))
        }
    }

    struct FakeDefinitions {
        definition: Option<RuleDefinition>,
    }

    #[async_trait]
    impl RuleDefinitionStore for FakeDefinitions {
        async fn find_active(&self, _rule_key: &str) -> Result<Option<RuleDefinition>, RelayError> {
            Ok(self.definition.clone())
        }
    }

    fn cache_with(definition: Option<RuleDefinition>) -> (RuleCache, Arc<FakeCompiler>) {
        let compiler = Arc::new(FakeCompiler::new());
        let cache = RuleCache::new(
            compiler.clone(),
            Arc::new(FakeDefinitions { definition }),
        );
        (cache, compiler)
    }

    fn definition(key: &str, version: &str, content: &str) -> RuleDefinition {
        RuleDefinition {
            rule_key: key.into(),
            rule_version: version.into(),
            content: content.into(),
        }
    }

    #[tokio::test]
    async fn test_get_or_load_compiles_once() {
        let (cache, compiler) = cache_with(Some(definition("k1", "1", "rule v1")));

        cache.get_or_load("k1").await.unwrap();
        cache.get_or_load("k1").await.unwrap();

        assert_eq!(compiler.compiles.load(Ordering::SeqCst), 1);
        assert_eq!(cache.current_version("k1"), Some("1".into()));
    }

    #[tokio::test]
    async fn test_get_or_load_missing_rule_is_validation_error() {
        let (cache, _) = cache_with(None);

        let err = cache.get_or_load("ghost").await.err().unwrap();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[tokio::test]
    async fn test_hot_swap_installs_newer_version() {
        let (cache, _) = cache_with(None);

        let applied = cache.hot_swap("k1", &"1".into(), "C1").await.unwrap();
        assert!(applied);
        assert_eq!(cache.current_version("k1"), Some("1".into()));

        let applied = cache.hot_swap("k1", &"2".into(), "C2").await.unwrap();
        assert!(applied);
        assert_eq!(cache.current_version("k1"), Some("2".into()));
    }

    #[tokio::test]
    async fn test_hot_swap_never_regresses() {
        let (cache, compiler) = cache_with(None);

        cache.hot_swap("k1", &"2".into(), "C2").await.unwrap();
        let compiles_after_install = compiler.compiles.load(Ordering::SeqCst);

        // stale redelivery of version 1 after 2 applied
        let applied = cache.hot_swap("k1", &"1".into(), "C1").await.unwrap();
        assert!(!applied);
        assert_eq!(cache.current_version("k1"), Some("2".into()));
        // the stale swap was rejected before compiling
        assert_eq!(compiler.compiles.load(Ordering::SeqCst), compiles_after_install);
    }

    #[tokio::test]
    async fn test_equal_version_identical_content_is_noop() {
        let (cache, _) = cache_with(None);

        assert!(cache.hot_swap("k1", &"1".into(), "C1").await.unwrap());
        assert!(!cache.hot_swap("k1", &"1".into(), "C1").await.unwrap());
    }

    #[tokio::test]
    async fn test_equal_version_different_content_reinstalls() {
        let (cache, _) = cache_with(None);

        assert!(cache.hot_swap("k1", &"1".into(), "C1").await.unwrap());
        // content fix at the same version number
        assert!(cache.hot_swap("k1", &"1".into(), "C1-fixed").await.unwrap());
    }

    #[tokio::test]
    async fn test_compile_error_surfaces_without_touching_entry() {
        let (cache, _) = cache_with(None);
        cache.hot_swap("k1", &"1".into(), "C1").await.unwrap();

        let err = cache
            .hot_swap("k1", &"2".into(), "syntax error here")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Compile(_)));
        assert_eq!(cache.current_version("k1"), Some("1".into()));
    }

    #[tokio::test]
    async fn test_reload_bypasses_monotonicity() {
        let (cache, compiler) = cache_with(Some(definition("k1", "1", "authoritative v1")));

        // consumer installed a higher version than the store knows about
        cache.hot_swap("k1", &"5".into(), "C5").await.unwrap();

        cache.reload("k1").await.unwrap();
        assert_eq!(cache.current_version("k1"), Some("1".into()));
        assert!(compiler.compiles.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (cache, _) = cache_with(None);

        cache.hot_swap("k1", &"1".into(), "C1").await.unwrap();
        cache.hot_swap("k2", &"7".into(), "C7").await.unwrap();

        assert_eq!(cache.current_version("k1"), Some("1".into()));
        assert_eq!(cache.current_version("k2"), Some("7".into()));
        let mut keys = cache.loaded_keys();
        keys.sort();
        assert_eq!(keys, vec!["k1", "k2"]);
    }

    #[tokio::test]
    async fn test_concurrent_swaps_converge_to_highest_version() {
        let (cache, _) = cache_with(None);
        let cache = Arc::new(cache);

        let mut handles = Vec::new();
        for v in 1..=10u32 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .hot_swap("k1", &v.to_string().into(), &format!("C{v}"))
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cache.current_version("k1"), Some("10".into()));
    }
}
