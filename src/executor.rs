//! Request-side rule execution against the live cache.
//!
//! Executors are the readers of the [`RuleCache`]: they grab the active
//! unit for a key (lazily compiling on first use), open a short-lived
//! session, run a fact through it, and report how many rules fired. An
//! in-flight session keeps its unit alive even if a hot swap replaces the
//! cache entry mid-execution — readers always see a complete unit.

use crate::cache::RuleCache;
use crate::error::RelayError;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Result of running one fact through a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub rule_key: String,
    /// Number of rules that fired in the session.
    pub fired: usize,
}

pub struct RuleExecutor {
    cache: Arc<RuleCache>,
}

impl RuleExecutor {
    pub fn new(cache: Arc<RuleCache>) -> Self {
        Self { cache }
    }

    /// Execute the active rule for `rule_key` against a single fact.
    ///
    /// An unknown or disabled rule surfaces as [`RelayError::Validation`];
    /// a session failure means the fact and the rule do not fit together,
    /// which redelivery cannot fix, so it is classified the same way.
    pub async fn execute(&self, rule_key: &str, fact: Value) -> Result<ExecutionOutcome, RelayError> {
        let _timer = crate::metrics::LatencyTimer::new("execute");
        let unit = self.cache.get_or_load(rule_key).await?;

        let mut session = unit.new_session();
        session
            .insert(fact)
            .map_err(|e| self.execution_failed(rule_key, &e.to_string()))?;
        let fired = session
            .fire_all()
            .map_err(|e| self.execution_failed(rule_key, &e.to_string()))?;

        debug!(rule_key, fired, "rule execution complete");
        crate::metrics::record_execution("success", fired);

        Ok(ExecutionOutcome {
            rule_key: rule_key.to_string(),
            fired,
        })
    }

    /// Execute one session with several facts inserted before firing.
    pub async fn execute_batch(
        &self,
        rule_key: &str,
        facts: Vec<Value>,
    ) -> Result<ExecutionOutcome, RelayError> {
        let _timer = crate::metrics::LatencyTimer::new("execute");
        let unit = self.cache.get_or_load(rule_key).await?;

        let mut session = unit.new_session();
        for fact in facts {
            session
                .insert(fact)
                .map_err(|e| self.execution_failed(rule_key, &e.to_string()))?;
        }
        let fired = session
            .fire_all()
            .map_err(|e| self.execution_failed(rule_key, &e.to_string()))?;

        crate::metrics::record_execution("success", fired);
        Ok(ExecutionOutcome {
            rule_key: rule_key.to_string(),
            fired,
        })
    }

    fn execution_failed(&self, rule_key: &str, details: &str) -> RelayError {
        crate::metrics::record_execution("error", 0);
        crate::metrics::record_error("execute", "validation");
        RelayError::Validation(format!("rule execution failed for {rule_key}: {details}"))
    }
}
