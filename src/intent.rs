//! Update intent data structure and rule version ordering.
//!
//! The [`UpdateIntent`] is the unit that flows from the producer through the
//! broker to every consumer. It is immutable once published; redeliveries
//! carry byte-identical payloads.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A rule version string with a numeric-aware total order.
///
/// The order is segment-wise on `.`-separated parts: when both segments
/// parse as `u64` they compare numerically, otherwise lexicographically;
/// on an equal prefix the longer version wins. So `"2" > "1"`,
/// `"1.10" > "1.9"` and `"2024-02" > "2024-01"` all hold, which is what the
/// cache's never-regress check relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleVersion(pub String);

impl RuleVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for RuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RuleVersion {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RuleVersion {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Ord for RuleVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let mut left = self.0.split('.');
        let mut right = other.0.split('.');

        loop {
            match (left.next(), right.next()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(a), Some(b)) => {
                    let ord = match (a.parse::<u64>(), b.parse::<u64>()) {
                        (Ok(na), Ok(nb)) => na.cmp(&nb),
                        _ => a.cmp(b),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
            }
        }
    }
}

impl PartialOrd for RuleVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A request to install a specific rule version under a rule key.
///
/// `rule_content` is optional on the wire: absence means "fetch from the
/// shared content store by key+version" — this is how the retry sweeper
/// republishes without re-embedding the source text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateIntent {
    /// Globally unique, producer-generated id. Doubles as the broker
    /// correlation id and the idempotency dedup key.
    #[serde(skip)]
    pub intent_id: String,

    #[serde(rename = "ruleKey")]
    pub rule_key: String,

    #[serde(rename = "ruleVersion")]
    pub rule_version: RuleVersion,

    #[serde(rename = "ruleContent")]
    pub rule_content: Option<String>,

    /// Creation timestamp (epoch millis); not part of the wire payload.
    #[serde(skip, default = "now_millis")]
    pub created_at: i64,
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl UpdateIntent {
    /// Create a new intent with a fresh id.
    pub fn new(
        rule_key: impl Into<String>,
        rule_version: impl Into<RuleVersion>,
        rule_content: Option<String>,
    ) -> Self {
        Self {
            intent_id: uuid::Uuid::new_v4().to_string(),
            rule_key: rule_key.into(),
            rule_version: rule_version.into(),
            rule_content,
            created_at: now_millis(),
        }
    }

    /// Serialize the wire payload (JSON, without the id — the id travels as
    /// broker message metadata).
    pub fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a wire payload, reattaching the intent id from the broker
    /// message metadata.
    pub fn from_wire(intent_id: &str, payload: &[u8]) -> Result<Self, serde_json::Error> {
        let mut intent: UpdateIntent = serde_json::from_slice(payload)?;
        intent.intent_id = intent_id.to_string();
        Ok(intent)
    }
}
