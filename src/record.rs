// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message log record and its status state machine.
//!
//! One row per intent, keyed by intent id. The row is created PENDING by the
//! producer before publish, moved forward by the consumer, and retried or
//! finalized by the sweeper. Rows are never deleted here — retention is an
//! external concern.
//!
//! Writer discipline (who mutates what):
//! - producer: row creation, send-side retry info
//! - consumer: `Processing` / `Success`, terminal `Failed` on non-retryable
//! - sweeper:  `retry_count`, `next_retry_at`, terminal `Failed` on exhaustion

use crate::intent::{now_millis, RuleVersion, UpdateIntent};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery/processing status of an update intent.
///
/// Transitions are forward-only:
/// `Pending → Processing → Success`, or `Pending | Processing → Failed`.
/// `Success` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl MessageStatus {
    /// Whether a transition from `self` to `next` is legal.
    #[must_use]
    pub fn can_transition(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        match (self, next) {
            (Pending, Processing) | (Pending, Success) | (Pending, Failed) => true,
            (Processing, Success) | (Processing, Failed) => true,
            // re-asserting the current state is harmless
            (a, b) if a == b => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Success | MessageStatus::Failed)
    }

    /// Integer code for SQL storage (0..=3, stable).
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Processing => 1,
            MessageStatus::Success => 2,
            MessageStatus::Failed => 3,
        }
    }

    /// Decode a SQL status code.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(MessageStatus::Pending),
            1 => Some(MessageStatus::Processing),
            2 => Some(MessageStatus::Success),
            3 => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::Processing => "PROCESSING",
            MessageStatus::Success => "SUCCESS",
            MessageStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Durable record of one intent's delivery/processing lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLogRecord {
    pub intent_id: String,
    pub rule_key: String,
    pub rule_version: RuleVersion,
    pub status: MessageStatus,
    /// Number of sweep-driven redeliveries so far. Only ever increases.
    pub retry_count: u32,
    /// Earliest time (epoch millis) the sweeper may touch this row.
    pub next_retry_at: i64,
    /// Last error observed, kept for diagnosis on terminal FAILED rows.
    pub error_msg: Option<String>,
    /// Creation timestamp (epoch millis)
    pub created_at: i64,
    /// Last mutation timestamp (epoch millis)
    pub updated_at: i64,
}

impl MessageLogRecord {
    /// Build the initial PENDING row for a freshly validated intent.
    pub fn pending(intent: &UpdateIntent, grace: std::time::Duration) -> Self {
        let now = now_millis();
        Self {
            intent_id: intent.intent_id.clone(),
            rule_key: intent.rule_key.clone(),
            rule_version: intent.rule_version.clone(),
            status: MessageStatus::Pending,
            retry_count: 0,
            next_retry_at: now + grace.as_millis() as i64,
            error_msg: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reconstruct a content-less intent for republishing. The consumer
    /// re-resolves the content from the shared store.
    #[must_use]
    pub fn to_intent(&self) -> UpdateIntent {
        UpdateIntent {
            intent_id: self.intent_id.clone(),
            rule_key: self.rule_key.clone(),
            rule_version: self.rule_version.clone(),
            rule_content: None,
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_forward_transitions_allowed() {
        use MessageStatus::*;
        assert!(Pending.can_transition(Processing));
        assert!(Pending.can_transition(Success));
        assert!(Pending.can_transition(Failed));
        assert!(Processing.can_transition(Success));
        assert!(Processing.can_transition(Failed));
    }

    #[test]
    fn test_backward_and_terminal_transitions_rejected() {
        use MessageStatus::*;
        assert!(!Processing.can_transition(Pending));
        assert!(!Success.can_transition(Pending));
        assert!(!Success.can_transition(Failed));
        assert!(!Failed.can_transition(Success));
        assert!(!Failed.can_transition(Processing));
    }

    #[test]
    fn test_self_transition_is_noop() {
        use MessageStatus::*;
        for s in [Pending, Processing, Success, Failed] {
            assert!(s.can_transition(s));
        }
    }

    #[test]
    fn test_code_roundtrip() {
        use MessageStatus::*;
        for s in [Pending, Processing, Success, Failed] {
            assert_eq!(MessageStatus::from_code(s.code()), Some(s));
        }
        assert_eq!(MessageStatus::from_code(42), None);
    }

    #[test]
    fn test_pending_row_from_intent() {
        let intent = UpdateIntent::new("k1", "2", Some("content".into()));
        let record = MessageLogRecord::pending(&intent, Duration::from_secs(60));

        assert_eq!(record.intent_id, intent.intent_id);
        assert_eq!(record.status, MessageStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert!(record.next_retry_at >= record.created_at + 60_000);
        assert!(record.error_msg.is_none());
    }

    #[test]
    fn test_republished_intent_drops_content() {
        let intent = UpdateIntent::new("k1", "2", Some("content".into()));
        let record = MessageLogRecord::pending(&intent, Duration::ZERO);

        let rebuilt = record.to_intent();
        assert_eq!(rebuilt.intent_id, intent.intent_id);
        assert_eq!(rebuilt.rule_key, "k1");
        assert!(rebuilt.rule_content.is_none());
    }
}
