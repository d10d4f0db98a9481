// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the relay.
//!
//! Every failure on the propagation path is classified into one of four
//! kinds, and callers branch on the kind rather than on exception types:
//!
//! - [`RelayError::Validation`] — malformed or missing required fields;
//!   never retried, routed straight to the dead-letter path.
//! - [`RelayError::Compile`] — the rule source itself is bad; never retried.
//! - [`RelayError::Transient`] — store/broker/network unavailability; the
//!   record stays PENDING and the retry sweeper picks it up.
//! - [`RelayError::Exhausted`] — the retry ceiling was reached; raised by
//!   the sweeper (or the producer's synchronous retry path), never by the
//!   consumer.

use crate::store::LogStoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rule compilation failed: {0}")]
    Compile(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("retry ceiling reached after {attempts} attempts: {reason}")]
    Exhausted { attempts: u32, reason: String },
}

impl RelayError {
    /// Whether the retry sweeper should get another shot at this intent.
    ///
    /// Validation and compile errors are classified at first sight: the
    /// payload or the content is the problem, and redelivery cannot fix it.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::Transient(_))
    }

    /// Short kind tag for metrics labels and log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Validation(_) => "validation",
            RelayError::Compile(_) => "compile",
            RelayError::Transient(_) => "transient",
            RelayError::Exhausted { .. } => "exhausted",
        }
    }
}

impl From<LogStoreError> for RelayError {
    fn from(err: LogStoreError) -> Self {
        match err {
            LogStoreError::NotFound(id) => RelayError::Validation(format!("unknown intent: {id}")),
            other => RelayError::Transient(other.to_string()),
        }
    }
}

/// Truncate an error message for persistence on a log record. Persisted
/// errors are diagnostic hints, not transcripts.
pub(crate) fn truncate_msg(msg: &str, max_len: usize) -> String {
    if msg.len() <= max_len {
        return msg.to_string();
    }
    let mut end = max_len;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    msg[..end].to_string()
}
