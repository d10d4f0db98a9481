//! Broker collaborator boundary.
//!
//! The relay treats the broker as a reliable-but-at-least-once delivery
//! collaborator: publish with asynchronous confirms, consume with
//! ack/nack-with-requeue, and a configured dead-letter route for messages
//! nacked without requeue. The traits here are that boundary; the
//! [`memory`] implementation backs tests and single-process deployments.

pub mod memory;

use crate::intent::UpdateIntent;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("publish rejected: {0}")]
    PublishRejected(String),
    #[error("broker connection closed")]
    Closed,
    #[error("broker backend error: {0}")]
    Backend(String),
}

/// Asynchronous publish confirmation, correlated by intent id.
///
/// Confirms drive observability only: a missing or negative confirm does not
/// fail the send path, because correctness is owned by the retry sweeper,
/// which is delivery-agnostic.
#[derive(Debug, Clone)]
pub struct PublishConfirm {
    pub intent_id: String,
    pub ack: bool,
    pub reason: Option<String>,
}

/// Acknowledgement half of a delivery. One of `ack`/`nack` is called at
/// most once; an unacknowledged delivery is redelivered by the broker when
/// its lease expires.
#[async_trait]
pub trait Acker: Send {
    async fn ack(&mut self) -> Result<(), BrokerError>;
    async fn nack(&mut self, requeue: bool) -> Result<(), BrokerError>;
}

/// One delivered message from the update (or dead-letter) queue.
pub struct Delivery {
    /// Correlation/message id as carried in broker metadata. Absence is a
    /// malformed message, rejected without requeue by the consumer.
    pub intent_id: Option<String>,
    /// Raw wire payload bytes.
    pub payload: Vec<u8>,
    /// Whether the broker flagged this as a redelivery.
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        intent_id: Option<String>,
        payload: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            intent_id,
            payload,
            redelivered,
            acker,
        }
    }

    /// Acknowledge successful processing.
    pub async fn ack(mut self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Reject the delivery. With `requeue` the broker redelivers it; without,
    /// it travels the dead-letter route.
    pub async fn nack(mut self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("intent_id", &self.intent_id)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// The broker collaborator.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish an intent to the update queue, tagged with its intent id as
    /// both correlation id and message id. Returns once the broker accepted
    /// the message for delivery; the confirm arrives asynchronously.
    async fn publish(&self, intent: &UpdateIntent) -> Result<(), BrokerError>;

    /// Next delivery from the update queue. Returns `None` when the broker
    /// is shut down. Safe to call from multiple workers concurrently.
    async fn next_update(&self) -> Option<Delivery>;

    /// Next delivery from the dead-letter queue.
    async fn next_dead_letter(&self) -> Option<Delivery>;

    /// Take the publish-confirm stream. Yields `Some` exactly once; the
    /// producer owns the stream for the life of the process.
    fn take_confirms(&self) -> Option<mpsc::UnboundedReceiver<PublishConfirm>>;
}
