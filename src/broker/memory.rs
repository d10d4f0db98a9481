// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory broker with requeue and dead-letter routing.
//!
//! Mirrors the at-least-once semantics the relay is written against: a
//! nack-with-requeue lands the message back on the update queue flagged as
//! redelivered, a nack-without-requeue routes it to the dead-letter queue.
//! Confirms are emitted per publish on an unbounded channel.
//!
//! Tests can flip [`InMemoryBroker::set_publish_failing`] to simulate a
//! broker outage on the send path.

use super::{Acker, Broker, BrokerError, Delivery, PublishConfirm};
use crate::intent::UpdateIntent;
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

#[derive(Debug, Clone)]
struct QueuedMessage {
    intent_id: Option<String>,
    payload: Vec<u8>,
    redelivered: bool,
}

struct Queues {
    update_tx: mpsc::UnboundedSender<QueuedMessage>,
    dlq_tx: mpsc::UnboundedSender<QueuedMessage>,
    confirm_tx: mpsc::UnboundedSender<PublishConfirm>,
}

pub struct InMemoryBroker {
    queues: Arc<Queues>,
    update_rx: Mutex<mpsc::UnboundedReceiver<QueuedMessage>>,
    dlq_rx: Mutex<mpsc::UnboundedReceiver<QueuedMessage>>,
    confirm_rx: SyncMutex<Option<mpsc::UnboundedReceiver<PublishConfirm>>>,
    fail_publish: AtomicBool,
    published: AtomicU64,
    // shared with ackers, which outlive any borrow of the broker
    acked: Arc<AtomicU64>,
    dead_lettered: Arc<AtomicU64>,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (dlq_tx, dlq_rx) = mpsc::unbounded_channel();
        let (confirm_tx, confirm_rx) = mpsc::unbounded_channel();

        Self {
            queues: Arc::new(Queues {
                update_tx,
                dlq_tx,
                confirm_tx,
            }),
            update_rx: Mutex::new(update_rx),
            dlq_rx: Mutex::new(dlq_rx),
            confirm_rx: SyncMutex::new(Some(confirm_rx)),
            fail_publish: AtomicBool::new(false),
            published: AtomicU64::new(0),
            acked: Arc::new(AtomicU64::new(0)),
            dead_lettered: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Simulate a broker outage: subsequent publishes fail and emit a
    /// negative confirm.
    pub fn set_publish_failing(&self, failing: bool) {
        self.fail_publish.store(failing, Ordering::SeqCst);
    }

    /// Total successful publishes since creation.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Total acknowledged deliveries since creation.
    #[must_use]
    pub fn acked_count(&self) -> u64 {
        self.acked.load(Ordering::SeqCst)
    }

    /// Total messages routed to the dead-letter queue since creation.
    #[must_use]
    pub fn dead_lettered_count(&self) -> u64 {
        self.dead_lettered.load(Ordering::SeqCst)
    }

    fn make_delivery(&self, msg: QueuedMessage, from_dlq: bool) -> Delivery {
        let acker = MemAcker {
            queues: self.queues.clone(),
            message: Some(msg.clone()),
            from_dlq,
            acked: self.acked.clone(),
            dead_lettered: self.dead_lettered.clone(),
        };
        Delivery::new(msg.intent_id, msg.payload, msg.redelivered, Box::new(acker))
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, intent: &UpdateIntent) -> Result<(), BrokerError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            let _ = self.queues.confirm_tx.send(PublishConfirm {
                intent_id: intent.intent_id.clone(),
                ack: false,
                reason: Some("simulated broker outage".into()),
            });
            return Err(BrokerError::PublishRejected("simulated broker outage".into()));
        }

        let payload = intent
            .to_wire()
            .map_err(|e| BrokerError::Backend(e.to_string()))?;

        self.queues
            .update_tx
            .send(QueuedMessage {
                intent_id: Some(intent.intent_id.clone()),
                payload,
                redelivered: false,
            })
            .map_err(|_| BrokerError::Closed)?;

        self.published.fetch_add(1, Ordering::SeqCst);
        let _ = self.queues.confirm_tx.send(PublishConfirm {
            intent_id: intent.intent_id.clone(),
            ack: true,
            reason: None,
        });

        debug!(intent_id = %intent.intent_id, "published to in-memory update queue");
        Ok(())
    }

    async fn next_update(&self) -> Option<Delivery> {
        let msg = self.update_rx.lock().await.recv().await?;
        Some(self.make_delivery(msg, false))
    }

    async fn next_dead_letter(&self) -> Option<Delivery> {
        let msg = self.dlq_rx.lock().await.recv().await?;
        Some(self.make_delivery(msg, true))
    }

    fn take_confirms(&self) -> Option<mpsc::UnboundedReceiver<PublishConfirm>> {
        self.confirm_rx.lock().take()
    }
}

struct MemAcker {
    queues: Arc<Queues>,
    message: Option<QueuedMessage>,
    from_dlq: bool,
    acked: Arc<AtomicU64>,
    dead_lettered: Arc<AtomicU64>,
}

#[async_trait]
impl Acker for MemAcker {
    async fn ack(&mut self) -> Result<(), BrokerError> {
        if self.message.take().is_some() {
            self.acked.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn nack(&mut self, requeue: bool) -> Result<(), BrokerError> {
        let Some(mut msg) = self.message.take() else {
            return Ok(()); // already settled
        };

        if requeue {
            msg.redelivered = true;
            self.queues.update_tx.send(msg).map_err(|_| BrokerError::Closed)?;
        } else if self.from_dlq {
            // A rejected dead-letter message stays dead-lettered
            self.queues.dlq_tx.send(msg).map_err(|_| BrokerError::Closed)?;
        } else {
            self.dead_lettered.fetch_add(1, Ordering::SeqCst);
            self.queues.dlq_tx.send(msg).map_err(|_| BrokerError::Closed)?;
        }
        Ok(())
    }
}
