//! # Rule Relay
//!
//! Reliable update propagation and hot-reload caching for live rule engines.
//!
//! A control plane publishes *update intents* (install rule version V under
//! rule key K); worker processes hold compiled rules in memory and must all
//! converge on the latest version for each key, exactly-once in effect, on
//! top of an at-least-once broker.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       UpdateProducer                         │
//! │  • Validates intent, writes PENDING log row                  │
//! │  • Publishes tagged with intent id (confirm is async-only)   │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                      (broker, at-least-once)
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       UpdateConsumer                         │
//! │  • Idempotency marker fast path, SUCCESS-row slow path       │
//! │  • Resolves content, asks RuleCache to hot-swap              │
//! │  • Classifies failures: Validation/Compile → dead-letter,    │
//! │    Transient → leave PENDING for the sweeper                 │
//! └──────────────────────────────────────────────────────────────┘
//!                │                              │
//!                ▼                              ▼
//! ┌───────────────────────────┐  ┌─────────────────────────────┐
//! │        RuleCache          │  │        RetrySweeper         │
//! │  • Per-key compile lock   │  │  • PENDING rows past due    │
//! │  • Version-monotonic swap │  │  • Backoff + republish, or  │
//! │  • Lazy compile-on-miss   │  │    escalate to dead-letter  │
//! └───────────────────────────┘  └─────────────────────────────┘
//!                                               │
//!                                               ▼
//!                               ┌─────────────────────────────┐
//!                               │      DeadLetterHandler      │
//!                               │  • Durable sink, then alert │
//!                               │  • Unacked if all paths fail│
//!                               └─────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Monotonic per key**: the cache never regresses to an older rule
//!   version, so out-of-order and duplicate deliveries are harmless.
//! - **At-most-once application**: redelivery after SUCCESS is a no-op via
//!   the idempotency marker, the SUCCESS row, and finally the cache's own
//!   version check.
//! - **No silent loss**: an intent that exhausts its retries is persisted or
//!   alerted by the dead-letter handler before it is ever acknowledged.
//!
//! ## Modules
//!
//! - [`relay`]: the [`RuleRelay`] coordinator wiring everything together
//! - [`producer`] / [`consumer`]: the durable publish and idempotent apply ends
//! - [`cache`]: concurrent rule cache with version-monotonic hot swap
//! - [`scheduler`]: periodic retry sweep over the message log
//! - [`dead_letter`]: terminal routing for unprocessable intents
//! - [`store`]: message log persistence (memory, SQL)
//! - [`shared_cache`]: rule content and idempotency marker stores (memory, Redis)
//! - [`broker`]: broker collaborator traits and an in-memory implementation
//! - [`compiler`]: compiler / execution-session collaborator traits

pub mod config;
pub mod error;
pub mod intent;
pub mod record;
pub mod backoff;
pub mod store;
pub mod broker;
pub mod compiler;
pub mod cache;
pub mod shared_cache;
pub mod producer;
pub mod consumer;
pub mod scheduler;
pub mod dead_letter;
pub mod executor;
pub mod relay;
pub mod metrics;

pub use config::RelayConfig;
pub use error::RelayError;
pub use intent::{UpdateIntent, RuleVersion};
pub use record::{MessageLogRecord, MessageStatus};
pub use backoff::BackoffConfig;
pub use store::traits::{MessageLogStore, LogStoreError};
pub use broker::{Broker, BrokerError, Delivery, PublishConfirm};
pub use compiler::{RuleCompiler, ExecutableUnit, RuleSession, CompileError};
pub use cache::{RuleCache, RuleDefinition, RuleDefinitionStore};
pub use shared_cache::{RuleContentStore, IdempotencyStore};
pub use producer::UpdateProducer;
pub use consumer::UpdateConsumer;
pub use scheduler::RetrySweeper;
pub use dead_letter::{DeadLetterHandler, DeadLetterSink, Alerter};
pub use executor::{RuleExecutor, ExecutionOutcome};
pub use relay::{RuleRelay, RelayState};
