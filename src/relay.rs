// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relay lifecycle: wiring, startup, shutdown.
//!
//! [`RuleRelay`] owns the background tasks (consumer workers, retry
//! sweeper, dead-letter handler, confirm listener) and the shared
//! components they run against. Construction is split from startup: the
//! builder wires collaborators and backends, `start` spawns the tasks,
//! `shutdown` signals them and waits for them to drain.
//!
//! Backend selection follows the config: a `sql_url` puts the message log
//! (and the dead-letter table) in SQL, a `redis_url` puts the shared
//! content/idempotency caches in Redis, and anything unset falls back to
//! in-process memory — fine for tests and single-process deployments.

use crate::broker::Broker;
use crate::cache::{RuleCache, RuleDefinitionStore};
use crate::compiler::RuleCompiler;
use crate::config::RelayConfig;
use crate::consumer::UpdateConsumer;
use crate::dead_letter::{
    Alerter, DeadLetterHandler, DeadLetterSink, InMemoryDeadLetterSink, LogAlerter,
    SqlDeadLetterSink,
};
use crate::error::RelayError;
use crate::executor::RuleExecutor;
use crate::producer::{spawn_confirm_listener, UpdateProducer};
use crate::scheduler::RetrySweeper;
use crate::shared_cache::{
    IdempotencyStore, InMemoryContentStore, InMemoryIdempotencyStore, RedisSharedCache,
    RuleContentStore,
};
use crate::store::{InMemoryLogStore, MessageLogStore, SqlLogStore};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Lifecycle state, observable through [`RuleRelay::subscribe_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Created,
    Running,
    ShuttingDown,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelayState::Created => "Created",
            RelayState::Running => "Running",
            RelayState::ShuttingDown => "ShuttingDown",
        };
        f.write_str(s)
    }
}

pub struct RuleRelayBuilder {
    config: RelayConfig,
    broker: Option<Arc<dyn Broker>>,
    compiler: Option<Arc<dyn RuleCompiler>>,
    definitions: Option<Arc<dyn RuleDefinitionStore>>,
    log: Option<Arc<dyn MessageLogStore>>,
    content: Option<Arc<dyn RuleContentStore>>,
    idempotency: Option<Arc<dyn IdempotencyStore>>,
    sink: Option<Arc<dyn DeadLetterSink>>,
    alerter: Option<Arc<dyn Alerter>>,
}

impl RuleRelayBuilder {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            broker: None,
            compiler: None,
            definitions: None,
            log: None,
            content: None,
            idempotency: None,
            sink: None,
            alerter: None,
        }
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn compiler(mut self, compiler: Arc<dyn RuleCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn definitions(mut self, definitions: Arc<dyn RuleDefinitionStore>) -> Self {
        self.definitions = Some(definitions);
        self
    }

    /// Override the message log backend (otherwise chosen from `sql_url`).
    pub fn log_store(mut self, log: Arc<dyn MessageLogStore>) -> Self {
        self.log = Some(log);
        self
    }

    /// Override the shared content store (otherwise chosen from `redis_url`).
    pub fn content_store(mut self, content: Arc<dyn RuleContentStore>) -> Self {
        self.content = Some(content);
        self
    }

    /// Override the idempotency store (otherwise chosen from `redis_url`).
    pub fn idempotency_store(mut self, idempotency: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency = Some(idempotency);
        self
    }

    pub fn dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = Some(alerter);
        self
    }

    /// Wire everything up. The broker, compiler and definition store have no
    /// defaults — they are the integration points the host must provide.
    pub async fn build(self) -> Result<RuleRelay, RelayError> {
        let broker = self
            .broker
            .ok_or_else(|| RelayError::Validation("relay requires a broker".into()))?;
        let compiler = self
            .compiler
            .ok_or_else(|| RelayError::Validation("relay requires a rule compiler".into()))?;
        let definitions = self
            .definitions
            .ok_or_else(|| RelayError::Validation("relay requires a rule definition store".into()))?;

        let config = self.config;

        let (log, sql_pool) = match self.log {
            Some(log) => (log, None),
            None => match &config.sql_url {
                Some(url) => {
                    let store = SqlLogStore::new(url).await?;
                    let pool = store.pool();
                    info!(url = %url, "message log backed by SQL");
                    (Arc::new(store) as Arc<dyn MessageLogStore>, Some(pool))
                }
                None => (
                    Arc::new(InMemoryLogStore::new()) as Arc<dyn MessageLogStore>,
                    None,
                ),
            },
        };

        let (content, idempotency) = match (self.content, self.idempotency) {
            (Some(content), Some(idempotency)) => (content, idempotency),
            (content, idempotency) => match &config.redis_url {
                Some(url) => {
                    let shared = Arc::new(RedisSharedCache::new(url).await?);
                    info!(url = %url, "shared caches backed by Redis");
                    (
                        content.unwrap_or_else(|| shared.clone() as Arc<dyn RuleContentStore>),
                        idempotency.unwrap_or_else(|| shared as Arc<dyn IdempotencyStore>),
                    )
                }
                None => (
                    content.unwrap_or_else(|| Arc::new(InMemoryContentStore::new())),
                    idempotency.unwrap_or_else(|| Arc::new(InMemoryIdempotencyStore::new())),
                ),
            },
        };

        let sink: Arc<dyn DeadLetterSink> = match self.sink {
            Some(sink) => sink,
            None => match sql_pool {
                Some(pool) => {
                    let is_sqlite = config
                        .sql_url
                        .as_deref()
                        .is_some_and(|u| u.starts_with("sqlite:"));
                    Arc::new(SqlDeadLetterSink::new(pool, is_sqlite).await?)
                }
                None => Arc::new(InMemoryDeadLetterSink::new()),
            },
        };
        let alerter = self.alerter.unwrap_or_else(|| Arc::new(LogAlerter));

        let cache = Arc::new(RuleCache::new(compiler, definitions));
        let producer = Arc::new(UpdateProducer::new(
            broker.clone(),
            log.clone(),
            content.clone(),
            config.clone(),
        ));
        let consumer = Arc::new(UpdateConsumer::new(
            log.clone(),
            cache.clone(),
            content,
            idempotency,
            config.clone(),
        ));
        let dead_letter = Arc::new(DeadLetterHandler::new(sink, alerter, log.clone()));
        let sweeper = Arc::new(RetrySweeper::new(
            log,
            broker.clone(),
            dead_letter.clone(),
            config.clone(),
        ));
        let executor = Arc::new(RuleExecutor::new(cache.clone()));

        let (state_tx, _) = watch::channel(RelayState::Created);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(RuleRelay {
            config,
            broker,
            cache,
            producer,
            consumer,
            dead_letter,
            sweeper,
            executor,
            state_tx,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

pub struct RuleRelay {
    config: RelayConfig,
    broker: Arc<dyn Broker>,
    cache: Arc<RuleCache>,
    producer: Arc<UpdateProducer>,
    consumer: Arc<UpdateConsumer>,
    dead_letter: Arc<DeadLetterHandler>,
    sweeper: Arc<RetrySweeper>,
    executor: Arc<RuleExecutor>,
    state_tx: watch::Sender<RelayState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RuleRelay {
    pub fn builder(config: RelayConfig) -> RuleRelayBuilder {
        RuleRelayBuilder::new(config)
    }

    /// Spawn the background tasks. Idempotent only in the sense that a
    /// second call is rejected.
    pub fn start(&self) -> Result<(), RelayError> {
        if *self.state_tx.borrow() != RelayState::Created {
            return Err(RelayError::Validation(format!(
                "relay already started (state: {})",
                *self.state_tx.borrow()
            )));
        }

        let mut tasks = self.tasks.lock();

        for worker in 0..self.config.consumer_workers.max(1) {
            let consumer = self.consumer.clone();
            let broker = self.broker.clone();
            let shutdown = self.shutdown_tx.subscribe();
            info!(worker, "starting consumer worker");
            tasks.push(tokio::spawn(consumer.run(broker, shutdown)));
        }

        tasks.push(tokio::spawn(
            self.sweeper.clone().run(self.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            self.dead_letter
                .clone()
                .run(self.broker.clone(), self.shutdown_tx.subscribe()),
        ));

        if let Some(confirms) = self.broker.take_confirms() {
            tasks.push(spawn_confirm_listener(confirms, self.shutdown_tx.subscribe()));
        }

        self.set_state(RelayState::Running);
        info!(workers = self.config.consumer_workers, "rule relay running");
        Ok(())
    }

    /// Signal every task and wait for them to finish. In-flight deliveries
    /// settle before their worker exits; unsettled ones come back on the
    /// next start.
    pub async fn shutdown(&self) {
        self.set_state(RelayState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "relay task ended abnormally");
            }
        }
        info!("rule relay stopped");
    }

    pub fn producer(&self) -> Arc<UpdateProducer> {
        self.producer.clone()
    }

    pub fn executor(&self) -> Arc<RuleExecutor> {
        self.executor.clone()
    }

    pub fn cache(&self) -> Arc<RuleCache> {
        self.cache.clone()
    }

    #[must_use]
    pub fn state(&self) -> RelayState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<RelayState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: RelayState) {
        crate::metrics::set_relay_state(&state.to_string());
        let _ = self.state_tx.send(state);
    }
}
