// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end propagation: producer → broker → consumer → cache.

use rule_relay::broker::memory::InMemoryBroker;
use rule_relay::broker::Broker;
use rule_relay::cache::{RuleCache, RuleDefinition, RuleDefinitionStore};
use rule_relay::compiler::{CompileError, CompiledRule, ExecutableUnit, RuleSession};
use rule_relay::consumer::UpdateConsumer;
use rule_relay::producer::UpdateProducer;
use rule_relay::relay::RuleRelay;
use rule_relay::shared_cache::{InMemoryContentStore, InMemoryIdempotencyStore};
use rule_relay::store::{InMemoryLogStore, MessageLogStore};
use rule_relay::{MessageStatus, RelayConfig, RelayError, RuleCompiler};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct FakeUnit;

impl CompiledRule for FakeUnit {
    fn new_session(&self) -> Box<dyn RuleSession> {
        unimplemented!("propagation tests never execute rules")
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

struct NoDefinitions;

#[async_trait]
impl RuleDefinitionStore for NoDefinitions {
    async fn find_active(&self, _: &str) -> Result<Option<RuleDefinition>, RelayError> {
        Ok(None)
    }
}

/// Fully wired memory pipeline with the consumer driven by hand, so tests
/// control delivery order and interleaving exactly.
struct Pipeline {
    broker: Arc<InMemoryBroker>,
    log: Arc<InMemoryLogStore>,
    cache: Arc<RuleCache>,
    compiler: Arc<FakeCompiler>,
    producer: UpdateProducer,
    consumer: UpdateConsumer,
}

fn pipeline() -> Pipeline {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let broker = Arc::new(InMemoryBroker::new());
    let log = Arc::new(InMemoryLogStore::new());
    let content = Arc::new(InMemoryContentStore::new());
    let idempotency = Arc::new(InMemoryIdempotencyStore::new());
    let compiler = Arc::new(FakeCompiler::new());
    let cache = Arc::new(RuleCache::new(compiler.clone(), Arc::new(NoDefinitions)));

    let producer = UpdateProducer::new(
        broker.clone(),
        log.clone(),
        content.clone(),
        RelayConfig::test(),
    );
    let consumer = UpdateConsumer::new(
        log.clone(),
        cache.clone(),
        content,
        idempotency,
        RelayConfig::test(),
    );

    Pipeline {
        broker,
        log,
        cache,
        compiler,
        producer,
        consumer,
    }
}

impl Pipeline {
    async fn consume_one(&self) {
        let delivery = self.broker.next_update().await.expect("delivery expected");
        self.consumer.handle(delivery).await;
    }
}

#[tokio::test]
async fn update_propagates_producer_to_cache() {
    let p = pipeline();

    let id = p
        .producer
        .send("pricing.discount", "2", Some("rule v2".into()))
        .await
        .unwrap();
    p.consume_one().await;

    assert_eq!(p.cache.current_version("pricing.discount"), Some("2".into()));
    let record = p.log.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status, MessageStatus::Success);
    assert_eq!(record.retry_count, 0);
    assert_eq!(p.broker.acked_count(), 1);
    assert_eq!(p.broker.dead_lettered_count(), 0);
}

#[tokio::test]
async fn out_of_order_delivery_converges_on_newest_version() {
    let p = pipeline();

    // v2 and v1 published; v2 happens to arrive first
    let id_v2 = p.producer.send("k1", "2", Some("C2".into())).await.unwrap();
    let id_v1 = p.producer.send("k1", "1", Some("C1".into())).await.unwrap();

    p.consume_one().await; // v2
    p.consume_one().await; // stale v1

    // cache holds the newest content; the stale intent is still settled
    assert_eq!(p.cache.current_version("k1"), Some("2".into()));
    assert_eq!(p.broker.acked_count(), 2);
    for id in [&id_v2, &id_v1] {
        let record = p.log.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Success);
    }
}

#[tokio::test]
async fn redelivery_after_success_does_not_recompile() {
    use rule_relay::UpdateIntent;

    let p = pipeline();

    let intent = UpdateIntent::new("k1", "3", Some("C3".into()));
    p.broker.publish(&intent).await.unwrap();
    p.consume_one().await;
    let compiles = p.compiler.compiles.load(Ordering::SeqCst);

    // byte-identical redelivery of the settled message
    p.broker.publish(&intent).await.unwrap();
    p.consume_one().await;

    assert_eq!(p.compiler.compiles.load(Ordering::SeqCst), compiles);
    assert_eq!(p.cache.current_version("k1"), Some("3".into()));
    assert_eq!(p.broker.acked_count(), 2);
}

#[tokio::test]
async fn content_less_redelivery_resolves_from_shared_store() {
    let p = pipeline();

    // original publish stashes the content
    let id = p.producer.send("k1", "4", Some("C4".into())).await.unwrap();

    // drop the first delivery unprocessed (simulated consumer crash),
    // then a content-less republish arrives
    let lost = p.broker.next_update().await.unwrap();
    drop(lost);
    p.producer.resend(&id).await.unwrap();
    p.consume_one().await;

    assert_eq!(p.cache.current_version("k1"), Some("4".into()));
    let record = p.log.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status, MessageStatus::Success);
}

#[tokio::test]
async fn same_version_content_fix_reinstalls() {
    let p = pipeline();

    p.producer.send("k1", "1", Some("C1".into())).await.unwrap();
    p.consume_one().await;

    // same version, corrected content: a distinct intent, fresh id
    p.producer.send("k1", "1", Some("C1-fixed".into())).await.unwrap();
    p.consume_one().await;

    assert_eq!(p.cache.current_version("k1"), Some("1".into()));
    // both intents settled, second one actually recompiled
    assert_eq!(p.broker.acked_count(), 2);
    assert_eq!(p.compiler.compiles.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn keys_propagate_independently() {
    let p = pipeline();

    p.producer.send("alpha", "1", Some("A1".into())).await.unwrap();
    p.producer.send("beta", "9", Some("B9".into())).await.unwrap();
    p.consume_one().await;
    p.consume_one().await;

    assert_eq!(p.cache.current_version("alpha"), Some("1".into()));
    assert_eq!(p.cache.current_version("beta"), Some("9".into()));
    let mut keys = p.cache.loaded_keys();
    keys.sort();
    assert_eq!(keys, vec!["alpha", "beta"]);
}

#[tokio::test]
async fn started_relay_converges_with_concurrent_workers() {
    // keep the sweeper off fresh rows; this test is about the consume path
    let config = RelayConfig {
        publish_grace_secs: 60,
        ..RelayConfig::test()
    };
    let relay = RuleRelay::builder(config)
        .broker(Arc::new(InMemoryBroker::new()))
        .compiler(Arc::new(FakeCompiler::new()))
        .definitions(Arc::new(NoDefinitions))
        .build()
        .await
        .unwrap();
    relay.start().unwrap();

    // a burst of versions for one key, in order of publish but racing
    // across workers on the consume side
    for v in 1..=10u32 {
        relay
            .producer()
            .send("k1", v.to_string().as_str(), Some(format!("C{v}")))
            .await
            .unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if relay.cache().current_version("k1") == Some("10".into()) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "cache never reached version 10 (at {:?})",
            relay.cache().current_version("k1")
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    relay.shutdown().await;
    assert_eq!(relay.cache().current_version("k1"), Some("10".into()));
}
