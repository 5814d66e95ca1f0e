// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Round-robin pools of publish handles, built lazily per topic.
//!
//! Publishing on the bus is comparatively expensive and contended inside the
//! client, so each topic gets `concurrency` independent handles and callers are
//! spread across them in turn.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex as TokioMutex, OnceCell};
use tracing::{debug, error};

use crate::bus::{BusConnector, MessageBus, PublishHandle};
use crate::errors::BusError;

/// Fixed, ordered set of handles for one topic plus a cursor in `[0, len)`.
pub struct PublisherPool {
    topic: String,
    handles: Vec<Arc<dyn PublishHandle>>,
    cursor: AtomicUsize,
}

impl PublisherPool {
    pub fn new(topic: &str, handles: Vec<Arc<dyn PublishHandle>>) -> Result<Self, BusError> {
        if handles.is_empty() {
            return Err(BusError::NoHandles(topic.to_string()));
        }
        Ok(Self {
            topic: topic.to_string(),
            handles,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Ensures the topic exists, then requests `concurrency` handles for it.
    pub async fn create(
        bus: &dyn MessageBus,
        topic: &str,
        concurrency: usize,
    ) -> Result<Self, BusError> {
        bus.maybe_create_topic(topic).await?;
        Self::new(topic, bus.publish_handles(topic, concurrency))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Returns the handle under the cursor and advances the cursor by one.
    pub fn checkout(&self) -> Arc<dyn PublishHandle> {
        let len = self.handles.len();
        let index = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some((current + 1) % len)
            })
            .unwrap_or_else(|current| current);
        Arc::clone(&self.handles[index])
    }
}

type PoolEntry = Result<Arc<PublisherPool>, BusError>;

/// Every [`PublisherPool`] for one (bus identity, concurrency) configuration.
///
/// The first checkout for a topic creates its pool inside that topic's
/// `OnceCell`, so a slow creation only holds up callers of the same topic.
/// Later checkouts only take the read lock. A failed creation is stored and
/// returned to every later caller without contacting the bus again.
pub struct PublisherPoolFactory {
    identity: String,
    concurrency: usize,
    bus: Result<Arc<dyn MessageBus>, BusError>,
    pools: RwLock<HashMap<String, Arc<OnceCell<PoolEntry>>>>,
}

impl PublisherPoolFactory {
    #[must_use]
    pub fn new(
        identity: &str,
        concurrency: usize,
        bus: Result<Arc<dyn MessageBus>, BusError>,
    ) -> Self {
        Self {
            identity: identity.to_string(),
            concurrency: concurrency.max(1),
            bus,
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn bus(&self) -> Result<Arc<dyn MessageBus>, BusError> {
        self.bus.clone()
    }

    pub async fn checkout(&self, topic: &str) -> Result<Arc<dyn PublishHandle>, BusError> {
        self.pool(topic).await.map(|pool| pool.checkout())
    }

    pub async fn pool(&self, topic: &str) -> PoolEntry {
        self.cell(topic)
            .get_or_init(|| self.create(topic))
            .await
            .clone()
    }

    async fn create(&self, topic: &str) -> PoolEntry {
        let entry = match &self.bus {
            Ok(bus) => PublisherPool::create(bus.as_ref(), topic, self.concurrency)
                .await
                .map(Arc::new),
            Err(e) => Err(e.clone()),
        };
        match &entry {
            Ok(pool) => debug!(
                "Initialized publisher pool for topic {} with {} handles",
                topic,
                pool.len()
            ),
            Err(e) => error!("Publisher pool for topic {topic} is unavailable: {e}"),
        }
        entry
    }

    fn cell(&self, topic: &str) -> Arc<OnceCell<PoolEntry>> {
        {
            #[allow(clippy::expect_used)]
            let pools = self.pools.read().expect("lock poisoned");
            if let Some(cell) = pools.get(topic) {
                return Arc::clone(cell);
            }
        }

        #[allow(clippy::expect_used)]
        let mut pools = self.pools.write().expect("lock poisoned");
        Arc::clone(pools.entry(topic.to_string()).or_default())
    }
}

/// Owned registry handing out one shared [`PublisherPoolFactory`] per
/// (bus identity, concurrency) pair.
pub struct PoolRegistry {
    connector: Arc<dyn BusConnector>,
    factories: RwLock<HashMap<(String, usize), Arc<PublisherPoolFactory>>>,
    init_lock: TokioMutex<()>,
}

impl PoolRegistry {
    #[must_use]
    pub fn new(connector: Arc<dyn BusConnector>) -> Self {
        Self {
            connector,
            factories: RwLock::new(HashMap::new()),
            init_lock: TokioMutex::new(()),
        }
    }

    /// Connects to the bus on first use of a configuration. A failed
    /// connection still yields a factory, which replays the failure.
    pub async fn factory(&self, identity: &str, concurrency: usize) -> Arc<PublisherPoolFactory> {
        let key = (identity.to_string(), concurrency);
        if let Some(factory) = self.lookup(&key) {
            return factory;
        }

        let _init = self.init_lock.lock().await;
        if let Some(factory) = self.lookup(&key) {
            return factory;
        }

        let bus = self.connector.connect(identity).await;
        if let Err(e) = &bus {
            error!("Failed to connect to message bus: {e}");
        }
        let factory = Arc::new(PublisherPoolFactory::new(identity, concurrency, bus));

        #[allow(clippy::expect_used)]
        let mut factories = self.factories.write().expect("lock poisoned");
        factories.insert(key, Arc::clone(&factory));
        factory
    }

    fn lookup(&self, key: &(String, usize)) -> Option<Arc<PublisherPoolFactory>> {
        #[allow(clippy::expect_used)]
        let factories = self.factories.read().expect("lock poisoned");
        factories.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batching_writer::tests::RecordingHandle;
    use crate::bus::{PayloadHandler, Subscription};
    use crate::memory::{MemoryBus, MemoryConnector};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tracing_test::traced_test;

    /// Holds creation of one topic until `release` is notified.
    struct GatedBus {
        inner: MemoryBus,
        gated_topic: &'static str,
        release: Notify,
    }

    #[async_trait]
    impl MessageBus for GatedBus {
        fn identity(&self) -> &str {
            self.inner.identity()
        }

        async fn maybe_create_topic(&self, topic: &str) -> Result<(), BusError> {
            if topic == self.gated_topic {
                self.release.notified().await;
            }
            self.inner.maybe_create_topic(topic).await
        }

        fn publish_handles(&self, topic: &str, n: usize) -> Vec<Arc<dyn PublishHandle>> {
            self.inner.publish_handles(topic, n)
        }

        async fn subscribe(
            &self,
            topic: &str,
            handler: PayloadHandler,
        ) -> Result<Subscription, BusError> {
            self.inner.subscribe(topic, handler).await
        }
    }

    fn recording_pool(n: usize) -> (Vec<Arc<RecordingHandle>>, PublisherPool) {
        let recorders: Vec<Arc<RecordingHandle>> =
            (0..n).map(|_| Arc::new(RecordingHandle::default())).collect();
        let handles = recorders
            .iter()
            .map(|r| Arc::clone(r) as Arc<dyn PublishHandle>)
            .collect();
        (recorders, PublisherPool::new("test.topic", handles).unwrap())
    }

    #[test]
    fn test_checkout_is_round_robin() {
        let (recorders, pool) = recording_pool(3);

        for k in 0..7u8 {
            pool.checkout().publish(vec![k]).unwrap();
        }

        assert_eq!(recorders[0].calls(), vec![vec![0], vec![3], vec![6]]);
        assert_eq!(recorders[1].calls(), vec![vec![1], vec![4]]);
        assert_eq!(recorders[2].calls(), vec![vec![2], vec![5]]);
    }

    #[test]
    fn test_pool_requires_handles() {
        let err = PublisherPool::new("empty", Vec::new()).err().unwrap();
        assert_eq!(err, BusError::NoHandles("empty".to_string()));
    }

    #[tokio::test]
    async fn test_factory_creates_topic_once() {
        let bus = Arc::new(MemoryBus::new("project"));
        let factory = Arc::new(PublisherPoolFactory::new(
            "project",
            4,
            Ok(bus.clone() as Arc<dyn MessageBus>),
        ));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let factory = Arc::clone(&factory);
                tokio::spawn(async move { factory.checkout("example.topic").await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        assert_eq!(bus.topic_creation_attempts(), 1);
        assert_eq!(factory.pool("example.topic").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_slow_topic_does_not_block_other_topics() {
        let bus = Arc::new(GatedBus {
            inner: MemoryBus::new("project"),
            gated_topic: "slow.topic",
            release: Notify::new(),
        });
        let factory = Arc::new(PublisherPoolFactory::new(
            "project",
            2,
            Ok(bus.clone() as Arc<dyn MessageBus>),
        ));

        let slow = {
            let factory = Arc::clone(&factory);
            tokio::spawn(async move { factory.checkout("slow.topic").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!slow.is_finished());

        let fast = tokio::time::timeout(Duration::from_secs(1), factory.checkout("fast.topic"))
            .await
            .expect("unrelated topic should not wait for the slow creation");
        assert!(fast.is_ok());

        bus.release.notify_one();
        assert!(slow.await.unwrap().is_ok());
        assert_eq!(bus.inner.topic_creation_attempts(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_factory_replays_topic_creation_failure() {
        let bus = Arc::new(MemoryBus::new("project"));
        bus.fail_topic_creation("permission denied");
        let factory =
            PublisherPoolFactory::new("project", 2, Ok(bus.clone() as Arc<dyn MessageBus>));

        let first = factory.checkout("broken.topic").await.err().unwrap();
        let second = factory.checkout("broken.topic").await.err().unwrap();

        assert_eq!(first, second);
        assert!(matches!(first, BusError::TopicCreation { .. }));
        assert_eq!(bus.topic_creation_attempts(), 1);
        assert!(logs_contain("Publisher pool for topic broken.topic is unavailable"));
    }

    #[tokio::test]
    async fn test_registry_shares_factories_per_configuration() {
        let bus = Arc::new(MemoryBus::new("project"));
        let connector = Arc::new(MemoryConnector::new(bus));
        let registry = PoolRegistry::new(connector.clone());

        let a = registry.factory("project", 2).await;
        let b = registry.factory("project", 2).await;
        let c = registry.factory("project", 3).await;

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(connector.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_registry_replays_connect_failure() {
        let connector = Arc::new(MemoryConnector::failing("unreachable"));
        let registry = PoolRegistry::new(connector.clone());

        let factory = registry.factory("project", 2).await;
        let first = factory.checkout("topic").await.err().unwrap();
        let again = registry.factory("project", 2).await;
        let second = again.checkout("other.topic").await.err().unwrap();

        assert!(matches!(first, BusError::Connect { .. }));
        assert_eq!(first, second);
        assert_eq!(connector.connect_attempts(), 1);
    }
}
