// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process loopback bus.
//!
//! Every publish is stored in a per-topic log and fanned out to the live
//! subscribers of that topic. Useful for tests and for running the pipeline
//! without a broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bus::{BusConnector, MessageBus, PayloadHandler, PublishHandle, Subscription};
use crate::errors::BusError;

#[derive(Default)]
struct TopicState {
    published: Vec<Vec<u8>>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicState>,
    creation_attempts: usize,
    creation_failure: Option<String>,
    next_subscription: u64,
}

pub struct MemoryBus {
    identity: String,
    state: Arc<Mutex<State>>,
}

impl MemoryBus {
    #[must_use]
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Makes every later topic creation fail with `reason`.
    pub fn fail_topic_creation(&self, reason: &str) {
        self.lock().creation_failure = Some(reason.to_string());
    }

    pub fn topic_creation_attempts(&self) -> usize {
        self.lock().creation_attempts
    }

    /// Every payload published to `topic`, in publish order.
    pub fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.lock()
            .topics
            .get(topic)
            .map(|t| t.published.clone())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .topics
            .get(topic)
            .map_or(0, |t| t.subscribers.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        #[allow(clippy::expect_used)]
        let state = self.state.lock().expect("lock poisoned");
        state
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn maybe_create_topic(&self, topic: &str) -> Result<(), BusError> {
        let mut state = self.lock();
        state.creation_attempts += 1;
        if let Some(reason) = &state.creation_failure {
            return Err(BusError::TopicCreation {
                topic: topic.to_string(),
                reason: reason.clone(),
            });
        }
        state.topics.entry(topic.to_string()).or_default();
        Ok(())
    }

    fn publish_handles(&self, topic: &str, n: usize) -> Vec<Arc<dyn PublishHandle>> {
        (0..n)
            .map(|_| {
                Arc::new(MemoryPublisher {
                    topic: topic.to_string(),
                    state: Arc::clone(&self.state),
                }) as Arc<dyn PublishHandle>
            })
            .collect()
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: PayloadHandler,
    ) -> Result<Subscription, BusError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.lock();
            let id = state.next_subscription;
            state.next_subscription += 1;
            let Some(topic_state) = state.topics.get_mut(topic) else {
                return Err(BusError::Subscription {
                    topic: topic.to_string(),
                    reason: "topic does not exist".to_string(),
                });
            };
            topic_state.subscribers.insert(id, tx);
            id
        };

        let start = async move {
            while let Some(payload) = rx.recv().await {
                handler(payload).await;
            }
        };

        let state = Arc::clone(&self.state);
        let topic = topic.to_string();
        let cleanup = move || async move {
            #[allow(clippy::expect_used)]
            let mut state = state.lock().expect("lock poisoned");
            if let Some(topic_state) = state.topics.get_mut(&topic) {
                topic_state.subscribers.remove(&id);
            }
            debug!("Removed memory subscription {id} from topic {topic}");
            Ok(())
        };

        Ok(Subscription::new(start, cleanup))
    }
}

struct MemoryPublisher {
    topic: String,
    state: Arc<Mutex<State>>,
}

impl PublishHandle for MemoryPublisher {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn publish(&self, payload: Vec<u8>) -> Result<(), BusError> {
        if payload.is_empty() {
            return Ok(());
        }
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");
        let Some(topic_state) = state.topics.get_mut(&self.topic) else {
            return Err(BusError::Publish {
                topic: self.topic.clone(),
                len: payload.len(),
                reason: "topic does not exist".to_string(),
            });
        };
        for subscriber in topic_state.subscribers.values() {
            // A subscriber whose receiver is gone is removed by its cleanup.
            let _ = subscriber.send(payload.clone());
        }
        topic_state.published.push(payload);
        Ok(())
    }
}

/// Hands out one shared [`MemoryBus`], or a fixed connection failure.
pub struct MemoryConnector {
    bus: Option<Arc<MemoryBus>>,
    failure: String,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    #[must_use]
    pub fn new(bus: Arc<MemoryBus>) -> Self {
        Self {
            bus: Some(bus),
            failure: String::new(),
            attempts: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn failing(reason: &str) -> Self {
        Self {
            bus: None,
            failure: reason.to_string(),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }
}

#[async_trait]
impl BusConnector for MemoryConnector {
    async fn connect(&self, identity: &str) -> Result<Arc<dyn MessageBus>, BusError> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        match &self.bus {
            Some(bus) => Ok(Arc::clone(bus) as Arc<dyn MessageBus>),
            None => Err(BusError::Connect {
                identity: identity.to_string(),
                reason: self.failure.clone(),
            }),
        }
    }
}
