// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Boundary between the pipeline and the managed publish/subscribe bus.
//!
//! Everything in the crate talks to the bus through these traits, so the REST
//! gateway in [`crate::pubsub`] and the loopback bus in [`crate::memory`] are
//! interchangeable.

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::BusError;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Receives every raw payload delivered by a subscription. The returned future
/// is awaited before the next payload is delivered, so a slow consumer slows
/// the delivery loop down instead of buffering without bound.
pub type PayloadHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<()> + Send + Sync>;

/// Capability to publish opaque payloads to one topic.
///
/// `publish` must not block on the network: adapters hand the payload to their
/// own delivery task. A zero-length payload is accepted and never sent.
pub trait PublishHandle: Send + Sync {
    fn topic(&self) -> &str;

    fn publish(&self, payload: Vec<u8>) -> Result<(), BusError>;
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Namespace the bus operates in, e.g. the cloud project id.
    fn identity(&self) -> &str;

    /// Creates the topic unless it already exists.
    async fn maybe_create_topic(&self, topic: &str) -> Result<(), BusError>;

    /// Returns `n` independent publish handles for `topic`.
    fn publish_handles(&self, topic: &str, n: usize) -> Vec<Arc<dyn PublishHandle>>;

    async fn subscribe(
        &self,
        topic: &str,
        handler: PayloadHandler,
    ) -> Result<Subscription, BusError>;
}

/// Opens a [`MessageBus`] for a namespace.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self, identity: &str) -> Result<Arc<dyn MessageBus>, BusError>;
}

pub type Cleanup = Box<dyn FnOnce() -> BoxFuture<Result<(), BusError>> + Send>;

/// A live subscription. Nothing is delivered until `start` is polled; `cleanup`
/// stops delivery and removes the subscription from the bus.
pub struct Subscription {
    start: BoxFuture<()>,
    cleanup: Cleanup,
}

impl Subscription {
    pub fn new<S, C, F>(start: S, cleanup: C) -> Self
    where
        S: Future<Output = ()> + Send + 'static,
        C: FnOnce() -> F + Send + 'static,
        F: Future<Output = Result<(), BusError>> + Send + 'static,
    {
        Self {
            start: Box::pin(start),
            cleanup: Box::new(move || -> BoxFuture<Result<(), BusError>> {
                Box::pin(cleanup())
            }),
        }
    }

    pub fn into_parts(self) -> (BoxFuture<()>, Cleanup) {
        (self.start, self.cleanup)
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Subscription")
    }
}
