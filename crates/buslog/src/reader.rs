// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Follows one topic and feeds every delivered payload through a
//! [`ReorderPipeline`].

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::bus::{BoxFuture, Cleanup, MessageBus, PayloadHandler};
use crate::errors::BusError;
use crate::reorder::{PipelineStats, RecordSink, ReorderConfig, ReorderPipeline};

pub struct TopicReader {
    topic: String,
    cleanup: Cleanup,
    delivery: JoinHandle<()>,
    pipeline: ReorderPipeline,
}

/// Creates the topic if needed, starts the pipeline and subscribes to it.
///
/// Payload delivery waits while the pipeline's inbound queue is full.
pub async fn follow_topic<S: RecordSink>(
    bus: &dyn MessageBus,
    topic: &str,
    config: ReorderConfig,
    sink: S,
) -> Result<TopicReader, BusError> {
    bus.maybe_create_topic(topic).await?;

    let pipeline = ReorderPipeline::spawn(config, sink);
    let inbound = pipeline.inbound();
    let handler_topic = topic.to_string();
    let handler: PayloadHandler = Arc::new(move |payload: Vec<u8>| -> BoxFuture<()> {
        let inbound = inbound.clone();
        let topic = handler_topic.clone();
        Box::pin(async move {
            if inbound.send(payload).await.is_err() {
                debug!("Reader for topic {topic} is shutting down, payload discarded");
            }
        })
    });

    let subscription = match bus.subscribe(topic, handler).await {
        Ok(subscription) => subscription,
        Err(e) => {
            pipeline.shutdown().await;
            return Err(e);
        }
    };
    let (start, cleanup) = subscription.into_parts();
    let delivery = tokio::spawn(start);

    info!("Following topic {topic} on {}", bus.identity());
    Ok(TopicReader {
        topic: topic.to_string(),
        cleanup,
        delivery,
        pipeline,
    })
}

impl TopicReader {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.pipeline.stats()
    }

    /// Removes the subscription, waits for delivery to stop, then drains the
    /// pipeline. The pipeline is drained even when cleanup fails.
    pub async fn shutdown(self) -> Result<(), BusError> {
        let cleaned = (self.cleanup)().await;
        if let Err(e) = &cleaned {
            error!("Failed to clean up subscription for topic {}: {e}", self.topic);
            self.delivery.abort();
        }
        if let Err(e) = self.delivery.await {
            if !e.is_cancelled() {
                error!("Delivery for topic {} ended abnormally: {e}", self.topic);
            }
        }
        self.pipeline.shutdown().await;
        info!("Stopped following topic {}", self.topic);
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::PublishHandle;
    use crate::record::Record;
    use crate::memory::MemoryBus;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_follow_topic_emits_published_records() {
        let bus = MemoryBus::new("project");
        let (tx, mut rx) = mpsc::unbounded_channel::<Record>();
        let config = ReorderConfig {
            sla: Duration::from_millis(50),
            tick: Duration::from_millis(10),
            ..Default::default()
        };
        let reader = follow_topic(&bus, "t", config, tx).await.unwrap();
        assert_eq!(bus.subscriber_count("t"), 1);

        let handles = bus.publish_handles("t", 1);
        handles[0]
            .publish(b"{\"ts\":2.0,\"msg\":\"b\"}\n{\"ts\":1.0,\"msg\":\"a\"}\n".to_vec())
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(&*first.line, "{\"ts\":1.0,\"msg\":\"a\"}");
        assert_eq!(&*second.line, "{\"ts\":2.0,\"msg\":\"b\"}");

        reader.shutdown().await.unwrap();
        assert_eq!(bus.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn test_follow_topic_creates_missing_topic() {
        let bus = MemoryBus::new("project");
        let (tx, _rx) = mpsc::unbounded_channel::<Record>();
        let reader = follow_topic(&bus, "fresh", ReorderConfig::default(), tx)
            .await
            .unwrap();
        assert_eq!(bus.topic_creation_attempts(), 1);
        assert_eq!(reader.topic(), "fresh");
        reader.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_topic_creation_failure_is_returned() {
        let bus = MemoryBus::new("project");
        bus.fail_topic_creation("quota exceeded");
        let (tx, _rx) = mpsc::unbounded_channel::<Record>();
        let err = follow_topic(&bus, "t", ReorderConfig::default(), tx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BusError::TopicCreation { .. }));
    }
}
