// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Google Cloud Pub/Sub over its v1 REST API.
//!
//! Requests are sent unauthenticated, which suits the Pub/Sub emulator or an
//! authenticating sidecar proxy in front of the real service.
//!
//! Each publish handle owns a delivery task, so `publish` only enqueues the
//! payload. Delivery failures are logged and the payload is discarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::bus::{BusConnector, MessageBus, PayloadHandler, PublishHandle, Subscription};
use crate::constants::DEFAULT_PUBSUB_ENDPOINT;
use crate::errors::BusError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PULL_BATCH: u32 = 100;
const ACK_DEADLINE_SECONDS: u32 = 60;
const PULL_RETRY_BACKOFF: Duration = Duration::from_secs(1);

static SUBSCRIPTION_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Serialize)]
struct PublishRequest {
    messages: Vec<OutgoingMessage>,
}

#[derive(Serialize)]
struct OutgoingMessage {
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionRequest {
    topic: String,
    ack_deadline_seconds: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: u32,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: IncomingMessage,
}

#[derive(Deserialize)]
struct IncomingMessage {
    #[serde(default)]
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest {
    ack_ids: Vec<String>,
}

fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)))
        .build()
}

fn subscription_name(topic: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let n = SUBSCRIPTION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{topic}-reader-{}-{nanos}-{n}", std::process::id())
}

async fn failure_reason(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    format!("HTTP {status}: {body}")
}

pub struct PubSubBus {
    project: String,
    endpoint: String,
    client: reqwest::Client,
}

impl PubSubBus {
    pub fn new(project: &str, endpoint: &str) -> Result<Self, BusError> {
        let client = build_client().map_err(|e| BusError::Connect {
            identity: project.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::with_client(project, endpoint, client))
    }

    #[must_use]
    pub fn with_client(project: &str, endpoint: &str, client: reqwest::Client) -> Self {
        Self {
            project: project.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn topic_resource(&self, topic: &str) -> String {
        format!("projects/{}/topics/{topic}", self.project)
    }

    fn url(&self, resource: &str) -> String {
        format!("{}/v1/{resource}", self.endpoint)
    }
}

#[async_trait]
impl MessageBus for PubSubBus {
    fn identity(&self) -> &str {
        &self.project
    }

    async fn maybe_create_topic(&self, topic: &str) -> Result<(), BusError> {
        let creation_error = |reason: String| BusError::TopicCreation {
            topic: topic.to_string(),
            reason,
        };
        let response = self
            .client
            .put(self.url(&self.topic_resource(topic)))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| creation_error(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                debug!("PUBSUB | Created topic {topic}");
                Ok(())
            }
            StatusCode::CONFLICT => Ok(()),
            _ => Err(creation_error(failure_reason(response).await)),
        }
    }

    fn publish_handles(&self, topic: &str, n: usize) -> Vec<Arc<dyn PublishHandle>> {
        let url = format!("{}:publish", self.url(&self.topic_resource(topic)));
        (0..n)
            .map(|_| {
                Arc::new(PubSubPublisher::spawn(
                    topic,
                    url.clone(),
                    self.client.clone(),
                )) as Arc<dyn PublishHandle>
            })
            .collect()
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: PayloadHandler,
    ) -> Result<Subscription, BusError> {
        let subscription_error = |reason: String| BusError::Subscription {
            topic: topic.to_string(),
            reason,
        };
        let name = subscription_name(topic);
        let resource = format!("projects/{}/subscriptions/{name}", self.project);
        let url = self.url(&resource);

        let response = self
            .client
            .put(&url)
            .json(&SubscriptionRequest {
                topic: self.topic_resource(topic),
                ack_deadline_seconds: ACK_DEADLINE_SECONDS,
            })
            .send()
            .await
            .map_err(|e| subscription_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(subscription_error(failure_reason(response).await));
        }
        debug!("PUBSUB | Created subscription {name} on topic {topic}");

        let cancel = CancellationToken::new();
        let puller = Puller {
            client: self.client.clone(),
            url: url.clone(),
            handler,
        };
        let start = puller.run(cancel.clone());

        let client = self.client.clone();
        let topic = topic.to_string();
        let cleanup = move || async move {
            cancel.cancel();
            let response = client.delete(&url).send().await.map_err(|e| {
                BusError::Subscription {
                    topic: topic.clone(),
                    reason: e.to_string(),
                }
            })?;
            match response.status() {
                status if status.is_success() => {
                    debug!("PUBSUB | Deleted subscription {name}");
                    Ok(())
                }
                StatusCode::NOT_FOUND => Ok(()),
                _ => Err(BusError::Subscription {
                    topic,
                    reason: failure_reason(response).await,
                }),
            }
        };

        Ok(Subscription::new(start, cleanup))
    }
}

struct PubSubPublisher {
    topic: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl PubSubPublisher {
    fn spawn(topic: &str, url: String, client: reqwest::Client) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let task_topic = topic.to_string();
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let body = PublishRequest {
                    messages: vec![OutgoingMessage {
                        data: STANDARD.encode(&payload),
                    }],
                };
                match client.post(&url).json(&body).send().await {
                    Ok(response) if response.status().is_success() => {}
                    Ok(response) => error!(
                        "PUBSUB | Failed to publish {} bytes to {task_topic}: {}",
                        payload.len(),
                        failure_reason(response).await
                    ),
                    Err(e) => error!(
                        "PUBSUB | Failed to publish {} bytes to {task_topic}: {e}",
                        payload.len()
                    ),
                }
            }
            debug!("PUBSUB | Publisher for {task_topic} stopped");
        });
        Self {
            topic: topic.to_string(),
            tx,
        }
    }
}

impl PublishHandle for PubSubPublisher {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn publish(&self, payload: Vec<u8>) -> Result<(), BusError> {
        if payload.is_empty() {
            return Ok(());
        }
        self.tx
            .send(payload)
            .map_err(|_| BusError::Closed(self.topic.clone()))
    }
}

struct Puller {
    client: reqwest::Client,
    url: String,
    handler: PayloadHandler,
}

impl Puller {
    async fn run(self, cancel: CancellationToken) {
        loop {
            let pulled = tokio::select! {
                () = cancel.cancelled() => break,
                pulled = self.pull() => pulled,
            };
            let messages = match pulled {
                Ok(messages) => messages,
                Err(e) if e.is_timeout() => continue,
                Err(e) => {
                    warn!("PUBSUB | Pull from {} failed: {e}", self.url);
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(PULL_RETRY_BACKOFF) => continue,
                    }
                }
            };

            let mut ack_ids = Vec::with_capacity(messages.len());
            for received in messages {
                match STANDARD.decode(received.message.data.as_bytes()) {
                    Ok(payload) => (self.handler)(payload).await,
                    Err(e) => warn!("PUBSUB | Discarding message with invalid data: {e}"),
                }
                ack_ids.push(received.ack_id);
            }
            if !ack_ids.is_empty() {
                self.acknowledge(ack_ids).await;
            }
        }
        debug!("PUBSUB | Pull loop for {} stopped", self.url);
    }

    async fn pull(&self) -> Result<Vec<ReceivedMessage>, reqwest::Error> {
        let response = self
            .client
            .post(format!("{}:pull", self.url))
            .json(&PullRequest {
                max_messages: PULL_BATCH,
            })
            .send()
            .await?
            .error_for_status()?;
        let body: PullResponse = response.json().await?;
        Ok(body.received_messages)
    }

    async fn acknowledge(&self, ack_ids: Vec<String>) {
        let count = ack_ids.len();
        let result = self
            .client
            .post(format!("{}:acknowledge", self.url))
            .json(&AcknowledgeRequest { ack_ids })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        if let Err(e) = result {
            warn!("PUBSUB | Failed to acknowledge {count} messages: {e}");
        }
    }
}

/// Connects to Pub/Sub at a fixed endpoint.
#[derive(Debug, Clone)]
pub struct PubSubConnector {
    endpoint: String,
}

impl PubSubConnector {
    #[must_use]
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
        }
    }
}

impl Default for PubSubConnector {
    fn default() -> Self {
        Self::new(DEFAULT_PUBSUB_ENDPOINT)
    }
}

#[async_trait]
impl BusConnector for PubSubConnector {
    async fn connect(&self, identity: &str) -> Result<Arc<dyn MessageBus>, BusError> {
        let bus = PubSubBus::new(identity, &self.endpoint)?;
        Ok(Arc::new(bus))
    }
}
