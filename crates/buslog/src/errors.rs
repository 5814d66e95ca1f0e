// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised while talking to the message bus.
///
/// Setup failures are cached by the publisher factory and handed back to
/// every later caller, so the type is `Clone` and comparable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("Failed to connect to message bus {identity}: {reason}")]
    Connect { identity: String, reason: String },

    #[error("Failed to create topic {topic}: {reason}")]
    TopicCreation { topic: String, reason: String },

    #[error("Failed to subscribe to topic {topic}: {reason}")]
    Subscription { topic: String, reason: String },

    #[error("Failed to publish {len} bytes to topic {topic}: {reason}")]
    Publish {
        topic: String,
        len: usize,
        reason: String,
    },

    #[error("Message bus returned no publish handles for topic {0}")]
    NoHandles(String),

    #[error("Publisher for topic {0} is closed")]
    Closed(String),
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
