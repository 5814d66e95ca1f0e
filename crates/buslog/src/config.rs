// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::time::Duration;

use crate::constants::{DEFAULT_MAX_BATCH_BYTES, DEFAULT_PUBSUB_ENDPOINT, DEFAULT_SLA};
use crate::errors::ConfigError;
use crate::logger_pool::LoggerPoolConfig;
use crate::reorder::ReorderConfig;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Process configuration shared by writers and readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuslogConfig {
    /// Bus namespace (Pub/Sub project id)
    pub project_id: String,
    /// Base URL of the Pub/Sub REST API
    pub pubsub_endpoint: String,
    /// Buffer size of every batching writer
    pub max_batch_bytes: usize,
    /// Emission watermark
    pub sla: Duration,
    /// Publish handles per topic, loggers per pool, decoders per reader
    pub concurrency: usize,
    /// Log level for internal diagnostics (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for BuslogConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            pubsub_endpoint: DEFAULT_PUBSUB_ENDPOINT.to_string(),
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            sla: DEFAULT_SLA,
            concurrency: available_parallelism(),
            log_level: "info".to_string(),
        }
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, usize::from)
}

fn parse_positive(name: &str, value: Option<String>) -> Result<Option<u64>, ConfigError> {
    let Some(value) = value else {
        return Ok(None);
    };
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(Some(n)),
        _ => Err(ConfigError::Invalid(format!(
            "{name} must be a positive integer, got '{value}'"
        ))),
    }
}

impl BuslogConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Create configuration from any variable source. Empty values count as
    /// unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let project_id = get("BUSLOG_PROJECT_ID")
            .or_else(|| get("GOOGLE_PROJECT_ID"))
            .unwrap_or_default();
        let pubsub_endpoint = get("PUBSUB_EMULATOR_HOST")
            .map(|host| format!("http://{}", host.trim()))
            .or_else(|| get("BUSLOG_PUBSUB_ENDPOINT"))
            .unwrap_or_else(|| DEFAULT_PUBSUB_ENDPOINT.to_string());
        let positive = |name: &str| parse_positive(name, get(name));

        let max_batch_bytes = match positive("BUSLOG_MAX_BATCH_BYTES")? {
            Some(n) => usize::try_from(n).map_err(|_| {
                ConfigError::Invalid(format!("BUSLOG_MAX_BATCH_BYTES is too large: {n}"))
            })?,
            None => DEFAULT_MAX_BATCH_BYTES,
        };
        let sla = positive("BUSLOG_SLA_MS")?.map_or(DEFAULT_SLA, Duration::from_millis);
        let parallelism = available_parallelism();
        let concurrency = positive("BUSLOG_MAX_PROCS")?.map_or(parallelism, |cap| {
            parallelism.min(usize::try_from(cap).unwrap_or(usize::MAX))
        });
        let log_level = get("BUSLOG_LOG_LEVEL")
            .map(|val| val.trim().to_lowercase())
            .unwrap_or_else(|| "info".to_string());

        let config = Self {
            project_id,
            pubsub_endpoint,
            max_batch_bytes,
            sla,
            concurrency,
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "BUSLOG_PROJECT_ID or GOOGLE_PROJECT_ID must be set".to_string(),
            ));
        }

        if self.max_batch_bytes == 0 {
            return Err(ConfigError::Invalid(
                "Max batch bytes must be greater than 0".to_string(),
            ));
        }

        if self.sla.is_zero() {
            return Err(ConfigError::Invalid(
                "SLA must be greater than 0".to_string(),
            ));
        }

        if self.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "Concurrency must be greater than 0".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn logger_pool_config(&self) -> LoggerPoolConfig {
        LoggerPoolConfig {
            max_batch_bytes: self.max_batch_bytes,
            sla: self.sla,
            ..Default::default()
        }
    }

    /// One decoder per core except the one left to the merge task.
    #[must_use]
    pub fn reorder_config(&self) -> ReorderConfig {
        ReorderConfig {
            sla: self.sla,
            decoders: self.concurrency.saturating_sub(1).max(1),
            ..Default::default()
        }
    }
}
