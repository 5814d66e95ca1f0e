// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-topic pools of ready loggers.
//!
//! Each topic owns `concurrency` loggers, each over its own batching writer and
//! its own round-robin publish handle. Checkout pops a member; once every
//! member is out, callers get a disposable logger that is flushed and dropped
//! on release so the pool never grows past its configured size.
//!
//! A flush daemon per topic cycles through the members, checking one out,
//! flushing it, and reinserting it at the back. It runs every
//! `sla / (2 * concurrency)`, so across the pool buffered entries are flushed
//! at least twice per SLA window.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bus::PublishHandle;
use crate::constants::{DEFAULT_MAX_BATCH_BYTES, DEFAULT_SLA, MIN_FLUSH_INTERVAL};
use crate::errors::BusError;
use crate::logger::{Level, Logger, StructuredLog};
use crate::publisher_pool::PublisherPoolFactory;
use crate::recycle_pool::RecyclePool;

#[derive(Debug, Clone)]
pub struct LoggerPoolConfig {
    /// Buffer size of every logger's batching writer.
    pub max_batch_bytes: usize,
    /// Emission watermark of the readers; drives the flush cadence.
    pub sla: Duration,
    pub min_level: Level,
}

impl Default for LoggerPoolConfig {
    fn default() -> Self {
        Self {
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            sla: DEFAULT_SLA,
            min_level: Level::Debug,
        }
    }
}

/// Interval between two background flushes of a topic's pool.
#[must_use]
pub fn flush_interval(sla: Duration, concurrency: usize) -> Duration {
    let divisor = u32::try_from(concurrency.max(1).saturating_mul(2)).unwrap_or(u32::MAX);
    (sla / divisor).max(MIN_FLUSH_INTERVAL)
}

struct TopicLoggers {
    topic: String,
    members: RecyclePool<Logger>,
    factory: Arc<PublisherPoolFactory>,
    config: LoggerPoolConfig,
}

impl TopicLoggers {
    fn new_logger(&self, handle: Arc<dyn PublishHandle>) -> Logger {
        Logger::for_handle(handle, self.config.max_batch_bytes)
            .with_min_level(self.config.min_level)
    }

    async fn checkout(self: &Arc<Self>) -> Result<PooledLogger, BusError> {
        if let Some(logger) = self.members.checkout().await {
            return Ok(PooledLogger {
                logger: Some(logger),
                release: Release::ReturnToPool(Arc::clone(self)),
            });
        }

        debug!(
            "Logger pool for topic {} is exhausted, using a disposable logger",
            self.topic
        );
        let handle = self.factory.checkout(&self.topic).await?;
        Ok(PooledLogger {
            logger: Some(self.new_logger(handle)),
            release: Release::FlushAndDrop,
        })
    }
}

enum Release {
    ReturnToPool(Arc<TopicLoggers>),
    FlushAndDrop,
}

/// A checked-out logger. Dropping it performs its release action.
pub struct PooledLogger {
    logger: Option<Logger>,
    release: Release,
}

impl PooledLogger {
    /// True when this logger lives outside the pool and is flushed on release.
    pub fn is_disposable(&self) -> bool {
        matches!(self.release, Release::FlushAndDrop)
    }

    /// Flushes the logger and puts it behind every other pool member.
    fn recycle(mut self) {
        let Some(logger) = self.logger.take() else {
            return;
        };
        flush(&logger);
        if let Release::ReturnToPool(pool) = &self.release {
            if pool.members.checkin_back(logger).is_err() {
                debug!("Logger pool for topic {} is closed, dropping member", pool.topic);
            }
        }
    }
}

impl Deref for PooledLogger {
    type Target = Logger;

    fn deref(&self) -> &Logger {
        #[allow(clippy::expect_used)]
        let logger = self.logger.as_ref().expect("logger is present until release");
        logger
    }
}

impl Drop for PooledLogger {
    fn drop(&mut self) {
        let Some(logger) = self.logger.take() else {
            return;
        };
        match &self.release {
            Release::ReturnToPool(pool) => {
                if let Err(logger) = pool.members.checkin_front(logger) {
                    // Torn down while this logger was out.
                    flush(&logger);
                }
            }
            Release::FlushAndDrop => flush(&logger),
        }
    }
}

fn flush(logger: &Logger) {
    if let Err(e) = logger.sync() {
        error!("Failed to flush logger: {e}");
    }
}

pub struct LoggerPool {
    factory: Arc<PublisherPoolFactory>,
    config: LoggerPoolConfig,
    topics: RwLock<HashMap<String, Arc<TopicLoggers>>>,
    init_lock: TokioMutex<()>,
    shutdown: CancellationToken,
    daemons: Mutex<Vec<JoinHandle<()>>>,
}

impl LoggerPool {
    #[must_use]
    pub fn new(factory: Arc<PublisherPoolFactory>, config: LoggerPoolConfig) -> Self {
        Self {
            factory,
            config,
            topics: RwLock::new(HashMap::new()),
            init_lock: TokioMutex::new(()),
            shutdown: CancellationToken::new(),
            daemons: Mutex::new(Vec::new()),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.factory.concurrency()
    }

    /// Number of loggers currently resting in the pool for `topic`.
    pub fn available(&self, topic: &str) -> usize {
        self.lookup(topic).map_or(0, |loggers| loggers.members.len())
    }

    pub async fn checkout(&self, topic: &str) -> Result<PooledLogger, BusError> {
        self.topic_loggers(topic).await?.checkout().await
    }

    /// Runs `f` with a checked-out logger and releases it afterwards.
    pub async fn with_logger<F, R>(&self, topic: &str, f: F) -> Result<R, BusError>
    where
        F: FnOnce(&dyn StructuredLog) -> R,
    {
        let logger = self.checkout(topic).await?;
        Ok(f(&*logger))
    }

    /// Stops every flush daemon, then closes each pool and flushes its
    /// members. Loggers released after that are flushed by their holder, and
    /// later checkouts are served by disposable loggers.
    pub async fn teardown(&self) {
        self.shutdown.cancel();
        // Waits out any initialization that started before the cancel.
        let _init = self.init_lock.lock().await;

        let daemons = {
            #[allow(clippy::expect_used)]
            let mut daemons = self.daemons.lock().expect("lock poisoned");
            std::mem::take(&mut *daemons)
        };
        for daemon in daemons {
            if let Err(e) = daemon.await {
                error!("Flush daemon ended abnormally: {e}");
            }
        }

        let topics: Vec<Arc<TopicLoggers>> = {
            #[allow(clippy::expect_used)]
            let topics = self.topics.read().expect("lock poisoned");
            topics.values().cloned().collect()
        };
        for loggers in topics {
            let members = loggers.members.close();
            for logger in &members {
                flush(logger);
            }
            info!("Flushed {} loggers for topic {}", members.len(), loggers.topic);
        }
    }

    async fn topic_loggers(&self, topic: &str) -> Result<Arc<TopicLoggers>, BusError> {
        if let Some(loggers) = self.lookup(topic) {
            return Ok(loggers);
        }

        let _init = self.init_lock.lock().await;
        if let Some(loggers) = self.lookup(topic) {
            return Ok(loggers);
        }

        let closed = self.shutdown.child_token();
        let mut members = Vec::new();
        if !closed.is_cancelled() {
            for _ in 0..self.concurrency() {
                let handle = self.factory.checkout(topic).await?;
                members.push(
                    Logger::for_handle(handle, self.config.max_batch_bytes)
                        .with_min_level(self.config.min_level),
                );
            }
        }

        let loggers = Arc::new(TopicLoggers {
            topic: topic.to_string(),
            members: RecyclePool::new(members),
            factory: Arc::clone(&self.factory),
            config: self.config.clone(),
        });

        if closed.is_cancelled() {
            loggers.members.close();
        } else {
            let interval = flush_interval(self.config.sla, self.concurrency());
            debug!(
                "Starting flush daemon for topic {} every {:?}",
                topic, interval
            );
            let daemon = tokio::spawn(flush_daemon(Arc::clone(&loggers), interval, closed));
            #[allow(clippy::expect_used)]
            let mut daemons = self.daemons.lock().expect("lock poisoned");
            daemons.push(daemon);
        }

        {
            #[allow(clippy::expect_used)]
            let mut topics = self.topics.write().expect("lock poisoned");
            topics.insert(topic.to_string(), Arc::clone(&loggers));
        }
        Ok(loggers)
    }

    fn lookup(&self, topic: &str) -> Option<Arc<TopicLoggers>> {
        #[allow(clippy::expect_used)]
        let topics = self.topics.read().expect("lock poisoned");
        topics.get(topic).cloned()
    }
}

impl Drop for LoggerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn flush_daemon(loggers: Arc<TopicLoggers>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // Every member is checked out; their holders return them shortly.
        let Some(logger) = loggers.members.checkout().await else {
            continue;
        };
        PooledLogger {
            logger: Some(logger),
            release: Release::ReturnToPool(Arc::clone(&loggers)),
        }
        .recycle();
    }

    debug!("Flush daemon for topic {} stopped", loggers.topic);
}
