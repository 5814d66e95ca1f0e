// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # buslog
//!
//! Structured logs shipped in size-bounded batches over a publish/subscribe
//! bus, and reconstructed into a single time-ordered stream on the reading
//! side.
//!
//! ## Writing
//!
//! - [`publisher_pool`]: per-topic round-robin pools of publish handles
//! - [`batching_writer`]: buffers writes up to the bus's payload limit
//! - [`logger`] and [`logger_pool`]: JSON line loggers checked out per topic,
//!   flushed in the background at least twice per SLA window
//!
//! ## Reading
//!
//! - [`record`] and [`pqueue`]: payload decoding into persistent queues
//! - [`reorder`]: decoder fan-out and the watermark-based merge
//! - [`reader`]: subscribes to a topic and drives the pipeline
//!
//! ## Buses
//!
//! - [`pubsub`]: Google Cloud Pub/Sub REST API
//! - [`memory`]: in-process loopback

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batching_writer;
pub mod bus;
pub mod config;
pub mod constants;
pub mod errors;
pub mod logger;
pub mod logger_pool;
pub mod memory;
pub mod pqueue;
pub mod publisher_pool;
pub mod pubsub;
pub mod reader;
pub mod record;
pub mod recycle_pool;
pub mod reorder;
