// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Largest payload the bus accepts in a single message.
pub const DEFAULT_MAX_BATCH_BYTES: usize = 2 * 1_024 * 1_024;

/// How long a record waits after receipt before it may be emitted.
pub const DEFAULT_SLA: Duration = Duration::from_millis(1_000);

/// Cadence at which the merge owner drains eligible records.
pub const MERGE_TICK: Duration = Duration::from_millis(50);

/// Field carrying the emit time, as Unix epoch seconds with a fractional part.
pub const EMIT_TIME_FIELD: &str = "ts";

/// Lower bound on the background flush cadence.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

pub const DEFAULT_PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";
