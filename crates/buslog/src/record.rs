// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::debug;

use crate::constants::EMIT_TIME_FIELD;
use crate::pqueue::PersistentHeap;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Producer-side timestamp of a record, split into whole seconds and
/// nanoseconds in `[0, 1e9)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EmitTime {
    pub secs: i64,
    pub nanos: u32,
}

impl EmitTime {
    /// `None` for non-finite values and values outside the `i64` second range.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_epoch_seconds(epoch: f64) -> Option<Self> {
        if !epoch.is_finite() {
            return None;
        }
        let mut secs = epoch.floor();
        let mut nanos = ((epoch - secs) * NANOS_PER_SEC).round();
        if nanos >= NANOS_PER_SEC {
            secs += 1.0;
            nanos -= NANOS_PER_SEC;
        }
        // i64::MAX as f64 rounds up to 2^63, which is already out of range.
        if secs < i64::MIN as f64 || secs >= i64::MAX as f64 {
            return None;
        }
        Some(Self {
            secs: secs as i64,
            nanos: nanos as u32,
        })
    }
}

/// One decoded line, ordered by emit time and then by receipt sequence.
#[derive(Debug, Clone)]
pub struct Record {
    pub line: Arc<str>,
    pub received: Instant,
    pub emitted: EmitTime,
    pub seq: u64,
}

impl Record {
    fn key(&self) -> (EmitTime, u64) {
        (self.emitted, self.seq)
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Record {}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Record {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key().cmp(&other.key())
    }
}

#[derive(Debug, Default)]
pub struct DecodeStats {
    decoded: AtomicU64,
    dropped: AtomicU64,
}

impl DecodeStats {
    pub fn decoded(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }

    /// Lines discarded for bad encoding or a missing or invalid emit time.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Reads the emit time of one encoded entry.
pub fn extract_emit_time(line: &str) -> Option<EmitTime> {
    let entry: Value = serde_json::from_str(line).ok()?;
    entry
        .get(EMIT_TIME_FIELD)
        .and_then(Value::as_f64)
        .and_then(EmitTime::from_epoch_seconds)
}

fn lines(payload: &[u8]) -> Vec<&[u8]> {
    let mut segments: Vec<&[u8]> = payload.split(|b| *b == b'\n').collect();
    // Payloads end with a newline, so the final empty segment is not a line.
    if segments.last().is_some_and(|s| s.is_empty()) {
        segments.pop();
    }
    segments
}

/// Number of lines in a payload, which is the size of the sequence range
/// [`decode_batch`] consumes for it.
pub fn line_count(payload: &[u8]) -> u64 {
    lines(payload).len() as u64
}

/// Splits a payload on `\n` and decodes every line into one queue.
///
/// Line `i` gets sequence number `first_seq + i`. Lines that cannot be decoded
/// are dropped and counted, leaving a gap in the range.
pub fn decode_batch(
    payload: &[u8],
    received: Instant,
    first_seq: u64,
    stats: &DecodeStats,
) -> PersistentHeap<Record> {
    let mut queue = PersistentHeap::empty();
    let mut dropped = 0;
    for (seq, segment) in (first_seq..).zip(lines(payload)) {
        let decoded = std::str::from_utf8(segment)
            .ok()
            .and_then(|line| extract_emit_time(line).map(|emitted| (line, emitted)));
        let Some((line, emitted)) = decoded else {
            dropped += 1;
            continue;
        };
        queue = queue.enqueue(Record {
            line: Arc::from(line),
            received,
            emitted,
            seq,
        });
    }

    stats
        .decoded
        .fetch_add(queue.len() as u64, Ordering::Relaxed);
    if dropped > 0 {
        stats.dropped.fetch_add(dropped, Ordering::Relaxed);
        debug!("Dropped {dropped} undecodable lines from a {} byte payload", payload.len());
    }
    queue
}
