// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Structured, leveled logging onto a [`BatchingWriter`].
//!
//! Each entry becomes one JSON object on its own line:
//!
//! ```text
//! {"level":"info","ts":1700000000.123456,"msg":"Doing something","url":"https://example.com"}
//! ```
//!
//! The `ts` field is what the reorder pipeline sorts on.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::error;

use crate::batching_writer::BatchingWriter;
use crate::bus::PublishHandle;
use crate::constants::EMIT_TIME_FIELD;
use crate::errors::BusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Error,
}

/// Leveled key-value logging capability handed out by the logger pool.
pub trait StructuredLog {
    fn log(&self, level: Level, msg: &str, fields: &[(&str, Value)]);

    /// Publishes everything logged so far.
    fn sync(&self) -> Result<(), BusError>;

    fn debug(&self, msg: &str, fields: &[(&str, Value)]) {
        self.log(Level::Debug, msg, fields);
    }

    fn info(&self, msg: &str, fields: &[(&str, Value)]) {
        self.log(Level::Info, msg, fields);
    }

    fn error(&self, msg: &str, fields: &[(&str, Value)]) {
        self.log(Level::Error, msg, fields);
    }
}

pub struct Logger {
    writer: BatchingWriter,
    min_level: Level,
}

impl Logger {
    #[must_use]
    pub fn new(writer: BatchingWriter) -> Self {
        Self {
            writer,
            min_level: Level::Debug,
        }
    }

    #[must_use]
    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }

    /// Logger over its own writer of `capacity` bytes on `handle`.
    #[must_use]
    pub fn for_handle(handle: Arc<dyn PublishHandle>, capacity: usize) -> Self {
        Self::new(BatchingWriter::with_capacity(handle, capacity))
    }

    pub fn writer(&self) -> &BatchingWriter {
        &self.writer
    }

    fn encode(level: Level, msg: &str, fields: &[(&str, Value)]) -> serde_json::Result<Vec<u8>> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        let mut entry = Map::with_capacity(fields.len() + 3);
        entry.insert("level".to_string(), serde_json::to_value(level)?);
        entry.insert(EMIT_TIME_FIELD.to_string(), Value::from(ts));
        entry.insert("msg".to_string(), Value::from(msg));
        for (key, value) in fields {
            // Reserved keys keep their values.
            entry
                .entry((*key).to_string())
                .or_insert_with(|| value.clone());
        }

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        Ok(line)
    }
}

impl StructuredLog for Logger {
    fn log(&self, level: Level, msg: &str, fields: &[(&str, Value)]) {
        if level < self.min_level {
            return;
        }
        let line = match Self::encode(level, msg, fields) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode log entry: {e}");
                return;
            }
        };
        if let Err(e) = self.writer.write(&line) {
            error!("Failed to write log entry: {e}");
        }
    }

    fn sync(&self) -> Result<(), BusError> {
        self.writer.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batching_writer::tests::RecordingHandle;
    use serde_json::json;

    fn logger() -> (Arc<RecordingHandle>, Logger) {
        let handle = Arc::new(RecordingHandle::default());
        let logger = Logger::for_handle(handle.clone(), 4_096);
        (handle, logger)
    }

    #[test]
    fn test_entry_is_one_json_line() {
        let (handle, logger) = logger();
        logger.info(
            "Doing something really important",
            &[("url", json!("https://google.com")), ("some_num", json!(5))],
        );
        logger.sync().unwrap();

        let calls = handle.calls();
        assert_eq!(calls.len(), 1);
        let text = String::from_utf8(calls[0].clone()).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);

        let entry: Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(entry["level"], "info");
        assert_eq!(entry["msg"], "Doing something really important");
        assert_eq!(entry["url"], "https://google.com");
        assert_eq!(entry["some_num"], 5);
        assert!(entry["ts"].as_f64().unwrap() > 1_600_000_000.0);
    }

    #[test]
    fn test_reserved_fields_are_not_overwritten() {
        let (handle, logger) = logger();
        logger.error("boom", &[("ts", json!("later")), ("level", json!("fatal"))]);
        logger.sync().unwrap();

        let line = String::from_utf8(handle.calls()[0].clone()).unwrap();
        let entry: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert!(entry["ts"].is_f64());
        assert_eq!(entry["level"], "error");
    }

    #[test]
    fn test_min_level_filters_entries() {
        let (handle, logger) = logger();
        let logger = logger.with_min_level(Level::Info);
        logger.debug("hidden", &[]);
        logger.info("shown", &[]);
        logger.sync().unwrap();

        let text = String::from_utf8(handle.calls().concat()).unwrap();
        assert!(!text.contains("hidden"));
        assert!(text.contains("shown"));
    }

    #[test]
    fn test_entries_accumulate_until_sync() {
        let (handle, logger) = logger();
        for i in 0..3 {
            logger.debug("tick", &[("i", json!(i))]);
        }
        assert!(handle.calls().is_empty());
        logger.sync().unwrap();
        let text = String::from_utf8(handle.calls().concat()).unwrap();
        assert_eq!(text.lines().count(), 3);
    }
}
