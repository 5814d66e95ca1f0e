// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Size-bounded coalescing of small writes into bus-sized publishes.
//!
//! Small writes are appended to an in-memory buffer and only published when the
//! next write would overflow it or when [`BatchingWriter::sync`] is called.
//! Writes larger than the buffer bypass it after pending bytes are published.
//!
//! Two locks are involved. `buffer` guards the bytes and is only ever held for
//! an append or a swap. `publish_order` is held from the moment a batch is
//! swapped out until it has been handed to the bus, so batches leave in the
//! order they were filled while concurrent writers keep appending to the fresh
//! buffer during a slow publish.

use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::bus::PublishHandle;
use crate::constants::DEFAULT_MAX_BATCH_BYTES;
use crate::errors::BusError;

pub struct BatchingWriter {
    handle: Arc<dyn PublishHandle>,
    capacity: usize,
    buffer: Mutex<Vec<u8>>,
    publish_order: Mutex<()>,
}

impl BatchingWriter {
    #[must_use]
    pub fn new(handle: Arc<dyn PublishHandle>) -> Self {
        Self::with_capacity(handle, DEFAULT_MAX_BATCH_BYTES)
    }

    /// A zero capacity is treated as one byte so every write still makes progress.
    #[must_use]
    pub fn with_capacity(handle: Arc<dyn PublishHandle>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            handle,
            capacity,
            buffer: Mutex::new(Vec::new()),
            publish_order: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes waiting for the next publish.
    pub fn pending(&self) -> usize {
        #[allow(clippy::expect_used)]
        let buffer = self.buffer.lock().expect("lock poisoned");
        buffer.len()
    }

    /// Accepts `payload` in full and returns its length.
    ///
    /// Returns an error only when a publish triggered by this write fails. The
    /// bytes that were being published are dropped in that case and `payload`
    /// is not buffered.
    pub fn write(&self, payload: &[u8]) -> Result<usize, BusError> {
        if payload.len() > self.capacity {
            #[allow(clippy::expect_used)]
            let _order = self.publish_order.lock().expect("lock poisoned");
            self.publish_pending()?;
            debug!(
                "Publishing oversized payload of {} bytes directly",
                payload.len()
            );
            self.handle.publish(payload.to_vec())?;
            return Ok(payload.len());
        }

        loop {
            if self.try_append(payload) {
                return Ok(payload.len());
            }
            #[allow(clippy::expect_used)]
            let _order = self.publish_order.lock().expect("lock poisoned");
            // Another writer may have flushed while we waited for the order lock.
            if self.try_append(payload) {
                return Ok(payload.len());
            }
            self.publish_pending()?;
        }
    }

    /// Publishes buffered bytes, if any. An empty buffer publishes nothing.
    pub fn sync(&self) -> Result<(), BusError> {
        #[allow(clippy::expect_used)]
        let _order = self.publish_order.lock().expect("lock poisoned");
        self.publish_pending()
    }

    fn try_append(&self, payload: &[u8]) -> bool {
        #[allow(clippy::expect_used)]
        let mut buffer = self.buffer.lock().expect("lock poisoned");
        if buffer.len() + payload.len() > self.capacity {
            return false;
        }
        buffer.extend_from_slice(payload);
        true
    }

    // Callers hold `publish_order`.
    fn publish_pending(&self) -> Result<(), BusError> {
        let batch = {
            #[allow(clippy::expect_used)]
            let mut buffer = self.buffer.lock().expect("lock poisoned");
            if buffer.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };
        let len = batch.len();
        self.handle.publish(batch).inspect_err(|e| {
            error!("Dropping {len} buffered bytes after failed publish: {e}");
        })
    }
}

impl Drop for BatchingWriter {
    fn drop(&mut self) {
        if let Ok(buffer) = self.buffer.get_mut() {
            if !buffer.is_empty() {
                debug!(
                    "Batching writer dropped with {} unpublished bytes",
                    buffer.len()
                );
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::thread;

    #[derive(Default)]
    pub(crate) struct RecordingHandle {
        pub(crate) published: Mutex<Vec<Vec<u8>>>,
        pub(crate) fail: bool,
    }

    impl RecordingHandle {
        pub(crate) fn calls(&self) -> Vec<Vec<u8>> {
            self.published.lock().unwrap().clone()
        }
    }

    impl PublishHandle for RecordingHandle {
        fn topic(&self) -> &str {
            "test.topic"
        }

        fn publish(&self, payload: Vec<u8>) -> Result<(), BusError> {
            if payload.is_empty() {
                return Ok(());
            }
            if self.fail {
                return Err(BusError::Publish {
                    topic: "test.topic".to_string(),
                    len: payload.len(),
                    reason: "injected".to_string(),
                });
            }
            self.published.lock().unwrap().push(payload);
            Ok(())
        }
    }

    fn writer(capacity: usize) -> (Arc<RecordingHandle>, BatchingWriter) {
        let handle = Arc::new(RecordingHandle::default());
        let writer = BatchingWriter::with_capacity(handle.clone(), capacity);
        (handle, writer)
    }

    #[test]
    fn test_basic_write_waits_for_sync() {
        let handle = Arc::new(RecordingHandle::default());
        let writer = BatchingWriter::new(handle.clone());

        assert_eq!(writer.write(b"Hello world").unwrap(), 11);
        assert!(handle.calls().is_empty(), "Nothing should be published yet");

        writer.sync().unwrap();
        assert_eq!(handle.calls(), vec![b"Hello world".to_vec()]);
    }

    #[test]
    fn test_sync_twice_publishes_once() {
        let (handle, writer) = writer(64);
        writer.write(b"abc").unwrap();
        writer.sync().unwrap();
        writer.sync().unwrap();
        assert_eq!(handle.calls().len(), 1);
    }

    #[test]
    fn test_sync_on_empty_buffer_is_noop() {
        let (handle, writer) = writer(64);
        writer.sync().unwrap();
        assert!(handle.calls().is_empty());
    }

    #[test]
    fn test_oversized_payload_flushes_then_bypasses_buffer() {
        let (handle, writer) = writer(8);
        writer.write(b"abc").unwrap();
        writer.write(b"0123456789").unwrap();

        assert_eq!(
            handle.calls(),
            vec![b"abc".to_vec(), b"0123456789".to_vec()]
        );
        assert_eq!(writer.pending(), 0);
    }

    #[test]
    fn test_oversized_payload_on_empty_buffer_is_single_publish() {
        let (handle, writer) = writer(4);
        writer.write(b"too large").unwrap();
        assert_eq!(handle.calls(), vec![b"too large".to_vec()]);
    }

    #[test]
    fn test_overflowing_write_flushes_then_buffers() {
        let (handle, writer) = writer(8);
        writer.write(b"12345").unwrap();
        writer.write(b"6789").unwrap();

        assert_eq!(handle.calls(), vec![b"12345".to_vec()]);
        assert_eq!(writer.pending(), 4);

        writer.sync().unwrap();
        assert_eq!(handle.calls(), vec![b"12345".to_vec(), b"6789".to_vec()]);
    }

    #[test]
    fn test_exact_fit_does_not_flush() {
        let (handle, writer) = writer(8);
        writer.write(b"1234").unwrap();
        writer.write(b"5678").unwrap();
        assert!(handle.calls().is_empty());
        assert_eq!(writer.pending(), 8);
    }

    #[test]
    fn test_publishes_preserve_write_order() {
        let (handle, writer) = writer(10);
        let writes: Vec<&[u8]> = vec![
            b"aaaa", b"bbb", b"cccccc", b"ddddddddddddd", b"e", b"ffffffffff", b"gg",
        ];
        for w in &writes {
            writer.write(w).unwrap();
        }
        writer.sync().unwrap();

        let published: Vec<u8> = handle.calls().concat();
        let written: Vec<u8> = writes.concat();
        assert_eq!(published, written);
        assert!(handle.calls().iter().all(|c| !c.is_empty()));
    }

    #[test]
    fn test_direct_publish_failure_propagates() {
        let handle = Arc::new(RecordingHandle {
            fail: true,
            ..Default::default()
        });
        let writer = BatchingWriter::with_capacity(handle, 4);
        let err = writer.write(b"oversized").unwrap_err();
        assert!(matches!(err, BusError::Publish { len: 9, .. }));
    }

    #[test]
    fn test_concurrent_writers_lose_nothing() {
        let (handle, writer) = writer(64);
        let writer = Arc::new(writer);

        let threads: Vec<_> = (0..4u8)
            .map(|t| {
                let writer = Arc::clone(&writer);
                thread::spawn(move || {
                    for _ in 0..250 {
                        writer.write(&[t; 7]).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        writer.sync().unwrap();

        let published: Vec<u8> = handle.calls().concat();
        assert_eq!(published.len(), 4 * 250 * 7);
        for t in 0..4u8 {
            assert_eq!(published.iter().filter(|b| **b == t).count(), 250 * 7);
        }
        assert!(handle.calls().iter().all(|c| c.len() <= 64));
    }
}
