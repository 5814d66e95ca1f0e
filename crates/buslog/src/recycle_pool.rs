// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Generic pool of reusable instances with checkout/checkin.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use tokio::sync::Notify;

/// How long a contended checkout waits for a wake-up before trying again.
const CONTENTION_BACKOFF: Duration = Duration::from_millis(1);

/// Outcome of a single, non-waiting pop attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Pop<T> {
    Ready(T),
    /// Someone else holds the pool and it was not empty when we looked.
    Contended,
    Empty,
}

struct Slots<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct RecyclePool<T> {
    slots: Mutex<Slots<T>>,
    len: AtomicUsize,
    released: Notify,
}

impl<T> RecyclePool<T> {
    #[must_use]
    pub fn new(items: Vec<T>) -> Self {
        let len = items.len();
        Self {
            slots: Mutex::new(Slots {
                items: items.into(),
                closed: false,
            }),
            len: AtomicUsize::new(len),
            released: Notify::new(),
        }
    }

    /// Number of instances currently in the pool. Does not take the pool lock.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn try_pop(&self) -> Pop<T> {
        let popped = match self.slots.try_lock() {
            Ok(mut slots) => self.pop_locked(&mut slots),
            Err(TryLockError::Poisoned(poisoned)) => self.pop_locked(&mut poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                return if self.is_empty() {
                    Pop::Empty
                } else {
                    Pop::Contended
                };
            }
        };
        self.released.notify_waiters();
        match popped {
            Some(item) => Pop::Ready(item),
            None => Pop::Empty,
        }
    }

    /// Pops an instance, waiting out contention. `None` means the pool is empty.
    pub async fn checkout(&self) -> Option<T> {
        loop {
            match self.try_pop() {
                Pop::Ready(item) => return Some(item),
                Pop::Empty => return None,
                Pop::Contended => {
                    let _ = tokio::time::timeout(CONTENTION_BACKOFF, self.released.notified())
                        .await;
                }
            }
        }
    }

    /// Returns an instance so it is handed out next. A closed pool hands the
    /// instance back instead.
    pub fn checkin_front(&self, item: T) -> Result<(), T> {
        self.checkin(item, true)
    }

    /// Returns an instance so it is handed out after every other member. A
    /// closed pool hands the instance back instead.
    pub fn checkin_back(&self, item: T) -> Result<(), T> {
        self.checkin(item, false)
    }

    /// Refuses every later checkin and takes out every resting instance.
    pub fn close(&self) -> Vec<T> {
        let mut slots = self.lock();
        slots.closed = true;
        let items = slots.items.drain(..).collect();
        self.len.store(0, Ordering::Release);
        items
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn checkin(&self, item: T, front: bool) -> Result<(), T> {
        {
            let mut slots = self.lock();
            if slots.closed {
                return Err(item);
            }
            if front {
                slots.items.push_front(item);
            } else {
                slots.items.push_back(item);
            }
            self.len.store(slots.items.len(), Ordering::Release);
        }
        self.released.notify_waiters();
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn pop_locked(&self, slots: &mut Slots<T>) -> Option<T> {
        let item = slots.items.pop_front();
        self.len.store(slots.items.len(), Ordering::Release);
        item
    }
}
