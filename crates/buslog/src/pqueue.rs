// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persistent min-priority queue.
//!
//! A leftist heap whose nodes are shared through `Arc`. Every operation
//! returns a new heap and leaves its inputs untouched, so a decoded batch can
//! be handed across a channel and melded into the frontier without copying or
//! locking.

use std::sync::Arc;

struct Node<T> {
    /// Length of the right spine; never larger on the right than on the left.
    rank: usize,
    size: usize,
    item: T,
    left: Option<Arc<Node<T>>>,
    right: Option<Arc<Node<T>>>,
}

type Link<T> = Option<Arc<Node<T>>>;

impl<T> Drop for Node<T> {
    fn drop(&mut self) {
        // Unlink uniquely owned descendants one by one so long spines are torn
        // down without recursion.
        let mut stack: Vec<Arc<Node<T>>> = Vec::new();
        stack.extend(self.left.take());
        stack.extend(self.right.take());
        while let Some(node) = stack.pop() {
            if let Ok(mut node) = Arc::try_unwrap(node) {
                stack.extend(node.left.take());
                stack.extend(node.right.take());
            }
        }
    }
}

fn rank<T>(link: &Link<T>) -> usize {
    link.as_ref().map_or(0, |n| n.rank)
}

fn size<T>(link: &Link<T>) -> usize {
    link.as_ref().map_or(0, |n| n.size)
}

fn node<T>(item: T, a: Link<T>, b: Link<T>) -> Arc<Node<T>> {
    let (left, right) = if rank(&a) >= rank(&b) { (a, b) } else { (b, a) };
    Arc::new(Node {
        rank: rank(&right) + 1,
        size: size(&left) + size(&right) + 1,
        item,
        left,
        right,
    })
}

fn merge<T: Ord + Clone>(a: &Link<T>, b: &Link<T>) -> Link<T> {
    match (a, b) {
        (None, _) => b.clone(),
        (_, None) => a.clone(),
        (Some(x), Some(y)) => {
            let (low, high) = if x.item <= y.item { (x, b) } else { (y, a) };
            Some(node(
                low.item.clone(),
                low.left.clone(),
                merge(&low.right, high),
            ))
        }
    }
}

pub struct PersistentHeap<T> {
    root: Link<T>,
}

impl<T> Clone for PersistentHeap<T> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
        }
    }
}

impl<T> Default for PersistentHeap<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> PersistentHeap<T> {
    #[must_use]
    pub fn empty() -> Self {
        Self { root: None }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn len(&self) -> usize {
        size(&self.root)
    }

    /// Smallest item, if any.
    pub fn peek(&self) -> Option<&T> {
        self.root.as_ref().map(|n| &n.item)
    }
}

impl<T: Ord + Clone> PersistentHeap<T> {
    #[must_use]
    pub fn enqueue(&self, item: T) -> Self {
        let single = Some(node(item, None, None));
        Self {
            root: merge(&self.root, &single),
        }
    }

    /// Smallest item together with the heap of everything else.
    pub fn dequeue(&self) -> Option<(T, Self)> {
        self.root.as_ref().map(|n| {
            (
                n.item.clone(),
                Self {
                    root: merge(&n.left, &n.right),
                },
            )
        })
    }

    #[must_use]
    pub fn meld(&self, other: &Self) -> Self {
        Self {
            root: merge(&self.root, &other.root),
        }
    }
}

impl<T: Ord + Clone> FromIterator<T> for PersistentHeap<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::empty(), |heap, item| heap.enqueue(item))
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for PersistentHeap<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentHeap")
            .field("len", &self.len())
            .field("min", &self.peek())
            .finish()
    }
}
