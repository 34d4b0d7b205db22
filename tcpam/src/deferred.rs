//! Slow-path work handed to the owning thread.
//!
//! Producers may live on any thread; the owner drains the queue from its
//! progress loop so callbacks never run re-entrantly inside event dispatch.

use std::sync::Arc;

use crossbeam_queue::SegQueue;

/// Cloneable multi-producer queue drained by one consumer.
pub struct DeferredQueue<T> {
    inner: Arc<SegQueue<T>>,
}

impl<T> DeferredQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SegQueue::new()),
        }
    }

    pub fn push(&self, item: T) {
        self.inner.push(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T> Clone for DeferredQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for DeferredQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
