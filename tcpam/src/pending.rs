//! Deferred send operations.
//!
//! Operations are replayed strictly in FIFO order. An operation that fails
//! again stays at the head of the queue.

use std::collections::VecDeque;

use crate::endpoint::Endpoint;
use crate::error::Result;

/// A send deferred for lack of transmit capacity.
pub trait PendingOp: Send {
    /// Retry the operation. `Ok(())` removes it from the queue.
    fn progress(&mut self, ep: &mut dyn Endpoint) -> Result<()>;
}

impl<F> PendingOp for F
where
    F: FnMut(&mut dyn Endpoint) -> Result<()> + Send,
{
    fn progress(&mut self, ep: &mut dyn Endpoint) -> Result<()> {
        self(ep)
    }
}

/// FIFO of pending operations owned by one endpoint.
#[derive(Default)]
pub struct PendingQueue {
    queue: VecDeque<Box<dyn PendingOp>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, op: Box<dyn PendingOp>) {
        self.queue.push_back(op);
    }

    pub fn push_front(&mut self, op: Box<dyn PendingOp>) {
        self.queue.push_front(op);
    }

    pub fn pop_front(&mut self) -> Option<Box<dyn PendingOp>> {
        self.queue.pop_front()
    }

    /// Hand every queued operation to `cb`, oldest first.
    pub fn purge(&mut self, cb: &mut dyn FnMut(Box<dyn PendingOp>)) -> usize {
        let count = self.queue.len();
        for op in self.queue.drain(..) {
            cb(op);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
