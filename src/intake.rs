//! Task intake — multi-producer, single-consumer submission queue
//!
//! Any thread pushes, only the loop thread pops. Order is FIFO per queue,
//! which gives submissions from one thread their program order and makes the
//! loop's accept order the global order.
//!
//! Author: Moroya Sakamoto

use crossbeam_queue::{ArrayQueue, SegQueue};

/// Submission queue feeding a loop
pub trait Intake<M>: Send + Sync {
    /// Enqueue; hands the item back if the queue is full
    fn push(&self, item: M) -> Result<(), M>;

    /// Dequeue (consumer side)
    fn pop(&self) -> Option<M>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unbounded lock-free queue; never rejects
pub struct UnboundedIntake<M> {
    queue: SegQueue<M>,
}

impl<M> UnboundedIntake<M> {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }
}

impl<M> Default for UnboundedIntake<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Send> Intake<M> for UnboundedIntake<M> {
    fn push(&self, item: M) -> Result<(), M> {
        self.queue.push(item);
        Ok(())
    }

    fn pop(&self) -> Option<M> {
        self.queue.pop()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Fixed-capacity ring; rejects when full
pub struct BoundedIntake<M> {
    queue: ArrayQueue<M>,
}

impl<M> BoundedIntake<M> {
    /// `capacity` must be non-zero
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }
}

impl<M: Send> Intake<M> for BoundedIntake<M> {
    fn push(&self, item: M) -> Result<(), M> {
        self.queue.push(item)
    }

    fn pop(&self) -> Option<M> {
        self.queue.pop()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}
