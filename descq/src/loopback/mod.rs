use std::collections::VecDeque;

use crate::errors::{QueueError, Result};
use crate::queue::{control, Backend, Queue};
use crate::region::{Buffer, RegionPool};

pub const DEFAULT_CAPACITY: usize = 64;

/// In-process queue: whatever is enqueued comes back out of the same handle.
pub struct LoopbackQueue {
    entries: VecDeque<Buffer>,
    capacity: usize,
}

impl LoopbackQueue {
    pub fn create() -> Queue<LoopbackQueue> {
        LoopbackQueue::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Queue<LoopbackQueue> {
        Queue::new(LoopbackQueue {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Backend for LoopbackQueue {
    fn control(&mut self, request: u64, _value: u64) -> Result<u64> {
        match request {
            control::QUERY_CAPACITY => Ok(self.capacity as u64),
            control::QUERY_FREE_SLOTS => Ok((self.capacity - self.entries.len()) as u64),
            _ => Err(QueueError::UnknownFlag(request)),
        }
    }

    fn enqueue(&mut self, buf: &Buffer) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(QueueError::QueueFull);
        }
        self.entries.push_back(*buf);
        Ok(())
    }

    fn dequeue(&mut self, _pool: &mut RegionPool) -> Result<Buffer> {
        self.entries.pop_front().ok_or(QueueError::QueueEmpty)
    }

    fn destroy(&mut self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}
