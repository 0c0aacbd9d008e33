//! Bounded priority queue feeding one worker pool
//!
//! Higher priorities pre-empt lower at admission; within a priority the
//! queue is FIFO (submission sequence breaks ties). Admission blocks while
//! the queue is full; workers block while it is empty. Both directions use
//! stored-permit notifications so wakeups cannot be lost between the lock
//! release and the await.

use std::collections::BinaryHeap;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::cancel::CancelToken;

use super::unit::{Priority, WorkUnit};

struct QueuedUnit {
    priority: Priority,
    seq: u64,
    unit: WorkUnit,
}

impl Eq for QueuedUnit {}

impl PartialEq for QueuedUnit {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Ord for QueuedUnit {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher priority first, then earlier submission
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedUnit {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueInner {
    heap: BinaryHeap<QueuedUnit>,
    next_seq: u64,
    closed: bool,
}

/// Result of a push attempt
#[derive(Debug, PartialEq, Eq)]
pub enum PushError {
    Closed,
    Cancelled,
}

pub struct ProviderQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    items: Notify,
    space: Notify,
}

impl ProviderQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            items: Notify::new(),
            space: Notify::new(),
        }
    }

    /// Enqueue a unit, blocking while the queue is full
    pub async fn push(&self, unit: WorkUnit, cancel: &CancelToken) -> Result<(), (PushError, WorkUnit)> {
        loop {
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                if inner.closed {
                    return Err((PushError::Closed, unit));
                }
                if inner.heap.len() < self.capacity {
                    let seq = inner.next_seq;
                    inner.next_seq += 1;
                    inner.heap.push(QueuedUnit {
                        priority: unit.priority,
                        seq,
                        unit,
                    });
                    self.items.notify_one();
                    return Ok(());
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err((PushError::Cancelled, unit)),
                _ = self.space.notified() => {}
            }
            // Loop and recheck; another producer may have taken the slot
        }
    }

    /// Dequeue the highest-priority unit. Returns `None` once the queue is
    /// closed and empty.
    pub async fn pop(&self) -> Option<WorkUnit> {
        loop {
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                if let Some(queued) = inner.heap.pop() {
                    self.space.notify_one();
                    return Some(queued.unit);
                }
                if inner.closed {
                    return None;
                }
            }

            self.items.notified().await;
        }
    }

    /// Take one unit without waiting (pool teardown)
    pub fn try_pop(&self) -> Option<WorkUnit> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let popped = inner.heap.pop().map(|q| q.unit);
        if popped.is_some() {
            self.space.notify_one();
        }
        popped
    }

    /// Remove all queued units belonging to a job
    pub fn drain_job(&self, job_id: &str) -> Vec<WorkUnit> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let heap = std::mem::take(&mut inner.heap);
        let (drained, kept): (Vec<_>, Vec<_>) = heap.into_iter().partition(|q| q.unit.job_id == job_id);
        inner.heap = kept.into_iter().collect();
        drop(inner);

        if !drained.is_empty() {
            // Freed slots may unblock producers
            self.space.notify_waiters();
        }
        drained.into_iter().map(|q| q.unit).collect()
    }

    /// Close the queue: producers fail, consumers drain then get `None`
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.closed = true;
        drop(inner);
        self.items.notify_waiters();
        self.space.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
