//! The Job Queue (C7): a bounded FIFO with a single-producer-many-consumer
//! contract. Enqueue blocks (honoring cancellation) when full; dequeue
//! blocks until an item is available or the queue is shut down. Priority
//! is advisory: higher-priority items overtake lower ones, but items at
//! the same priority stay FIFO.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::types::BackgroundJob;

pub struct JobQueue {
    capacity: usize,
    items: Mutex<VecDeque<BackgroundJob>>,
    not_empty: Notify,
    not_full: Notify,
    shutdown: CancellationToken,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::new()),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Enqueues `job`, blocking while the queue is full. Returns `false` if
    /// the queue was shut down before room became available.
    pub async fn enqueue(&self, job: BackgroundJob) -> bool {
        loop {
            {
                let mut guard = self.items.lock().unwrap_or_else(|e| e.into_inner());
                if guard.len() < self.capacity {
                    insert_by_priority(&mut guard, job);
                    self.not_empty.notify_one();
                    return true;
                }
            }
            tokio::select! {
                _ = self.not_full.notified() => continue,
                _ = self.shutdown.cancelled() => return false,
            }
        }
    }

    /// Dequeues the head of the queue, blocking until an item is available
    /// or the queue shuts down (in which case `None` is returned).
    pub async fn dequeue(&self) -> Option<BackgroundJob> {
        loop {
            {
                let mut guard = self.items.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(job) = guard.pop_front() {
                    self.not_full.notify_one();
                    return Some(job);
                }
            }
            tokio::select! {
                _ = self.not_empty.notified() => continue,
                _ = self.shutdown.cancelled() => {
                    let mut guard = self.items.lock().unwrap_or_else(|e| e.into_inner());
                    return guard.pop_front();
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Inserts `job` after the last entry with priority `>= job.priority`, so
/// FIFO order is preserved within a priority level while higher-priority
/// jobs overtake lower ones already queued.
fn insert_by_priority(queue: &mut VecDeque<BackgroundJob>, job: BackgroundJob) {
    let position = queue.iter().rposition(|existing| existing.priority >= job.priority).map(|i| i + 1).unwrap_or(0);
    queue.insert(position, job);
}
