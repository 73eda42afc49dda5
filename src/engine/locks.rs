//! Per-queue claim locks.
//!
//! One fair (FIFO) async mutex per queue, created on first use. Entries are
//! evicted when their queue is deleted, and idle entries are pruned once
//! the table grows past its capacity. An entry is idle when the table holds
//! the only reference to it, i.e. nobody owns or awaits the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

use crate::model::QueueId;

pub struct QueueLocks {
    table: Mutex<HashMap<QueueId, Arc<tokio::sync::Mutex<()>>>>,
    capacity: usize,
}

impl QueueLocks {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Wait for exclusive claim rights on `queue`. Released on drop.
    pub async fn acquire(&self, queue: QueueId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            if table.len() >= self.capacity && !table.contains_key(&queue) {
                table.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(table.entry(queue).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the entry for a deleted queue.
    pub fn evict(&self, queue: QueueId) {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&queue);
    }

    pub fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
