//! Queue engine: queue administration and the message lifecycle.
//!
//! Enqueued messages stay `InTransaction` until their transaction commits.
//! Dequeue claims the best-ranked `Active` message (highest priority value,
//! then oldest) for a transaction. When the store needs it, claims on one
//! queue are serialized through [`QueueLocks`]; other queues never wait.

use std::sync::Arc;

use chrono::Utc;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::locks::QueueLocks;
use super::transactions::{Admission, admit, settle_lapsed};
use crate::error::{Error, Result};
use crate::model::*;
use crate::store::{ClaimMode, MessageRecord, Store, StoreTx};
use crate::telemetry::metrics;

/// Message counts per state for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub active: u64,
    pub in_transaction: u64,
    pub processed: u64,
    pub expired: u64,
    pub attempts_exceeded: u64,
}

impl QueueStats {
    fn record(&mut self, state: MessageState, count: u64) {
        let slot = match state {
            MessageState::Active => &mut self.active,
            MessageState::InTransaction => &mut self.in_transaction,
            MessageState::Processed => &mut self.processed,
            MessageState::Expired => &mut self.expired,
            MessageState::AttemptsExceeded => &mut self.attempts_exceeded,
        };
        *slot += count;
    }

    pub fn total(&self) -> u64 {
        self.active + self.in_transaction + self.processed + self.expired + self.attempts_exceeded
    }
}

/// A queue reference with its name already validated.
enum Lookup {
    Id(QueueId),
    Name(QueueName),
}

impl Lookup {
    fn parse(queue: QueueRef) -> Result<Self> {
        match queue {
            QueueRef::Id(id) => Ok(Lookup::Id(id)),
            QueueRef::Name(name) => QueueName::parse(&name).map(Lookup::Name),
        }
    }

    async fn find<T: StoreTx>(&self, tx: &mut T) -> Result<Queue> {
        let found = match self {
            Lookup::Id(id) => tx.queue(*id).await?,
            Lookup::Name(name) => tx.queue_by_name(name).await?,
        };
        found.ok_or_else(|| match self {
            Lookup::Id(id) => Error::NotFound(id.to_string()),
            Lookup::Name(name) => Error::NotFound(format!("queue {:?}", name.as_str())),
        })
    }
}

pub struct QueueEngine<S: Store> {
    store: Arc<S>,
    locks: Arc<QueueLocks>,
}

impl<S: Store> Clone for QueueEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            locks: Arc::clone(&self.locks),
        }
    }
}

impl<S: Store> QueueEngine<S> {
    pub fn new(store: Arc<S>, lock_capacity: usize) -> Self {
        Self {
            store,
            locks: Arc::new(QueueLocks::new(lock_capacity)),
        }
    }

    // -----------------------------------------------------------------------
    // Queues
    // -----------------------------------------------------------------------

    /// Create a queue. Names are trimmed and compared case-insensitively.
    pub async fn create_queue(&self, name: &str) -> Result<QueueId> {
        let name = QueueName::parse(name)?;

        let mut tx = self.store.begin().await?;
        if tx.queue_by_name(&name).await?.is_some() {
            return Err(Error::AlreadyExists(format!("queue {:?}", name.as_str())));
        }
        let id = tx.insert_queue(&name).await?;
        tx.commit().await?;

        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", name.as_str().to_string()),
                KeyValue::new("operation", "create"),
            ],
        );
        info!(%id, name = name.as_str(), "queue created");
        Ok(id)
    }

    /// Delete a queue and every message in it. Returns how many messages
    /// were removed.
    ///
    /// Transactions holding messages of the deleted queue are left alone;
    /// they commit or expire with whatever they still own.
    pub async fn delete_queue(&self, queue: impl Into<QueueRef>) -> Result<u64> {
        let lookup = Lookup::parse(queue.into())?;

        let mut tx = self.store.begin().await?;
        let found = lookup.find(&mut tx).await?;
        let removed = tx
            .delete_queue(found.id)
            .await?
            .ok_or_else(|| Error::NotFound(found.id.to_string()))?;
        tx.commit().await?;

        self.locks.evict(found.id);
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", found.name.clone()),
                KeyValue::new("operation", "delete"),
            ],
        );
        info!(id = %found.id, name = %found.name, removed, "queue deleted");
        Ok(removed)
    }

    pub async fn queue_info(&self, queue: impl Into<QueueRef>) -> Result<Queue> {
        let lookup = Lookup::parse(queue.into())?;

        let mut tx = self.store.begin().await?;
        let found = lookup.find(&mut tx).await?;
        tx.commit().await?;
        Ok(found)
    }

    pub async fn list_queues(&self) -> Result<Vec<Queue>> {
        let mut tx = self.store.begin().await?;
        let queues = tx.list_queues().await?;
        tx.commit().await?;
        Ok(queues)
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Add a message under `owner`. It stays invisible to dequeue until
    /// `owner` commits, and disappears if `owner` rolls back or expires.
    pub async fn enqueue(
        &self,
        owner: TransactionId,
        queue: QueueId,
        new: NewMessage,
    ) -> Result<MessageId> {
        new.validate()?;
        let now = Utc::now();
        let expiry_time = new
            .expires_in
            .map(|ttl| {
                now.checked_add_signed(ttl).ok_or_else(|| {
                    Error::InvalidArgument("message expiry is out of range".to_string())
                })
            })
            .transpose()?;

        let mut tx = self.store.begin().await?;
        if let Admission::Lapsed(unwound) = admit(&mut tx, owner, now).await? {
            return Err(settle_lapsed(tx, owner, unwound).await);
        }
        if tx.queue(queue).await?.is_none() {
            return Err(Error::NotFound(queue.to_string()));
        }
        let id = tx
            .insert_message(&MessageRecord {
                queue_id: queue,
                transaction_id: owner,
                add_time: now,
                priority: new.priority,
                max_attempts: new.max_attempts,
                expiry_time,
                correlation_id: new.correlation_id,
                group_name: new.group_name,
                metadata: new.metadata,
                payload: new.payload,
            })
            .await?;
        tx.commit().await?;

        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", queue.0.to_string()),
                KeyValue::new("operation", "enqueue"),
            ],
        );
        debug!(%id, %queue, %owner, priority = new.priority, "message enqueued");
        Ok(id)
    }

    /// Claim the next message on `queue` for `owner`. `None` when nothing is
    /// eligible.
    pub async fn dequeue(&self, owner: TransactionId, queue: QueueId) -> Result<Option<Message>> {
        // Held across select, claim and commit; released on every return.
        let _claim_guard = match self.store.claim_mode() {
            ClaimMode::Serialized => Some(self.locks.acquire(queue).await),
            ClaimMode::SkipLocked => None,
        };
        let now = Utc::now();

        let mut tx = self.store.begin().await?;
        if let Admission::Lapsed(unwound) = admit(&mut tx, owner, now).await? {
            return Err(settle_lapsed(tx, owner, unwound).await);
        }
        if tx.queue(queue).await?.is_none() {
            return Err(Error::NotFound(queue.to_string()));
        }
        let claimed = tx.claim_message(queue, owner, now).await?;
        tx.commit().await?;

        let operation = if claimed.is_some() {
            "dequeue"
        } else {
            "dequeue_empty"
        };
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", queue.0.to_string()),
                KeyValue::new("operation", operation),
            ],
        );
        if let Some(ref message) = claimed {
            debug!(id = %message.id, %queue, %owner, attempts = message.attempts, "message claimed");
        }
        Ok(claimed)
    }

    /// The message a dequeue on `queue` would return now, left untouched.
    pub async fn peek(&self, queue: QueueId) -> Result<Option<Message>> {
        let mut tx = self.store.begin().await?;
        if tx.queue(queue).await?.is_none() {
            return Err(Error::NotFound(queue.to_string()));
        }
        let message = tx.peek_message(queue, Utc::now()).await?;
        tx.commit().await?;
        Ok(message)
    }

    pub async fn peek_by_id(&self, id: MessageId) -> Result<Message> {
        let mut tx = self.store.begin().await?;
        let message = tx.message(id).await?;
        tx.commit().await?;
        message.ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Count messages on `queue`, optionally only those in `state`.
    pub async fn count(&self, queue: QueueId, state: Option<MessageState>) -> Result<u64> {
        let mut tx = self.store.begin().await?;
        if tx.queue(queue).await?.is_none() {
            return Err(Error::NotFound(queue.to_string()));
        }
        let count = tx.count_messages(queue, state).await?;
        tx.commit().await?;
        Ok(count)
    }

    pub async fn stats(&self, queue: impl Into<QueueRef>) -> Result<QueueStats> {
        let lookup = Lookup::parse(queue.into())?;

        let mut tx = self.store.begin().await?;
        let found = lookup.find(&mut tx).await?;
        let rows = tx.message_stats(found.id).await?;
        tx.commit().await?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            stats.record(state, count);
        }
        Ok(stats)
    }

    /// Number of per-queue claim locks currently tracked.
    pub fn tracked_locks(&self) -> usize {
        self.locks.len()
    }
}
