//! Storage contract.
//!
//! The engine never issues SQL itself. It opens one storage transaction per
//! logical operation and calls the named operations on [`StoreTx`]; each
//! backend is responsible for making them atomic. Every bulk update is
//! guarded by the prior state it expects, so concurrent commits, rollbacks
//! and sweeps only ever touch rows that still match.
//!
//! Dropping a [`StoreTx`] without committing rolls it back.

mod sql;

pub mod postgres;
pub mod sqlite;

pub use postgres::PgStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::*;

/// How a backend makes "select the best message and claim it" race-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimMode {
    /// The claim is two statements; callers must serialize claims per queue.
    Serialized,
    /// The claim is a single `FOR UPDATE SKIP LOCKED` statement; concurrent
    /// claimers never receive the same row.
    SkipLocked,
}

/// Counts from returning pulled messages after a rollback or expiry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Returned {
    /// Back to `Active` with one more attempt recorded.
    pub requeued: u64,
    /// Hit `max_attempts` and closed as `AttemptsExceeded`.
    pub exhausted: u64,
}

/// A message ready to insert, already stamped by the engine.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub queue_id: QueueId,
    pub transaction_id: TransactionId,
    pub add_time: DateTime<Utc>,
    pub priority: i32,
    pub max_attempts: u32,
    pub expiry_time: Option<DateTime<Utc>>,
    pub correlation_id: i64,
    pub group_name: Option<String>,
    pub metadata: String,
    pub payload: Vec<u8>,
}

/// A persistence backend.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: StoreTx;

    /// Begin a storage transaction.
    async fn begin(&self) -> Result<Self::Tx>;

    fn claim_mode(&self) -> ClaimMode;
}

/// Named operations available inside one storage transaction.
#[async_trait]
pub trait StoreTx: Send {
    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;

    // --- Queues ---

    /// Insert a queue. Fails with `AlreadyExists` if the name key is taken.
    async fn insert_queue(&mut self, name: &QueueName) -> Result<QueueId>;

    async fn queue(&mut self, id: QueueId) -> Result<Option<Queue>>;

    async fn queue_by_name(&mut self, name: &QueueName) -> Result<Option<Queue>>;

    async fn list_queues(&mut self) -> Result<Vec<Queue>>;

    /// Delete a queue and all of its messages. Returns the number of
    /// messages removed, or `None` if the queue did not exist.
    async fn delete_queue(&mut self, id: QueueId) -> Result<Option<u64>>;

    // --- Transactions ---

    async fn insert_transaction(
        &mut self,
        start_time: DateTime<Utc>,
        expiry_time: DateTime<Utc>,
    ) -> Result<TransactionId>;

    /// Plain point lookup, no row lock.
    async fn transaction(&mut self, id: TransactionId) -> Result<Option<Transaction>>;

    /// Point lookup that keeps the row stable until this storage
    /// transaction ends.
    async fn lock_transaction(&mut self, id: TransactionId) -> Result<Option<Transaction>>;

    /// Move the expiry of an `Active` transaction. Returns false if the
    /// transaction is no longer active.
    async fn set_transaction_expiry(
        &mut self,
        id: TransactionId,
        expiry_time: DateTime<Utc>,
    ) -> Result<bool>;

    /// `Active → to`, stamping `end_time` and `end_reason`. Returns false if
    /// the transaction had already left `Active`.
    async fn close_transaction(
        &mut self,
        id: TransactionId,
        to: TransactionState,
        end_time: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool>;

    /// Close every `Active` transaction whose expiry is at or before `now`.
    async fn expire_transactions(&mut self, now: DateTime<Utc>) -> Result<u64>;

    // --- Messages ---

    async fn insert_message(&mut self, record: &MessageRecord) -> Result<MessageId>;

    async fn message(&mut self, id: MessageId) -> Result<Option<Message>>;

    /// The message a dequeue would claim right now, without claiming it.
    async fn peek_message(&mut self, queue: QueueId, now: DateTime<Utc>)
    -> Result<Option<Message>>;

    /// Claim the best-ranked eligible message for `owner`.
    ///
    /// Race-free only when the caller honours [`Store::claim_mode`].
    async fn claim_message(
        &mut self,
        queue: QueueId,
        owner: TransactionId,
        now: DateTime<Utc>,
    ) -> Result<Option<Message>>;

    /// `InTransaction → to` for every message `owner` holds with `action`,
    /// clearing ownership. Terminal targets also stamp `close_time`.
    async fn transition_owned(
        &mut self,
        owner: TransactionId,
        action: TransactionAction,
        to: MessageState,
        at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Delete every message `owner` holds with `action`.
    async fn discard_owned(
        &mut self,
        owner: TransactionId,
        action: TransactionAction,
    ) -> Result<u64>;

    /// Give back everything `owner` pulled: one more attempt each, then
    /// `AttemptsExceeded` at the threshold or `Active` below it.
    async fn return_owned(&mut self, owner: TransactionId, at: DateTime<Utc>) -> Result<Returned>;

    async fn count_messages(
        &mut self,
        queue: QueueId,
        state: Option<MessageState>,
    ) -> Result<u64>;

    /// Message counts per state for one queue. States with no messages are
    /// omitted.
    async fn message_stats(&mut self, queue: QueueId) -> Result<Vec<(MessageState, u64)>>;

    // --- Reconciliation ---

    /// Delete `Add` messages still held by `Expired` transactions.
    async fn discard_orphaned_adds(&mut self) -> Result<u64>;

    /// Return `Pull` messages still held by `Expired` transactions, with
    /// the same attempt bookkeeping as [`StoreTx::return_owned`].
    async fn return_orphaned_pulls(&mut self, at: DateTime<Utc>) -> Result<Returned>;

    /// `Active → Expired` for messages whose own TTL has passed.
    async fn expire_messages(&mut self, now: DateTime<Utc>) -> Result<u64>;

    /// `Active → AttemptsExceeded` for messages with no attempts left.
    async fn close_exhausted_messages(&mut self, now: DateTime<Utc>) -> Result<u64>;
}
