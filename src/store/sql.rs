//! SQL shared by the SQLite and Postgres backends.
//!
//! Both drivers accept `$n` placeholders, so the statements are written
//! once. Only the claim and the transaction row lock differ per backend;
//! everything else is generated by [`impl_store_tx!`].

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::*;

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

pub(crate) const INSERT_QUEUE: &str =
    "INSERT INTO queues (name, name_key) VALUES ($1, $2) RETURNING id";

pub(crate) const SELECT_QUEUE: &str = "SELECT id, name FROM queues WHERE id = $1";

pub(crate) const SELECT_QUEUE_BY_KEY: &str = "SELECT id, name FROM queues WHERE name_key = $1";

pub(crate) const LIST_QUEUES: &str = "SELECT id, name FROM queues ORDER BY id ASC";

pub(crate) const DELETE_QUEUE_MESSAGES: &str = "DELETE FROM messages WHERE queue_id = $1";

pub(crate) const DELETE_QUEUE: &str = "DELETE FROM queues WHERE id = $1";

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

pub(crate) const INSERT_TRANSACTION: &str = "INSERT INTO transactions (state, start_time, expiry_time)
     VALUES ('active', $1, $2) RETURNING id";

pub(crate) const SELECT_TRANSACTION: &str =
    "SELECT id, state, start_time, expiry_time, end_time, end_reason FROM transactions WHERE id = $1";

pub(crate) const EXTEND_TRANSACTION: &str =
    "UPDATE transactions SET expiry_time = $2 WHERE id = $1 AND state = 'active'";

pub(crate) const CLOSE_TRANSACTION: &str = "UPDATE transactions SET state = $2, end_time = $3, end_reason = $4
     WHERE id = $1 AND state = 'active'";

pub(crate) const EXPIRE_TRANSACTIONS: &str = "UPDATE transactions SET state = 'expired', end_time = $1, end_reason = 'Expired'
     WHERE state = 'active' AND expiry_time <= $1";

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

pub(crate) const INSERT_MESSAGE: &str = "INSERT INTO messages (
        queue_id, transaction_id, transaction_action, state, add_time,
        priority, max_attempts, attempts, expiry_time, correlation_id,
        group_name, metadata, payload
    ) VALUES ($1, $2, 'add', 'in_transaction', $3, $4, $5, 0, $6, $7, $8, $9, $10)
    RETURNING id";

pub(crate) const SELECT_MESSAGE: &str = "SELECT id, queue_id, transaction_id, transaction_action, state, add_time, close_time,
            priority, max_attempts, attempts, expiry_time, correlation_id, group_name,
            metadata, payload
     FROM messages WHERE id = $1";

/// Best-ranked eligible message: highest priority value first, then oldest.
pub(crate) const PEEK_MESSAGE: &str = "SELECT id, queue_id, transaction_id, transaction_action, state, add_time, close_time,
            priority, max_attempts, attempts, expiry_time, correlation_id, group_name,
            metadata, payload
     FROM messages
     WHERE queue_id = $1 AND state = 'active' AND attempts < max_attempts
       AND (expiry_time IS NULL OR expiry_time > $2)
     ORDER BY priority DESC, add_time ASC, id ASC
     LIMIT 1";

pub(crate) const TRANSITION_OWNED: &str = "UPDATE messages
     SET state = $3, close_time = $4, transaction_id = NULL, transaction_action = NULL
     WHERE transaction_id = $1 AND transaction_action = $2 AND state = 'in_transaction'";

pub(crate) const DISCARD_OWNED: &str = "DELETE FROM messages
     WHERE transaction_id = $1 AND transaction_action = $2 AND state = 'in_transaction'";

pub(crate) const EXHAUST_OWNED_PULLS: &str = "UPDATE messages
     SET attempts = attempts + 1, state = 'attempts_exceeded', close_time = $2,
         transaction_id = NULL, transaction_action = NULL
     WHERE transaction_id = $1 AND transaction_action = 'pull' AND state = 'in_transaction'
       AND attempts + 1 >= max_attempts";

pub(crate) const REQUEUE_OWNED_PULLS: &str = "UPDATE messages
     SET attempts = attempts + 1, state = 'active', transaction_id = NULL, transaction_action = NULL
     WHERE transaction_id = $1 AND transaction_action = 'pull' AND state = 'in_transaction'";

pub(crate) const COUNT_MESSAGES: &str = "SELECT COUNT(*) FROM messages WHERE queue_id = $1";

pub(crate) const COUNT_MESSAGES_IN_STATE: &str =
    "SELECT COUNT(*) FROM messages WHERE queue_id = $1 AND state = $2";

pub(crate) const MESSAGE_STATS: &str =
    "SELECT state, COUNT(*) FROM messages WHERE queue_id = $1 GROUP BY state";

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

pub(crate) const DISCARD_ORPHANED_ADDS: &str = "DELETE FROM messages
     WHERE state = 'in_transaction' AND transaction_action = 'add'
       AND transaction_id IN (SELECT id FROM transactions WHERE state = 'expired')";

pub(crate) const EXHAUST_ORPHANED_PULLS: &str = "UPDATE messages
     SET attempts = attempts + 1, state = 'attempts_exceeded', close_time = $1,
         transaction_id = NULL, transaction_action = NULL
     WHERE state = 'in_transaction' AND transaction_action = 'pull'
       AND attempts + 1 >= max_attempts
       AND transaction_id IN (SELECT id FROM transactions WHERE state = 'expired')";

pub(crate) const REQUEUE_ORPHANED_PULLS: &str = "UPDATE messages
     SET attempts = attempts + 1, state = 'active', transaction_id = NULL, transaction_action = NULL
     WHERE state = 'in_transaction' AND transaction_action = 'pull'
       AND transaction_id IN (SELECT id FROM transactions WHERE state = 'expired')";

pub(crate) const EXPIRE_MESSAGES: &str = "UPDATE messages SET state = 'expired', close_time = $1
     WHERE state = 'active' AND expiry_time IS NOT NULL AND expiry_time <= $1";

pub(crate) const CLOSE_EXHAUSTED_MESSAGES: &str =
    "UPDATE messages SET state = 'attempts_exceeded', close_time = $1
     WHERE state = 'active' AND attempts >= max_attempts";

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
pub(crate) struct QueueRow {
    id: i64,
    name: String,
}

impl From<QueueRow> for Queue {
    fn from(row: QueueRow) -> Self {
        Queue {
            id: row.id.into(),
            name: row.name,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct TransactionRow {
    id: i64,
    state: String,
    start_time: DateTime<Utc>,
    expiry_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    end_reason: Option<String>,
}

impl TransactionRow {
    pub(crate) fn try_into_transaction(self) -> Result<Transaction> {
        Ok(Transaction {
            id: self.id.into(),
            state: self.state.parse()?,
            start_time: self.start_time,
            expiry_time: self.expiry_time,
            end_time: self.end_time,
            end_reason: self.end_reason,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct MessageRow {
    id: i64,
    queue_id: i64,
    transaction_id: Option<i64>,
    transaction_action: Option<String>,
    state: String,
    add_time: DateTime<Utc>,
    close_time: Option<DateTime<Utc>>,
    priority: i32,
    max_attempts: i32,
    attempts: i32,
    expiry_time: Option<DateTime<Utc>>,
    correlation_id: i64,
    group_name: Option<String>,
    metadata: String,
    payload: Vec<u8>,
}

impl MessageRow {
    pub(crate) fn try_into_message(self) -> Result<Message> {
        Ok(Message {
            id: self.id.into(),
            queue_id: self.queue_id.into(),
            transaction_id: self.transaction_id.map(TransactionId::from),
            transaction_action: self
                .transaction_action
                .map(|action| action.parse())
                .transpose()?,
            state: self.state.parse()?,
            add_time: self.add_time,
            close_time: self.close_time,
            priority: self.priority,
            max_attempts: self.max_attempts.max(0) as u32,
            attempts: self.attempts.max(0) as u32,
            expiry_time: self.expiry_time,
            correlation_id: self.correlation_id,
            group_name: self.group_name,
            metadata: self.metadata,
            payload: self.payload,
        })
    }
}

/// Storage form of a retry budget. Budgets past `i32::MAX` are clamped.
pub(crate) fn attempts_column(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

pub(crate) fn close_time_for(to: MessageState, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    to.is_terminal().then_some(at)
}

/// Generates the backend-independent part of `StoreTx` for a struct with a
/// `tx: sqlx::Transaction<'static, DB>` field. The backend supplies two
/// inherent methods: `lock_row` and `claim_next`.
macro_rules! impl_store_tx {
    ($tx_type:ty) => {
        #[::async_trait::async_trait]
        impl $crate::store::StoreTx for $tx_type {
            async fn commit(self) -> $crate::error::Result<()> {
                self.tx.commit().await?;
                Ok(())
            }

            async fn rollback(self) -> $crate::error::Result<()> {
                self.tx.rollback().await?;
                Ok(())
            }

            async fn insert_queue(
                &mut self,
                name: &$crate::model::QueueName,
            ) -> $crate::error::Result<$crate::model::QueueId> {
                let inserted = sqlx::query_scalar::<_, i64>($crate::store::sql::INSERT_QUEUE)
                    .bind(name.as_str())
                    .bind(name.key())
                    .fetch_one(&mut *self.tx)
                    .await;
                match inserted {
                    Ok(id) => Ok(id.into()),
                    Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                        $crate::error::Error::AlreadyExists(format!("queue {:?}", name.as_str())),
                    ),
                    Err(e) => Err(e.into()),
                }
            }

            async fn queue(
                &mut self,
                id: $crate::model::QueueId,
            ) -> $crate::error::Result<Option<$crate::model::Queue>> {
                let row: Option<$crate::store::sql::QueueRow> =
                    sqlx::query_as($crate::store::sql::SELECT_QUEUE)
                        .bind(i64::from(id))
                        .fetch_optional(&mut *self.tx)
                        .await?;
                Ok(row.map(Into::into))
            }

            async fn queue_by_name(
                &mut self,
                name: &$crate::model::QueueName,
            ) -> $crate::error::Result<Option<$crate::model::Queue>> {
                let row: Option<$crate::store::sql::QueueRow> =
                    sqlx::query_as($crate::store::sql::SELECT_QUEUE_BY_KEY)
                        .bind(name.key())
                        .fetch_optional(&mut *self.tx)
                        .await?;
                Ok(row.map(Into::into))
            }

            async fn list_queues(
                &mut self,
            ) -> $crate::error::Result<Vec<$crate::model::Queue>> {
                let rows: Vec<$crate::store::sql::QueueRow> =
                    sqlx::query_as($crate::store::sql::LIST_QUEUES)
                        .fetch_all(&mut *self.tx)
                        .await?;
                Ok(rows.into_iter().map(Into::into).collect())
            }

            async fn delete_queue(
                &mut self,
                id: $crate::model::QueueId,
            ) -> $crate::error::Result<Option<u64>> {
                let removed = sqlx::query($crate::store::sql::DELETE_QUEUE_MESSAGES)
                    .bind(i64::from(id))
                    .execute(&mut *self.tx)
                    .await?
                    .rows_affected();
                let deleted = sqlx::query($crate::store::sql::DELETE_QUEUE)
                    .bind(i64::from(id))
                    .execute(&mut *self.tx)
                    .await?
                    .rows_affected();
                Ok((deleted > 0).then_some(removed))
            }

            async fn insert_transaction(
                &mut self,
                start_time: chrono::DateTime<chrono::Utc>,
                expiry_time: chrono::DateTime<chrono::Utc>,
            ) -> $crate::error::Result<$crate::model::TransactionId> {
                let id: i64 = sqlx::query_scalar($crate::store::sql::INSERT_TRANSACTION)
                    .bind(start_time)
                    .bind(expiry_time)
                    .fetch_one(&mut *self.tx)
                    .await?;
                Ok(id.into())
            }

            async fn transaction(
                &mut self,
                id: $crate::model::TransactionId,
            ) -> $crate::error::Result<Option<$crate::model::Transaction>> {
                let row: Option<$crate::store::sql::TransactionRow> =
                    sqlx::query_as($crate::store::sql::SELECT_TRANSACTION)
                        .bind(i64::from(id))
                        .fetch_optional(&mut *self.tx)
                        .await?;
                row.map($crate::store::sql::TransactionRow::try_into_transaction)
                    .transpose()
            }

            async fn lock_transaction(
                &mut self,
                id: $crate::model::TransactionId,
            ) -> $crate::error::Result<Option<$crate::model::Transaction>> {
                self.lock_row(id).await
            }

            async fn set_transaction_expiry(
                &mut self,
                id: $crate::model::TransactionId,
                expiry_time: chrono::DateTime<chrono::Utc>,
            ) -> $crate::error::Result<bool> {
                let rows = sqlx::query($crate::store::sql::EXTEND_TRANSACTION)
                    .bind(i64::from(id))
                    .bind(expiry_time)
                    .execute(&mut *self.tx)
                    .await?
                    .rows_affected();
                Ok(rows > 0)
            }

            async fn close_transaction(
                &mut self,
                id: $crate::model::TransactionId,
                to: $crate::model::TransactionState,
                end_time: chrono::DateTime<chrono::Utc>,
                reason: &str,
            ) -> $crate::error::Result<bool> {
                let rows = sqlx::query($crate::store::sql::CLOSE_TRANSACTION)
                    .bind(i64::from(id))
                    .bind(to.as_str())
                    .bind(end_time)
                    .bind(reason)
                    .execute(&mut *self.tx)
                    .await?
                    .rows_affected();
                Ok(rows > 0)
            }

            async fn expire_transactions(
                &mut self,
                now: chrono::DateTime<chrono::Utc>,
            ) -> $crate::error::Result<u64> {
                let rows = sqlx::query($crate::store::sql::EXPIRE_TRANSACTIONS)
                    .bind(now)
                    .execute(&mut *self.tx)
                    .await?
                    .rows_affected();
                Ok(rows)
            }

            async fn insert_message(
                &mut self,
                record: &$crate::store::MessageRecord,
            ) -> $crate::error::Result<$crate::model::MessageId> {
                let id: i64 = sqlx::query_scalar($crate::store::sql::INSERT_MESSAGE)
                    .bind(i64::from(record.queue_id))
                    .bind(i64::from(record.transaction_id))
                    .bind(record.add_time)
                    .bind(record.priority)
                    .bind($crate::store::sql::attempts_column(record.max_attempts))
                    .bind(record.expiry_time)
                    .bind(record.correlation_id)
                    .bind(record.group_name.as_deref())
                    .bind(record.metadata.as_str())
                    .bind(record.payload.as_slice())
                    .fetch_one(&mut *self.tx)
                    .await?;
                Ok(id.into())
            }

            async fn message(
                &mut self,
                id: $crate::model::MessageId,
            ) -> $crate::error::Result<Option<$crate::model::Message>> {
                let row: Option<$crate::store::sql::MessageRow> =
                    sqlx::query_as($crate::store::sql::SELECT_MESSAGE)
                        .bind(i64::from(id))
                        .fetch_optional(&mut *self.tx)
                        .await?;
                row.map(|r| r.try_into_message()).transpose()
            }

            async fn peek_message(
                &mut self,
                queue: $crate::model::QueueId,
                now: chrono::DateTime<chrono::Utc>,
            ) -> $crate::error::Result<Option<$crate::model::Message>> {
                let row: Option<$crate::store::sql::MessageRow> =
                    sqlx::query_as($crate::store::sql::PEEK_MESSAGE)
                        .bind(i64::from(queue))
                        .bind(now)
                        .fetch_optional(&mut *self.tx)
                        .await?;
                row.map(|r| r.try_into_message()).transpose()
            }

            async fn claim_message(
                &mut self,
                queue: $crate::model::QueueId,
                owner: $crate::model::TransactionId,
                now: chrono::DateTime<chrono::Utc>,
            ) -> $crate::error::Result<Option<$crate::model::Message>> {
                self.claim_next(queue, owner, now).await
            }

            async fn transition_owned(
                &mut self,
                owner: $crate::model::TransactionId,
                action: $crate::model::TransactionAction,
                to: $crate::model::MessageState,
                at: chrono::DateTime<chrono::Utc>,
            ) -> $crate::error::Result<u64> {
                let rows = sqlx::query($crate::store::sql::TRANSITION_OWNED)
                    .bind(i64::from(owner))
                    .bind(action.as_str())
                    .bind(to.as_str())
                    .bind($crate::store::sql::close_time_for(to, at))
                    .execute(&mut *self.tx)
                    .await?
                    .rows_affected();
                Ok(rows)
            }

            async fn discard_owned(
                &mut self,
                owner: $crate::model::TransactionId,
                action: $crate::model::TransactionAction,
            ) -> $crate::error::Result<u64> {
                let rows = sqlx::query($crate::store::sql::DISCARD_OWNED)
                    .bind(i64::from(owner))
                    .bind(action.as_str())
                    .execute(&mut *self.tx)
                    .await?
                    .rows_affected();
                Ok(rows)
            }

            async fn return_owned(
                &mut self,
                owner: $crate::model::TransactionId,
                at: chrono::DateTime<chrono::Utc>,
            ) -> $crate::error::Result<$crate::store::Returned> {
                // Exhausted rows first, so the requeue below only sees the rest.
                let exhausted = sqlx::query($crate::store::sql::EXHAUST_OWNED_PULLS)
                    .bind(i64::from(owner))
                    .bind(at)
                    .execute(&mut *self.tx)
                    .await?
                    .rows_affected();
                let requeued = sqlx::query($crate::store::sql::REQUEUE_OWNED_PULLS)
                    .bind(i64::from(owner))
                    .execute(&mut *self.tx)
                    .await?
                    .rows_affected();
                Ok($crate::store::Returned {
                    requeued,
                    exhausted,
                })
            }

            async fn count_messages(
                &mut self,
                queue: $crate::model::QueueId,
                state: Option<$crate::model::MessageState>,
            ) -> $crate::error::Result<u64> {
                let count: i64 = match state {
                    Some(state) => {
                        sqlx::query_scalar($crate::store::sql::COUNT_MESSAGES_IN_STATE)
                            .bind(i64::from(queue))
                            .bind(state.as_str())
                            .fetch_one(&mut *self.tx)
                            .await?
                    }
                    None => {
                        sqlx::query_scalar($crate::store::sql::COUNT_MESSAGES)
                            .bind(i64::from(queue))
                            .fetch_one(&mut *self.tx)
                            .await?
                    }
                };
                Ok(count.max(0) as u64)
            }

            async fn message_stats(
                &mut self,
                queue: $crate::model::QueueId,
            ) -> $crate::error::Result<Vec<($crate::model::MessageState, u64)>> {
                let rows: Vec<(String, i64)> = sqlx::query_as($crate::store::sql::MESSAGE_STATS)
                    .bind(i64::from(queue))
                    .fetch_all(&mut *self.tx)
                    .await?;
                rows.into_iter()
                    .map(|(state, count)| -> $crate::error::Result<_> {
                        let state = state.parse::<$crate::model::MessageState>()?;
                        Ok((state, count.max(0) as u64))
                    })
                    .collect()
            }

            async fn discard_orphaned_adds(&mut self) -> $crate::error::Result<u64> {
                let rows = sqlx::query($crate::store::sql::DISCARD_ORPHANED_ADDS)
                    .execute(&mut *self.tx)
                    .await?
                    .rows_affected();
                Ok(rows)
            }

            async fn return_orphaned_pulls(
                &mut self,
                at: chrono::DateTime<chrono::Utc>,
            ) -> $crate::error::Result<$crate::store::Returned> {
                let exhausted = sqlx::query($crate::store::sql::EXHAUST_ORPHANED_PULLS)
                    .bind(at)
                    .execute(&mut *self.tx)
                    .await?
                    .rows_affected();
                let requeued = sqlx::query($crate::store::sql::REQUEUE_ORPHANED_PULLS)
                    .execute(&mut *self.tx)
                    .await?
                    .rows_affected();
                Ok($crate::store::Returned {
                    requeued,
                    exhausted,
                })
            }

            async fn expire_messages(
                &mut self,
                now: chrono::DateTime<chrono::Utc>,
            ) -> $crate::error::Result<u64> {
                let rows = sqlx::query($crate::store::sql::EXPIRE_MESSAGES)
                    .bind(now)
                    .execute(&mut *self.tx)
                    .await?
                    .rows_affected();
                Ok(rows)
            }

            async fn close_exhausted_messages(
                &mut self,
                now: chrono::DateTime<chrono::Utc>,
            ) -> $crate::error::Result<u64> {
                let rows = sqlx::query($crate::store::sql::CLOSE_EXHAUSTED_MESSAGES)
                    .bind(now)
                    .execute(&mut *self.tx)
                    .await?
                    .rows_affected();
                Ok(rows)
            }
        }
    };
}

pub(crate) use impl_store_tx;
