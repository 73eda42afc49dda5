//! SQLite backend (file or in-memory).
//!
//! SQLite has a single writer, so the store runs on one pooled connection
//! and claims are a plain select followed by a guarded update. The engine
//! serializes claims per queue ([`ClaimMode::Serialized`]).

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction as SqlTransaction};

use super::sql::{self, MessageRow, TransactionRow};
use super::{ClaimMode, Store};
use crate::error::Result;
use crate::model::*;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed store. Owns the connection pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create a database at the given URL (`sqlite://path` or a
    /// bare path) and run migrations.
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    /// Create an in-memory database (for testing).
    ///
    /// The single connection is never recycled; closing it would drop the
    /// database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self> {
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    type Tx = SqliteTx;

    async fn begin(&self) -> Result<SqliteTx> {
        Ok(SqliteTx {
            tx: self.pool.begin().await?,
        })
    }

    fn claim_mode(&self) -> ClaimMode {
        ClaimMode::Serialized
    }
}

/// One SQLite transaction.
pub struct SqliteTx {
    tx: SqlTransaction<'static, Sqlite>,
}

const SELECT_CLAIM_CANDIDATE: &str = "SELECT id FROM messages
     WHERE queue_id = $1 AND state = 'active' AND attempts < max_attempts
       AND (expiry_time IS NULL OR expiry_time > $2)
     ORDER BY priority DESC, add_time ASC, id ASC
     LIMIT 1";

const CLAIM_BY_ID: &str = "UPDATE messages
     SET state = 'in_transaction', transaction_action = 'pull', transaction_id = $2
     WHERE id = $1 AND state = 'active'
     RETURNING id, queue_id, transaction_id, transaction_action, state, add_time, close_time,
               priority, max_attempts, attempts, expiry_time, correlation_id, group_name,
               metadata, payload";

impl SqliteTx {
    async fn lock_row(&mut self, id: TransactionId) -> Result<Option<Transaction>> {
        // The single connection already excludes every other writer.
        let row: Option<TransactionRow> = sqlx::query_as(sql::SELECT_TRANSACTION)
            .bind(i64::from(id))
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(TransactionRow::try_into_transaction).transpose()
    }

    async fn claim_next(
        &mut self,
        queue: QueueId,
        owner: TransactionId,
        now: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        let candidate: Option<i64> = sqlx::query_scalar(SELECT_CLAIM_CANDIDATE)
            .bind(i64::from(queue))
            .bind(now)
            .fetch_optional(&mut *self.tx)
            .await?;
        let Some(id) = candidate else {
            return Ok(None);
        };

        let row: Option<MessageRow> = sqlx::query_as(CLAIM_BY_ID)
            .bind(id)
            .bind(i64::from(owner))
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(MessageRow::try_into_message).transpose()
    }
}

sql::impl_store_tx!(SqliteTx);

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::engine::Engine;
    use crate::store::StoreTx;

    /// Rows can reach their attempt limit while `Active` (a lowered
    /// `max_attempts`, or a crash between requeue and close). Dequeue skips
    /// them and the sweep closes them.
    #[tokio::test]
    async fn sweep_closes_exhausted_active_messages() {
        let store = SqliteStore::in_memory().await.unwrap();
        let engine = Engine::new(store.clone());
        let queue = engine.queues.create_queue("spent").await.unwrap();

        let txn = engine.transactions.start(TimeDelta::minutes(1)).await.unwrap();
        let m = engine
            .queues
            .enqueue(txn, queue, NewMessage::new("worn out").max_attempts(2))
            .await
            .unwrap();
        engine.transactions.commit(txn).await.unwrap();

        sqlx::query("UPDATE messages SET attempts = max_attempts WHERE id = $1")
            .bind(i64::from(m))
            .execute(&store.pool)
            .await
            .unwrap();

        let consumer = engine.transactions.start(TimeDelta::minutes(1)).await.unwrap();
        assert!(engine.queues.dequeue(consumer, queue).await.unwrap().is_none());
        engine.transactions.rollback(consumer, "empty").await.unwrap();

        let report = engine.sweeper.run_at(Utc::now()).await.unwrap();
        assert_eq!(report.messages_exhausted, 1);
        assert_eq!(report.total(), 1);

        let closed = engine.queues.peek_by_id(m).await.unwrap();
        assert_eq!(closed.state, MessageState::AttemptsExceeded);
        assert_eq!(closed.attempts, 2);
        assert!(closed.close_time.is_some());

        let again = engine.sweeper.run_at(Utc::now()).await.unwrap();
        assert!(again.is_empty(), "{again:?}");
    }

    #[tokio::test]
    async fn plain_transaction_lookup() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        let id = tx
            .insert_transaction(now, now + TimeDelta::minutes(5))
            .await
            .unwrap();
        let txn = tx.transaction(id).await.unwrap().unwrap();
        assert_eq!(txn.id, id);
        assert_eq!(txn.state, TransactionState::Active);
        assert!(tx.transaction(TransactionId(id.0 + 1)).await.unwrap().is_none());
        tx.commit().await.unwrap();
    }
}
