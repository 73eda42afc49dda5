//! Postgres backend.
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so concurrent dequeuers on the same
//! queue each get a different row without any application-level lock.
//! Transaction rows are locked `FOR UPDATE` while commit, rollback and
//! enqueue inspect them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction as SqlTransaction};

use super::sql::{self, MessageRow, TransactionRow};
use super::{ClaimMode, Store};
use crate::error::Result;
use crate::model::*;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgres");

/// Postgres-backed store. Owns the connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres, create a connection pool and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
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
impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx> {
        Ok(PgTx {
            tx: self.pool.begin().await?,
        })
    }

    fn claim_mode(&self) -> ClaimMode {
        ClaimMode::SkipLocked
    }
}

/// One Postgres transaction.
pub struct PgTx {
    tx: SqlTransaction<'static, Postgres>,
}

const LOCK_TRANSACTION: &str = "SELECT id, state, start_time, expiry_time, end_time, end_reason
     FROM transactions WHERE id = $1
     FOR UPDATE";

const CLAIM_NEXT: &str = "UPDATE messages
     SET state = 'in_transaction', transaction_action = 'pull', transaction_id = $3
     WHERE state = 'active' AND id = (
         SELECT id FROM messages
         WHERE queue_id = $1 AND state = 'active' AND attempts < max_attempts
           AND (expiry_time IS NULL OR expiry_time > $2)
         ORDER BY priority DESC, add_time ASC, id ASC
         LIMIT 1
         FOR UPDATE SKIP LOCKED
     )
     RETURNING id, queue_id, transaction_id, transaction_action, state, add_time, close_time,
               priority, max_attempts, attempts, expiry_time, correlation_id, group_name,
               metadata, payload";

impl PgTx {
    async fn lock_row(&mut self, id: TransactionId) -> Result<Option<Transaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(LOCK_TRANSACTION)
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
        let row: Option<MessageRow> = sqlx::query_as(CLAIM_NEXT)
            .bind(i64::from(queue))
            .bind(now)
            .bind(i64::from(owner))
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(MessageRow::try_into_message).transpose()
    }
}

sql::impl_store_tx!(PgTx);
