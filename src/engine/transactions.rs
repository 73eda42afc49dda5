//! Transaction manager: start, extend, commit, rollback.
//!
//! `Active → {Committed, RolledBack, Expired}`, with no way back. Every
//! mutating call runs in one storage transaction, so the owned messages and
//! the transaction row always move together. A transaction whose expiry
//! has passed is unwound as `Expired` by whichever call touches it first
//! (or by the sweeper), and that call reports [`Error::Expired`]. So does every
//! later call on an expired transaction.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::*;
use crate::store::{Store, StoreTx};
use crate::telemetry::metrics;

/// `end_reason` stamped on transactions closed by their TTL.
pub const EXPIRED_REASON: &str = "Expired";

/// `end_reason` stamped on committed transactions.
pub const COMMITTED_REASON: &str = "Committed";

/// What a commit finalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    /// Enqueued messages that became `Active`.
    pub added: u64,
    /// Dequeued messages that became `Processed`.
    pub pulled: u64,
}

/// What a rollback (or expiry) undid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackSummary {
    /// Enqueued messages deleted.
    pub discarded: u64,
    /// Dequeued messages returned to `Active`.
    pub requeued: u64,
    /// Dequeued messages closed as `AttemptsExceeded`.
    pub exhausted: u64,
}

pub struct TransactionManager<S: Store> {
    store: Arc<S>,
}

impl<S: Store> Clone for TransactionManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: Store> TransactionManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Start a transaction that expires `ttl` from now.
    pub async fn start(&self, ttl: TimeDelta) -> Result<TransactionId> {
        let now = Utc::now();
        let expiry = expiry_after(now, ttl)?;

        let mut tx = self.store.begin().await?;
        let id = tx.insert_transaction(now, expiry).await?;
        tx.commit().await?;

        metrics::transaction_outcomes().add(1, &[KeyValue::new("outcome", "started")]);
        info!(%id, %expiry, "transaction started");
        Ok(id)
    }

    pub async fn get(&self, id: TransactionId) -> Result<Transaction> {
        let mut tx = self.store.begin().await?;
        let txn = tx.transaction(id).await?;
        tx.commit().await?;
        txn.ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Push the expiry out to `ttl` from now. Returns the new expiry.
    pub async fn extend(&self, id: TransactionId, ttl: TimeDelta) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        let expiry = expiry_after(now, ttl)?;

        let mut tx = self.store.begin().await?;
        if let Admission::Lapsed(unwound) = admit(&mut tx, id, now).await? {
            return Err(settle_lapsed(tx, id, unwound).await);
        }
        if !tx.set_transaction_expiry(id, expiry).await? {
            return Err(Error::Closed(id));
        }
        tx.commit().await?;

        info!(%id, %expiry, "transaction extended");
        Ok(expiry)
    }

    /// Commit: adds become `Active`, pulls become `Processed`.
    pub async fn commit(&self, id: TransactionId) -> Result<CommitSummary> {
        let now = Utc::now();

        let mut tx = self.store.begin().await?;
        if let Admission::Lapsed(unwound) = admit(&mut tx, id, now).await? {
            return Err(settle_lapsed(tx, id, unwound).await);
        }

        let added = tx
            .transition_owned(id, TransactionAction::Add, MessageState::Active, now)
            .await?;
        let pulled = tx
            .transition_owned(id, TransactionAction::Pull, MessageState::Processed, now)
            .await?;
        if !tx
            .close_transaction(id, TransactionState::Committed, now, COMMITTED_REASON)
            .await?
        {
            return Err(Error::Closed(id));
        }
        tx.commit().await?;

        metrics::transaction_outcomes().add(1, &[KeyValue::new("outcome", "committed")]);
        metrics::message_transitions().add(
            added,
            &[KeyValue::new("from", "in_transaction"), KeyValue::new("to", "active")],
        );
        metrics::message_transitions().add(
            pulled,
            &[KeyValue::new("from", "in_transaction"), KeyValue::new("to", "processed")],
        );
        info!(%id, added, pulled, "transaction committed");
        Ok(CommitSummary { added, pulled })
    }

    /// Roll back: adds are deleted, pulls are returned with one more attempt.
    pub async fn rollback(&self, id: TransactionId, reason: &str) -> Result<RollbackSummary> {
        let now = Utc::now();

        let mut tx = self.store.begin().await?;
        if let Admission::Lapsed(unwound) = admit(&mut tx, id, now).await? {
            return Err(settle_lapsed(tx, id, unwound).await);
        }
        let undone = unwind(&mut tx, id, TransactionState::RolledBack, reason, now).await?;
        tx.commit().await?;

        metrics::transaction_outcomes().add(1, &[KeyValue::new("outcome", "rolled_back")]);
        record_unwind(&undone);
        info!(
            %id,
            reason,
            discarded = undone.discarded,
            requeued = undone.requeued,
            exhausted = undone.exhausted,
            "transaction rolled back"
        );
        Ok(undone)
    }
}

fn expiry_after(now: DateTime<Utc>, ttl: TimeDelta) -> Result<DateTime<Utc>> {
    if ttl < TimeDelta::zero() {
        return Err(Error::InvalidArgument(
            "transaction ttl must not be negative".to_string(),
        ));
    }
    now.checked_add_signed(ttl)
        .ok_or_else(|| Error::InvalidArgument("transaction ttl is out of range".to_string()))
}

/// Result of checking a transaction before working under it.
pub(crate) enum Admission {
    Open,
    /// The transaction had expired and has been unwound in the current
    /// storage transaction, which must still be committed.
    Lapsed(RollbackSummary),
}

/// Lock `id` and make sure it can still do work.
pub(crate) async fn admit<T: StoreTx>(
    tx: &mut T,
    id: TransactionId,
    now: DateTime<Utc>,
) -> Result<Admission> {
    let txn = tx
        .lock_transaction(id)
        .await?
        .ok_or_else(|| Error::NotFound(id.to_string()))?;
    match txn.state {
        TransactionState::Active => {}
        TransactionState::Expired => return Err(Error::Expired(id)),
        TransactionState::Committed | TransactionState::RolledBack => {
            return Err(Error::Closed(id));
        }
    }
    if txn.is_expired_at(now) {
        let unwound = unwind(tx, id, TransactionState::Expired, EXPIRED_REASON, now).await?;
        return Ok(Admission::Lapsed(unwound));
    }
    Ok(Admission::Open)
}

/// Persist an expiry unwind found by [`admit`] and produce the error the
/// caller reports.
pub(crate) async fn settle_lapsed<T: StoreTx>(
    tx: T,
    id: TransactionId,
    unwound: RollbackSummary,
) -> Error {
    if let Err(e) = tx.commit().await {
        return e;
    }
    metrics::transaction_outcomes().add(1, &[KeyValue::new("outcome", "expired")]);
    record_unwind(&unwound);
    warn!(
        %id,
        discarded = unwound.discarded,
        requeued = unwound.requeued,
        exhausted = unwound.exhausted,
        "transaction expired before use; unwound"
    );
    Error::Expired(id)
}

/// Close `id` as `to` and undo everything it owns.
async fn unwind<T: StoreTx>(
    tx: &mut T,
    id: TransactionId,
    to: TransactionState,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<RollbackSummary> {
    // Closing first doubles as the guard against a concurrent close.
    if !tx.close_transaction(id, to, now, reason).await? {
        return Err(Error::Closed(id));
    }
    let discarded = tx.discard_owned(id, TransactionAction::Add).await?;
    let returned = tx.return_owned(id, now).await?;
    Ok(RollbackSummary {
        discarded,
        requeued: returned.requeued,
        exhausted: returned.exhausted,
    })
}

fn record_unwind(undone: &RollbackSummary) {
    metrics::message_transitions().add(
        undone.requeued,
        &[KeyValue::new("from", "in_transaction"), KeyValue::new("to", "active")],
    );
    metrics::message_transitions().add(
        undone.exhausted,
        &[
            KeyValue::new("from", "in_transaction"),
            KeyValue::new("to", "attempts_exceeded"),
        ],
    );
}
