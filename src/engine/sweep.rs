//! Reconciliation sweep.
//!
//! Repairs state that clients abandoned: expired transactions, the messages
//! they still own, messages past their own TTL and messages out of
//! attempts. The sweeper does not schedule itself; callers run it.
//!
//! Steps run in a fixed order, each in its own storage transaction. The
//! owned-message steps select on the owner being `Expired` rather than on
//! anything remembered from step 1, so a sweep interrupted halfway is
//! finished by the next one.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, info};

use crate::error::Result;
use crate::store::{Store, StoreTx};
use crate::telemetry::{metrics, spans};

/// Rows touched by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub transactions_expired: u64,
    pub adds_discarded: u64,
    pub pulls_requeued: u64,
    pub pulls_exhausted: u64,
    pub messages_expired: u64,
    pub messages_exhausted: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.transactions_expired
            + self.adds_discarded
            + self.pulls_requeued
            + self.pulls_exhausted
            + self.messages_expired
            + self.messages_exhausted
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

pub struct Sweeper<S: Store> {
    store: Arc<S>,
}

impl<S: Store> Clone for Sweeper<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: Store> Sweeper<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Sweep against the wall clock.
    pub async fn run(&self) -> Result<SweepReport> {
        self.run_at(Utc::now()).await
    }

    /// Sweep as if the time were `now`.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let span = spans::start_sweep_span(now);
        let started = Instant::now();

        let report = async {
            let mut report = SweepReport::default();

            // 1. Active transactions past their expiry.
            let mut tx = self.store.begin().await?;
            report.transactions_expired = tx.expire_transactions(now).await?;
            tx.commit().await?;
            spans::record_step(&span, "expire_transactions", report.transactions_expired);

            // 2. Messages those transactions were adding never existed.
            let mut tx = self.store.begin().await?;
            report.adds_discarded = tx.discard_orphaned_adds().await?;
            tx.commit().await?;
            spans::record_step(&span, "discard_orphaned_adds", report.adds_discarded);

            // 3. Messages they had pulled go back, threshold enforced inline.
            let mut tx = self.store.begin().await?;
            let returned = tx.return_orphaned_pulls(now).await?;
            tx.commit().await?;
            report.pulls_requeued = returned.requeued;
            report.pulls_exhausted = returned.exhausted;
            spans::record_step(&span, "requeue_orphaned_pulls", returned.requeued);
            spans::record_step(&span, "exhaust_orphaned_pulls", returned.exhausted);

            // 4. Active messages past their own TTL.
            let mut tx = self.store.begin().await?;
            report.messages_expired = tx.expire_messages(now).await?;
            tx.commit().await?;
            spans::record_step(&span, "expire_messages", report.messages_expired);

            // 5. Active messages with no attempts left.
            let mut tx = self.store.begin().await?;
            report.messages_exhausted = tx.close_exhausted_messages(now).await?;
            tx.commit().await?;
            spans::record_step(&span, "close_exhausted_messages", report.messages_exhausted);

            Ok::<_, crate::error::Error>(report)
        }
        .instrument(span.clone())
        .await?;

        spans::record_total(&span, report.total());
        record_metrics(&report, started.elapsed().as_secs_f64() * 1000.0);
        if !report.is_empty() {
            info!(?report, "sweep repaired state");
        }
        Ok(report)
    }
}

fn record_metrics(report: &SweepReport, elapsed_ms: f64) {
    let steps = [
        ("expire_transactions", report.transactions_expired),
        ("discard_orphaned_adds", report.adds_discarded),
        ("requeue_orphaned_pulls", report.pulls_requeued),
        ("exhaust_orphaned_pulls", report.pulls_exhausted),
        ("expire_messages", report.messages_expired),
        ("close_exhausted_messages", report.messages_exhausted),
    ];
    for (step, rows) in steps {
        metrics::sweep_rows().add(rows, &[KeyValue::new("step", step)]);
    }
    metrics::operation_duration_ms().record(elapsed_ms, &[KeyValue::new("operation", "sweep")]);
}
