//! Sweep span helpers.

use chrono::{DateTime, Utc};
use tracing::Span;

/// Start a span covering one reconciliation sweep.
pub fn start_sweep_span(now: DateTime<Utc>) -> Span {
    tracing::info_span!(
        "txq.sweep",
        "sweep.now" = %now,
        "sweep.rows" = tracing::field::Empty,
    )
}

/// Record how many rows one sweep step touched, as an event in `span`.
pub fn record_step(span: &Span, step: &str, rows: u64) {
    span.in_scope(|| {
        tracing::debug!(step, rows, "sweep_step");
    });
}

/// Record the total rows a sweep touched on its span.
pub fn record_total(span: &Span, rows: u64) {
    span.record("sweep.rows", rows);
}
