//! Metric instrument factories for txqueue.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"txqueue"` meter; with no
//! provider installed they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for txqueue instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("txqueue")
}

/// Counter: queue-level operations (create, delete, enqueue, dequeue).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("txq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: transactions started and how they ended.
/// Labels: `outcome` ("started" | "committed" | "rolled_back" | "expired").
pub fn transaction_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("txq.transaction.outcomes")
        .with_description("Number of transactions by outcome")
        .build()
}

/// Counter: messages moved out of a transaction.
/// Labels: `from`, `to`.
pub fn message_transitions() -> Counter<u64> {
    meter()
        .u64_counter("txq.message.transitions")
        .with_description("Number of message state transitions")
        .build()
}

/// Counter: rows repaired by the sweeper.
/// Labels: `step`.
pub fn sweep_rows() -> Counter<u64> {
    meter()
        .u64_counter("txq.sweep.rows")
        .with_description("Rows touched by reconciliation sweeps")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("txq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
