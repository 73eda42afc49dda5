//! # txqueue
//!
//! Transactional work queues over SQLite or Postgres.
//!
//! Producers enqueue messages under a transaction; they become visible when
//! it commits. Consumers dequeue under a transaction and commit to consume
//! or roll back to retry, up to each message's attempt budget. A sweep
//! unwinds transactions and messages whose TTL has passed.

pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod service;
pub mod store;
pub mod telemetry;
