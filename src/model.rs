//! Core data model.
//!
//! Queues hold messages; transactions own messages while work is in
//! flight. A message's `transaction_id` is set exactly while it is
//! `InTransaction`, and a transaction's `end_time` is set exactly once it
//! reaches a terminal state.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}#{}", $label, self.0)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> i64 {
                id.0 as i64
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw as u64)
            }
        }
    };
}

id_type!(
    /// Queue id, allocated by the store's sequence.
    QueueId,
    "queue"
);
id_type!(
    /// Message id, allocated by the store's sequence.
    MessageId,
    "message"
);
id_type!(
    /// Transaction id, allocated by the store's sequence.
    TransactionId,
    "transaction"
);

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// A named, ordered collection of messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    pub id: QueueId,
    pub name: String,
}

/// A validated queue name.
///
/// Surrounding whitespace is stripped and the remainder must match
/// `[A-Za-z0-9.\-_]+`. Two names are duplicates when their lowercase forms
/// are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueName {
    display: String,
    key: String,
}

impl QueueName {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidArgument("queue name is empty".to_string()));
        }
        if let Some(bad) = trimmed
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
        {
            return Err(Error::InvalidArgument(format!(
                "queue name {trimmed:?} contains {bad:?}; allowed: letters, digits, '.', '-', '_'"
            )));
        }
        Ok(Self {
            display: trimmed.to_string(),
            key: trimmed.to_ascii_lowercase(),
        })
    }

    /// The name as the caller wrote it, minus surrounding whitespace.
    pub fn as_str(&self) -> &str {
        &self.display
    }

    /// Lowercase form used for duplicate detection and lookup.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display)
    }
}

/// Address a queue by id or by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueRef {
    Id(QueueId),
    Name(String),
}

impl From<QueueId> for QueueRef {
    fn from(id: QueueId) -> Self {
        QueueRef::Id(id)
    }
}

impl From<&str> for QueueRef {
    fn from(name: &str) -> Self {
        QueueRef::Name(name.to_string())
    }
}

impl std::fmt::Display for QueueRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueRef::Id(id) => write!(f, "{id}"),
            QueueRef::Name(name) => write!(f, "queue {name:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Lifecycle state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Committed and eligible for dequeue.
    Active,
    /// Owned by a live transaction (being added or pulled).
    InTransaction,
    /// Pulled and committed. Terminal.
    Processed,
    /// Message TTL passed before it was consumed. Terminal.
    Expired,
    /// Rolled back `max_attempts` times. Terminal.
    AttemptsExceeded,
}

impl MessageState {
    pub const ALL: [MessageState; 5] = [
        MessageState::Active,
        MessageState::InTransaction,
        MessageState::Processed,
        MessageState::Expired,
        MessageState::AttemptsExceeded,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageState::Processed | MessageState::Expired | MessageState::AttemptsExceeded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageState::Active => "active",
            MessageState::InTransaction => "in_transaction",
            MessageState::Processed => "processed",
            MessageState::Expired => "expired",
            MessageState::AttemptsExceeded => "attempts_exceeded",
        }
    }
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        MessageState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| Error::Other(format!("unknown message state: {s}")))
    }
}

/// Lifecycle state of a transaction. Everything except `Active` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    Expired,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransactionState::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionState::Active => "active",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled_back",
            TransactionState::Expired => "expired",
        }
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(TransactionState::Active),
            "committed" => Ok(TransactionState::Committed),
            "rolled_back" => Ok(TransactionState::RolledBack),
            "expired" => Ok(TransactionState::Expired),
            _ => Err(Error::Other(format!("unknown transaction state: {s}"))),
        }
    }
}

/// Why a transaction owns a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionAction {
    /// Enqueued under the transaction; invisible until commit.
    Add,
    /// Dequeued under the transaction; consumed on commit.
    Pull,
}

impl TransactionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionAction::Add => "add",
            TransactionAction::Pull => "pull",
        }
    }
}

impl std::fmt::Display for TransactionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(TransactionAction::Add),
            "pull" => Ok(TransactionAction::Pull),
            _ => Err(Error::Other(format!("unknown transaction action: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A unit of work with payload, priority, retry budget and lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub queue_id: QueueId,
    /// Set iff `state == InTransaction`.
    pub transaction_id: Option<TransactionId>,
    /// Set iff `transaction_id` is set.
    pub transaction_action: Option<TransactionAction>,
    pub state: MessageState,
    pub add_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    /// Higher values are dequeued first.
    pub priority: i32,
    pub max_attempts: u32,
    pub attempts: u32,
    pub expiry_time: Option<DateTime<Utc>>,
    pub correlation_id: i64,
    pub group_name: Option<String>,
    pub metadata: String,
    pub payload: Vec<u8>,
}

/// Builder for a message to enqueue.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub(crate) payload: Vec<u8>,
    pub(crate) metadata: String,
    pub(crate) priority: i32,
    pub(crate) max_attempts: u32,
    pub(crate) expires_in: Option<TimeDelta>,
    pub(crate) correlation_id: i64,
    pub(crate) group_name: Option<String>,
}

impl NewMessage {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            metadata: String::new(),
            priority: 0,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            expires_in: None,
            correlation_id: 0,
            group_name: None,
        }
    }

    pub fn metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Message TTL, measured from enqueue. No TTL means it never expires.
    pub fn expires_in(mut self, ttl: TimeDelta) -> Self {
        self.expires_in = Some(ttl);
        self
    }

    pub fn correlation_id(mut self, id: i64) -> Self {
        self.correlation_id = id;
        self
    }

    pub fn group_name(mut self, group: impl Into<String>) -> Self {
        self.group_name = Some(group.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidArgument(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.expires_in.is_some_and(|ttl| ttl < TimeDelta::zero()) {
            return Err(Error::InvalidArgument(
                "message expiry must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// A bounded-lifetime unit of work grouping enqueues and dequeues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub state: TransactionState,
    pub start_time: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
    /// Set iff `state` is terminal.
    pub end_time: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
}

impl Transaction {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry_time <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_name_strips_whitespace_and_lowercases_key() {
        let name = QueueName::parse("  Orders.v2 ").unwrap();
        assert_eq!(name.as_str(), "Orders.v2");
        assert_eq!(name.key(), "orders.v2");
    }

    #[test]
    fn queue_name_rejects_empty_and_bad_characters() {
        assert!(matches!(
            QueueName::parse("   "),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            QueueName::parse("orders/eu"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            QueueName::parse("or ders"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(QueueName::parse("a-b_c.d9").is_ok());
    }

    #[test]
    fn states_round_trip_through_storage_form() {
        for state in MessageState::ALL {
            assert_eq!(state.as_str().parse::<MessageState>().unwrap(), state);
        }
        assert_eq!(
            "rolled_back".parse::<TransactionState>().unwrap(),
            TransactionState::RolledBack
        );
        assert!("paused".parse::<MessageState>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!MessageState::Active.is_terminal());
        assert!(!MessageState::InTransaction.is_terminal());
        assert!(MessageState::AttemptsExceeded.is_terminal());
        assert!(!TransactionState::Active.is_terminal());
        assert!(TransactionState::Expired.is_terminal());
    }

    #[test]
    fn new_message_rejects_zero_attempts() {
        assert!(NewMessage::new(b"x".to_vec()).validate().is_ok());
        assert!(matches!(
            NewMessage::new(b"x".to_vec()).max_attempts(0).validate(),
            Err(Error::InvalidArgument(_))
        ));
    }
}
