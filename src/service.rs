//! Request/response surface over the engine.
//!
//! Every call returns `Result<T, Fault>`. A transport maps a [`Fault`] to its
//! own wire form; the [`ResultCode`] is what clients branch on. Storage and
//! other internal failures are reported as [`ResultCode::Unknown`] with a
//! fixed message; the detail only goes to the log.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::engine::{CommitSummary, Engine, RollbackSummary, SweepReport};
use crate::error::{Error, ResultCode};
use crate::model::*;
use crate::store::Store;

/// A failed call as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub code: ResultCode,
    pub message: String,
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Fault {}

impl From<Error> for Fault {
    fn from(e: Error) -> Self {
        let code = e.code();
        let message = if code == ResultCode::Unknown {
            error!(error = %e, "internal failure");
            "internal error".to_string()
        } else {
            e.to_string()
        };
        Fault { code, message }
    }
}

pub type Reply<T> = std::result::Result<T, Fault>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub id: QueueId,
    pub name: String,
}

impl From<Queue> for QueueInfo {
    fn from(q: Queue) -> Self {
        QueueInfo {
            id: q.id,
            name: q.name,
        }
    }
}

/// A message as returned by dequeue and peek.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: MessageId,
    pub queue_id: QueueId,
    pub transaction_id: Option<TransactionId>,
    pub transaction_action: Option<TransactionAction>,
    pub state: MessageState,
    pub add_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    pub priority: i32,
    pub max_attempts: u32,
    pub attempts: u32,
    pub expiry_time: Option<DateTime<Utc>>,
    pub correlation_id: i64,
    pub group_name: Option<String>,
    pub metadata: String,
    pub payload: Vec<u8>,
}

impl From<Message> for MessageView {
    fn from(m: Message) -> Self {
        MessageView {
            id: m.id,
            queue_id: m.queue_id,
            transaction_id: m.transaction_id,
            transaction_action: m.transaction_action,
            state: m.state,
            add_time: m.add_time,
            close_time: m.close_time,
            priority: m.priority,
            max_attempts: m.max_attempts,
            attempts: m.attempts,
            expiry_time: m.expiry_time,
            correlation_id: m.correlation_id,
            group_name: m.group_name,
            metadata: m.metadata,
            payload: m.payload,
        }
    }
}

/// Arguments of `QueueMessage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessageRequest {
    pub transaction_id: TransactionId,
    pub queue_id: QueueId,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Minutes until the message expires; `None` never expires.
    #[serde(default)]
    pub expiry_minutes: Option<i64>,
    #[serde(default)]
    pub correlation_id: i64,
    #[serde(default)]
    pub group_name: Option<String>,
}

fn default_max_attempts() -> u32 {
    NewMessage::DEFAULT_MAX_ATTEMPTS
}

impl QueueMessageRequest {
    pub fn new(transaction_id: TransactionId, queue_id: QueueId, payload: Vec<u8>) -> Self {
        Self {
            transaction_id,
            queue_id,
            payload,
            metadata: String::new(),
            priority: 0,
            max_attempts: NewMessage::DEFAULT_MAX_ATTEMPTS,
            expiry_minutes: None,
            correlation_id: 0,
            group_name: None,
        }
    }

    fn into_new_message(self) -> crate::error::Result<NewMessage> {
        let mut new = NewMessage::new(self.payload)
            .metadata(self.metadata)
            .priority(self.priority)
            .max_attempts(self.max_attempts)
            .correlation_id(self.correlation_id);
        if let Some(minutes) = self.expiry_minutes {
            new = new.expires_in(minutes_to_delta(minutes)?);
        }
        if let Some(group) = self.group_name {
            new = new.group_name(group);
        }
        Ok(new)
    }
}

fn minutes_to_delta(minutes: i64) -> crate::error::Result<TimeDelta> {
    if minutes < 0 {
        return Err(Error::InvalidArgument(format!(
            "minutes must not be negative, got {minutes}"
        )));
    }
    TimeDelta::try_minutes(minutes)
        .ok_or_else(|| Error::InvalidArgument(format!("{minutes} minutes is out of range")))
}

pub struct Service<S: Store> {
    engine: Engine<S>,
}

impl<S: Store> Clone for Service<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<S: Store> Service<S> {
    pub fn new(engine: Engine<S>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine<S> {
        &self.engine
    }

    // -----------------------------------------------------------------------
    // Queues
    // -----------------------------------------------------------------------

    pub async fn create_queue(&self, name: &str) -> Reply<QueueId> {
        Ok(self.engine.queues.create_queue(name).await?)
    }

    /// Returns the number of messages removed with the queue.
    pub async fn delete_queue(&self, queue: impl Into<QueueRef>) -> Reply<u64> {
        Ok(self.engine.queues.delete_queue(queue).await?)
    }

    pub async fn get_queue_info(&self, queue: impl Into<QueueRef>) -> Reply<QueueInfo> {
        Ok(self.engine.queues.queue_info(queue).await?.into())
    }

    pub async fn list_queues(&self) -> Reply<Vec<QueueInfo>> {
        let queues = self.engine.queues.list_queues().await?;
        Ok(queues.into_iter().map(QueueInfo::from).collect())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    pub async fn start_transaction(&self, ttl_minutes: i64) -> Reply<TransactionId> {
        let ttl = minutes_to_delta(ttl_minutes)?;
        Ok(self.engine.transactions.start(ttl).await?)
    }

    /// Returns the new expiry.
    pub async fn extend_transaction(
        &self,
        id: TransactionId,
        ttl_minutes: i64,
    ) -> Reply<DateTime<Utc>> {
        let ttl = minutes_to_delta(ttl_minutes)?;
        Ok(self.engine.transactions.extend(id, ttl).await?)
    }

    pub async fn get_transaction(&self, id: TransactionId) -> Reply<Transaction> {
        Ok(self.engine.transactions.get(id).await?)
    }

    pub async fn commit_transaction(&self, id: TransactionId) -> Reply<CommitSummary> {
        Ok(self.engine.transactions.commit(id).await?)
    }

    pub async fn rollback_transaction(
        &self,
        id: TransactionId,
        reason: &str,
    ) -> Reply<RollbackSummary> {
        Ok(self.engine.transactions.rollback(id, reason).await?)
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    pub async fn queue_message(&self, request: QueueMessageRequest) -> Reply<MessageId> {
        let owner = request.transaction_id;
        let queue = request.queue_id;
        let new = request.into_new_message()?;
        Ok(self.engine.queues.enqueue(owner, queue, new).await?)
    }

    /// Enqueue one message in a transaction of its own and commit it. If the
    /// enqueue fails the transaction is rolled back and the enqueue fault is
    /// returned.
    pub async fn send_message(&self, queue: QueueId, new: NewMessage) -> Reply<MessageId> {
        let txn = self.engine.transactions.start(TimeDelta::minutes(1)).await?;
        let id = match self.engine.queues.enqueue(txn, queue, new).await {
            Ok(id) => id,
            Err(e) => {
                let undo = self.engine.transactions.rollback(txn, "enqueue failed").await;
                if let Err(undo) = undo {
                    warn!(transaction = %txn, error = %undo, "rollback after failed enqueue failed");
                }
                return Err(e.into());
            }
        };
        self.engine.transactions.commit(txn).await?;
        Ok(id)
    }

    pub async fn dequeue_message(
        &self,
        owner: TransactionId,
        queue: QueueId,
    ) -> Reply<Option<MessageView>> {
        let claimed = self.engine.queues.dequeue(owner, queue).await?;
        Ok(claimed.map(MessageView::from))
    }

    pub async fn peek_message_by_queue(&self, queue: QueueId) -> Reply<Option<MessageView>> {
        let next = self.engine.queues.peek(queue).await?;
        Ok(next.map(MessageView::from))
    }

    pub async fn peek_message_by_id(&self, id: MessageId) -> Reply<MessageView> {
        Ok(self.engine.queues.peek_by_id(id).await?.into())
    }

    pub async fn count_messages(
        &self,
        queue: QueueId,
        state: Option<MessageState>,
    ) -> Reply<u64> {
        Ok(self.engine.queues.count(queue, state).await?)
    }

    pub async fn run_sweep(&self) -> Reply<SweepReport> {
        Ok(self.engine.sweeper.run().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_faults_hide_detail() {
        let fault = Fault::from(Error::Other("disk on fire at /var/lib/txq".to_string()));
        assert_eq!(fault.code, ResultCode::Unknown);
        assert_eq!(fault.message, "internal error");
    }

    #[test]
    fn business_faults_keep_message() {
        let fault = Fault::from(Error::Closed(TransactionId(7)));
        assert_eq!(fault.code, ResultCode::Closed);
        assert!(fault.message.contains("transaction#7"));
    }

    #[test]
    fn negative_minutes_are_rejected() {
        let err = minutes_to_delta(-1).unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidArgument);
        assert_eq!(minutes_to_delta(0).unwrap(), TimeDelta::zero());
    }

    #[test]
    fn request_defaults_fill_in_from_json() {
        let req: QueueMessageRequest =
            serde_json::from_str(r#"{"transaction_id":1,"queue_id":2,"payload":[104,105]}"#)
                .unwrap();
        assert_eq!(req.max_attempts, NewMessage::DEFAULT_MAX_ATTEMPTS);
        assert_eq!(req.expiry_minutes, None);
        assert_eq!(req, QueueMessageRequest::new(TransactionId(1), QueueId(2), b"hi".to_vec()));
    }
}
