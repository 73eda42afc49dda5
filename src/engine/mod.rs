//! Transactional queue core: transaction manager, queue engine and the
//! reconciliation sweeper, all sharing one store.

pub mod locks;
pub mod queues;
pub mod schedule;
pub mod sweep;
pub mod transactions;

pub use locks::QueueLocks;
pub use queues::{QueueEngine, QueueStats};
pub use schedule::SweepLoop;
pub use sweep::{SweepReport, Sweeper};
pub use transactions::{CommitSummary, RollbackSummary, TransactionManager};

use std::sync::Arc;
use std::time::Duration;

use crate::store::Store;

/// Default bound on tracked per-queue locks before idle ones are pruned.
pub const DEFAULT_LOCK_CAPACITY: usize = 1024;

/// The three core components wired to one store.
pub struct Engine<S: Store> {
    pub transactions: TransactionManager<S>,
    pub queues: QueueEngine<S>,
    pub sweeper: Sweeper<S>,
}

impl<S: Store> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            transactions: self.transactions.clone(),
            queues: self.queues.clone(),
            sweeper: self.sweeper.clone(),
        }
    }
}

impl<S: Store> Engine<S> {
    pub fn new(store: S) -> Self {
        Self::with_lock_capacity(store, DEFAULT_LOCK_CAPACITY)
    }

    pub fn with_lock_capacity(store: S, lock_capacity: usize) -> Self {
        let store = Arc::new(store);
        Self {
            transactions: TransactionManager::new(Arc::clone(&store)),
            queues: QueueEngine::new(Arc::clone(&store), lock_capacity),
            sweeper: Sweeper::new(store),
        }
    }

    /// A loop that runs this engine's sweeper every `interval`.
    pub fn sweep_loop(&self, interval: Duration) -> SweepLoop<S> {
        SweepLoop::new(self.sweeper.clone(), interval)
    }
}
