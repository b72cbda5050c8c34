//! Connection context and local transaction scaffolding. A send inside a
//! transaction reaches the cursor only after commit; the store-side append
//! is rolled back by the transaction manager on abort.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::error::QueueError;

/// Work registered against a transaction, run at its outcome.
pub trait Synchronization: Send {
    fn after_commit(&self) -> Result<(), QueueError>;

    fn after_rollback(&self) {}
}

/// Minimal local transaction: an ordered list of synchronizations fired
/// once at commit or rollback.
#[derive(Default)]
pub struct Transaction {
    synchronizations: Mutex<Vec<Box<dyn Synchronization>>>,
}

impl Transaction {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_synchronization(&self, synchronization: Box<dyn Synchronization>) {
        self.synchronizations.lock().push(synchronization);
    }

    pub fn commit(&self) -> Result<(), QueueError> {
        let pending: Vec<_> = self.synchronizations.lock().drain(..).collect();
        for synchronization in pending {
            synchronization.after_commit()?;
        }
        Ok(())
    }

    pub fn rollback(&self) {
        let pending: Vec<_> = self.synchronizations.lock().drain(..).collect();
        for synchronization in pending {
            synchronization.after_rollback();
        }
    }
}

/// Per-call context a producer or admin operation carries into the queue.
#[derive(Clone, Default)]
pub struct ConnectionContext {
    producer_flow_control: bool,
    transaction: Option<Arc<Transaction>>,
}

impl ConnectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_producer_flow_control(mut self, on: bool) -> Self {
        self.producer_flow_control = on;
        self
    }

    pub fn with_transaction(mut self, transaction: Arc<Transaction>) -> Self {
        self.transaction = Some(transaction);
        self
    }

    pub fn is_producer_flow_control(&self) -> bool {
        self.producer_flow_control
    }

    pub fn is_in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.transaction.as_ref()
    }
}
