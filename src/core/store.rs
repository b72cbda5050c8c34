//! Durable message store interface plus an in-memory implementation used
//! for volatile queues and tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::error::StoreError;
use crate::core::message::{Message, MessageAck, MessageId};
use crate::core::transaction::ConnectionContext;
use crate::core::usage::UsageAccountant;

/// Receives messages replayed from the store during queue initialization.
pub trait MessageRecoveryListener {
    fn recover_message(&mut self, message: Message);
}

/// The durable message store consumed by the queue. Persistence layout is
/// the store's concern; the queue only appends, deletes by id, and replays.
pub trait MessageStore: Send + Sync {
    /// Durable append.
    fn add_message(&self, ctx: &ConnectionContext, message: &Arc<Message>)
        -> Result<(), StoreError>;

    /// Durable delete of the single message named by `ack`. Unknown ids
    /// are a no-op, so acknowledgement is idempotent.
    fn remove_message(&self, ctx: &ConnectionContext, ack: &MessageAck) -> Result<(), StoreError>;

    /// Destroys all state for the queue; used on dispose.
    fn remove_all_messages(&self, ctx: &ConnectionContext) -> Result<(), StoreError>;

    fn get_message(&self, id: MessageId) -> Result<Option<Arc<Message>>, StoreError>;

    /// Replays every stored message through `listener`, in insertion order.
    fn recover(&self, listener: &mut dyn MessageRecoveryListener) -> Result<(), StoreError>;

    /// Wires the store to the queue's accountant so it can spill or flush
    /// when memory pressure rises.
    fn set_usage_accountant(&self, usage: Arc<UsageAccountant>);
}

#[derive(Default)]
struct StoreInner {
    order: Vec<MessageId>,
    by_id: HashMap<MessageId, Arc<Message>>,
}

/// Insertion-ordered in-memory store. Survives queue restarts as long as
/// the process (and the `Arc` holding it) does.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<StoreInner>,
    usage: Mutex<Option<Arc<UsageAccountant>>>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn usage_accountant(&self) -> Option<Arc<UsageAccountant>> {
        self.usage.lock().clone()
    }
}

impl MessageStore for InMemoryStore {
    fn add_message(
        &self,
        _ctx: &ConnectionContext,
        message: &Arc<Message>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.by_id.insert(message.id, Arc::clone(message)).is_none() {
            inner.order.push(message.id);
        }
        Ok(())
    }

    fn remove_message(&self, _ctx: &ConnectionContext, ack: &MessageAck) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.by_id.remove(&ack.first_message_id).is_some() {
            inner.order.retain(|id| *id != ack.first_message_id);
        }
        Ok(())
    }

    fn remove_all_messages(&self, _ctx: &ConnectionContext) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.order.clear();
        inner.by_id.clear();
        Ok(())
    }

    fn get_message(&self, id: MessageId) -> Result<Option<Arc<Message>>, StoreError> {
        Ok(self.inner.lock().by_id.get(&id).cloned())
    }

    fn recover(&self, listener: &mut dyn MessageRecoveryListener) -> Result<(), StoreError> {
        let replay: Vec<Arc<Message>> = {
            let inner = self.inner.lock();
            inner
                .order
                .iter()
                .filter_map(|id| inner.by_id.get(id).cloned())
                .collect()
        };
        for message in replay {
            listener.recover_message((*message).clone());
        }
        Ok(())
    }

    fn set_usage_accountant(&self, usage: Arc<UsageAccountant>) {
        *self.usage.lock() = Some(usage);
    }
}
