//! Paged-in message references: refcounted handles with a per-reference
//! consumer lock and a monotonic tombstone flag.
//!
//! A reference is either live (present in the paged-in set, not dropped),
//! tombstoned (present but dropped), or removed entirely by compaction.
//! Once dropped it is never delivered again.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::error::QueueError;
use crate::core::message::{Message, MessageId};
use crate::core::store::MessageStore;
use crate::core::subscription::ConsumerId;

/// Identity of an actor that may hold reference locks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerId {
    Consumer(ConsumerId),
    /// Administrative operations (purge, move) lock with this identity.
    Admin,
}

/// An actor competing for reference locks: a priority and an exclusivity
/// flag, arbitrated by the queue-wide gate.
#[derive(Debug, Clone)]
pub struct LockOwner {
    pub id: OwnerId,
    pub lock_priority: i32,
    pub exclusive: bool,
}

impl LockOwner {
    /// Owner used by administrative operations; outranks every consumer
    /// without ever claiming queue-wide exclusivity.
    pub fn high_priority() -> Self {
        Self {
            id: OwnerId::Admin,
            lock_priority: i32::MAX,
            exclusive: false,
        }
    }
}

#[derive(Debug)]
struct Body {
    reference_count: usize,
    message: Option<Arc<Message>>,
}

/// Handle to a paged-in message. The body of a persistent message is
/// released whenever the reference count reaches zero and reloaded from
/// the store on demand; non-persistent bodies stay cached since the store
/// cannot reproduce them.
#[derive(Debug)]
pub struct MessageReference {
    message_id: MessageId,
    group_id: Option<String>,
    expiration: u64,
    persistent: bool,
    size: usize,
    dropped: AtomicBool,
    redelivery_counter: AtomicU32,
    lock_owner: Mutex<Option<OwnerId>>,
    body: Mutex<Body>,
}

impl MessageReference {
    /// Wraps a freshly paged-in message. The new reference starts with a
    /// single count held by the caller.
    pub fn new(message: Arc<Message>) -> Self {
        Self {
            message_id: message.id,
            group_id: message.group_id.clone(),
            expiration: message.expiration,
            persistent: message.persistent,
            size: message.size(),
            dropped: AtomicBool::new(false),
            redelivery_counter: AtomicU32::new(0),
            lock_owner: Mutex::new(None),
            body: Mutex::new(Body {
                reference_count: 1,
                message: Some(message),
            }),
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_expired(&self) -> bool {
        self.expiration > 0 && crate::core::message::current_timestamp() >= self.expiration
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    /// Tombstones the reference. The flag is monotonic; a dropped
    /// reference is skipped by every delivery and admin path until
    /// compaction removes it.
    pub fn drop_message(&self) {
        self.dropped.store(true, Ordering::Release);
        if self.persistent {
            self.body.lock().message = None;
        }
    }

    pub fn redelivery_counter(&self) -> u32 {
        self.redelivery_counter.load(Ordering::Relaxed)
    }

    pub fn increment_redelivery_counter(&self) {
        self.redelivery_counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes the per-reference lock for `owner`. Fails on tombstoned or
    /// already-locked references, including re-acquisition by the current
    /// owner.
    pub fn lock(&self, owner: &OwnerId) -> bool {
        if self.is_dropped() {
            return false;
        }
        let mut guard = self.lock_owner.lock();
        if guard.is_some() {
            return false;
        }
        *guard = Some(owner.clone());
        true
    }

    pub fn unlock(&self) {
        *self.lock_owner.lock() = None;
    }

    pub fn lock_owner(&self) -> Option<OwnerId> {
        self.lock_owner.lock().clone()
    }

    pub fn increment_reference_count(&self) -> usize {
        let mut body = self.body.lock();
        body.reference_count += 1;
        body.reference_count
    }

    pub fn decrement_reference_count(&self) -> usize {
        let mut body = self.body.lock();
        body.reference_count = body.reference_count.saturating_sub(1);
        if body.reference_count == 0 && self.persistent {
            // the store can reproduce the body; let it go
            body.message = None;
        }
        body.reference_count
    }

    pub fn reference_count(&self) -> usize {
        self.body.lock().reference_count
    }

    /// Returns the cached body without touching the store.
    pub fn message(&self) -> Option<Arc<Message>> {
        self.body.lock().message.clone()
    }

    /// Returns the cached body, loading it from the store when it was
    /// evicted. The reload is cached only while somebody holds a count.
    pub fn message_or_load(
        &self,
        store: Option<&Arc<dyn MessageStore>>,
    ) -> Result<Arc<Message>, QueueError> {
        let mut body = self.body.lock();
        if let Some(message) = &body.message {
            return Ok(Arc::clone(message));
        }
        let store = store.ok_or(QueueError::LoadFailure(self.message_id))?;
        match store.get_message(self.message_id) {
            Ok(Some(message)) => {
                if body.reference_count > 0 {
                    body.message = Some(Arc::clone(&message));
                }
                Ok(message)
            }
            Ok(None) => Err(QueueError::LoadFailure(self.message_id)),
            Err(e) => Err(QueueError::Store(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Destination;
    use crate::core::store::InMemoryStore;
    use crate::core::transaction::ConnectionContext;

    fn reference(persistent: bool) -> MessageReference {
        let mut message = Message::new(Destination::queue("orders"), "payload");
        message.persistent = persistent;
        MessageReference::new(Arc::new(message))
    }

    #[test]
    fn lock_is_single_owner() {
        let node = reference(false);
        let c1 = OwnerId::Consumer(ConsumerId::from("c1"));
        let c2 = OwnerId::Consumer(ConsumerId::from("c2"));

        assert!(node.lock(&c1));
        assert!(!node.lock(&c2));
        assert!(!node.lock(&c1), "re-acquisition by the owner also fails");

        node.unlock();
        assert!(node.lock(&c2));
    }

    #[test]
    fn dropped_references_cannot_be_locked() {
        let node = reference(false);
        node.drop_message();
        assert!(node.is_dropped());
        assert!(!node.lock(&OwnerId::Admin));
    }

    #[test]
    fn persistent_body_is_released_at_zero_count_and_reloaded() {
        let store = InMemoryStore::new();
        let ctx = ConnectionContext::default();
        let message = Arc::new(
            Message::new(Destination::queue("orders"), "payload").persistent(),
        );
        store.add_message(&ctx, &message).unwrap();

        let node = MessageReference::new(Arc::clone(&message));
        assert!(node.message().is_some());

        node.decrement_reference_count();
        assert!(node.message().is_none(), "body evicted at count zero");

        let store: Arc<dyn MessageStore> = store;
        let loaded = node.message_or_load(Some(&store)).unwrap();
        assert_eq!(loaded.id, message.id);
    }

    #[test]
    fn non_persistent_body_survives_zero_count() {
        let node = reference(false);
        node.decrement_reference_count();
        assert!(node.message().is_some());
    }
}
