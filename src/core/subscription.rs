//! Subscriptions: the consumer-facing sinks the queue dispatches into.
//!
//! The queue treats a subscription as opaque; the channel-backed
//! [`QueueSubscription`] here is the concrete consumer used by the broker
//! front-end and the tests. Each subscription maintains its own in-flight
//! window and prefetch credit.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::error::QueueError;
use crate::core::message::{Destination, Message, MessageId};
use crate::core::policy::LockArbiter;
use crate::core::queue::Queue;
use crate::core::reference::{LockOwner, MessageReference, OwnerId};
use crate::core::store::MessageStore;
use crate::core::transaction::ConnectionContext;

/// Unique identifier for a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerId(pub String);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConsumerId {
    fn from(s: String) -> Self {
        ConsumerId(s)
    }
}

impl From<&str> for ConsumerId {
    fn from(s: &str) -> Self {
        ConsumerId(s.to_string())
    }
}

/// Static description of a consumer: identity, credit, and capabilities.
#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub consumer_id: ConsumerId,
    pub prefetch_size: usize,
    pub priority: i32,
    pub exclusive: bool,
    pub browser: bool,
}

impl ConsumerInfo {
    pub fn new(consumer_id: impl Into<ConsumerId>) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            prefetch_size: 1000,
            priority: 0,
            exclusive: false,
            browser: false,
        }
    }

    pub fn with_prefetch(mut self, prefetch_size: usize) -> Self {
        self.prefetch_size = prefetch_size;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn browser(mut self) -> Self {
        self.browser = true;
        self
    }
}

/// Selector predicates are produced by an external parser; the engine only
/// evaluates them.
pub type SelectorPredicate = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Factory turning a selector expression into a predicate, raising
/// [`QueueError::InvalidSelector`] for malformed input.
pub type SelectorFactory = Arc<dyn Fn(&str) -> Result<SelectorPredicate, QueueError> + Send + Sync>;

/// Evaluation surroundings handed to `matches`: the queue identity plus
/// store access for lazily-loaded bodies.
pub struct MessageEvaluationContext<'a> {
    pub destination: &'a Destination,
    pub store: Option<&'a Arc<dyn MessageStore>>,
}

/// The sink contract the queue dispatches through.
pub trait Subscription: Send + Sync {
    fn info(&self) -> &ConsumerInfo;

    /// Selector and capability match; does not consume credit.
    fn matches(&self, node: &MessageReference, ctx: &MessageEvaluationContext<'_>) -> bool;

    /// Offers a reference. A consuming subscription takes the queue gate
    /// and the reference lock and spends one prefetch credit; a browser
    /// receives a non-destructive copy. Returns false when the offer is
    /// declined.
    fn add(&self, node: &Arc<MessageReference>, arbiter: &dyn LockArbiter) -> bool;

    /// Called when the subscription is attached to the queue.
    fn attached(&self, _ctx: &ConnectionContext, _destination: &Destination) {}

    /// Called when the subscription is detached from the queue.
    fn detached(&self, _ctx: &ConnectionContext, _destination: &Destination) {}
}

/// Channel-backed subscription delivering references to a consumer thread.
pub struct QueueSubscription {
    info: ConsumerInfo,
    selector: Option<SelectorPredicate>,
    dispatched: Mutex<Vec<Arc<MessageReference>>>,
    browsed: Mutex<HashSet<MessageId>>,
    sender: Sender<Arc<MessageReference>>,
}

impl QueueSubscription {
    pub fn new(info: ConsumerInfo) -> (Arc<Self>, Receiver<Arc<MessageReference>>) {
        Self::with_selector(info, None)
    }

    pub fn with_selector(
        info: ConsumerInfo,
        selector: Option<SelectorPredicate>,
    ) -> (Arc<Self>, Receiver<Arc<MessageReference>>) {
        let (sender, receiver) = unbounded();
        (
            Arc::new(Self {
                info,
                selector,
                dispatched: Mutex::new(Vec::new()),
                browsed: Mutex::new(HashSet::new()),
                sender,
            }),
            receiver,
        )
    }

    pub fn lock_owner(&self) -> LockOwner {
        LockOwner {
            id: OwnerId::Consumer(self.info.consumer_id.clone()),
            lock_priority: self.info.priority,
            exclusive: self.info.exclusive,
        }
    }

    /// Number of delivered-but-unacknowledged references.
    pub fn in_flight(&self) -> usize {
        self.dispatched.lock().len()
    }

    /// Completes delivery of `node`: store delete, tombstone, and credit
    /// release. Acknowledging an id that is not in flight is a no-op on
    /// the window and still idempotent against the store.
    pub fn acknowledge(
        &self,
        ctx: &ConnectionContext,
        queue: &Queue,
        node: &Arc<MessageReference>,
    ) -> Result<(), QueueError> {
        queue.message_consumed(ctx, node)?;
        self.dispatched
            .lock()
            .retain(|held| held.message_id() != node.message_id());
        queue.wakeup();
        Ok(())
    }
}

impl Subscription for QueueSubscription {
    fn info(&self) -> &ConsumerInfo {
        &self.info
    }

    fn matches(&self, node: &MessageReference, ctx: &MessageEvaluationContext<'_>) -> bool {
        if node.is_dropped() {
            return false;
        }
        let Some(selector) = &self.selector else {
            return true;
        };
        match node.message_or_load(ctx.store) {
            Ok(message) => selector(&message),
            Err(e) => {
                warn!(
                    consumer = %self.info.consumer_id,
                    "could not load message {}: {e}",
                    node.message_id()
                );
                false
            }
        }
    }

    fn add(&self, node: &Arc<MessageReference>, arbiter: &dyn LockArbiter) -> bool {
        if self.info.browser {
            // browsers see each reference once, without consuming it
            if !self.browsed.lock().insert(node.message_id()) {
                return false;
            }
            return self.sender.send(Arc::clone(node)).is_ok();
        }

        let mut window = self.dispatched.lock();
        if window.len() >= self.info.prefetch_size {
            return false;
        }
        if !arbiter.lock(node, &self.lock_owner()) {
            return false;
        }
        if !node.lock(&OwnerId::Consumer(self.info.consumer_id.clone())) {
            return false;
        }
        if self.sender.send(Arc::clone(node)).is_err() {
            node.unlock();
            return false;
        }
        window.push(Arc::clone(node));
        true
    }

    fn attached(&self, _ctx: &ConnectionContext, destination: &Destination) {
        debug!(consumer = %self.info.consumer_id, queue = %destination, "subscription attached");
    }

    fn detached(&self, _ctx: &ConnectionContext, destination: &Destination) {
        debug!(consumer = %self.info.consumer_id, queue = %destination, "subscription detached");
    }
}
