//! The queue coordinator: accepts producer sends into the pending cursor,
//! pages a bounded working set into memory, and dispatches each message
//! to exactly one of possibly many competing subscribers.
//!
//! Backpressure has three layers: the usage accountant gates sends, the
//! paged-in bound gates paging (spill stays in the cursor), and prefetch
//! credit gates dispatch (unsatisfied references stay paged in until a
//! later tick re-offers them).

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::config::EngineConfig;
use crate::core::cursor::{PendingCursor, VmCursor};
use crate::core::dead_letter::{DeadLetterStrategy, SharedDeadLetterStrategy};
use crate::core::error::{CursorError, QueueError};
use crate::core::group::{GroupHashMapFactory, MessageGroupMap, MessageGroupMapFactory};
use crate::core::message::{Destination, Message, MessageAck, MessageId};
use crate::core::policy::{DispatchPolicy, LockArbiter, RoundRobinPolicy};
use crate::core::reference::{LockOwner, MessageReference, OwnerId};
use crate::core::stats::DestinationStatistics;
use crate::core::store::{MessageRecoveryListener, MessageStore};
use crate::core::subscription::{
    ConsumerId, MessageEvaluationContext, SelectorFactory, SelectorPredicate, Subscription,
};
use crate::core::task::{DedicatedTaskRunner, Task};
use crate::core::transaction::{ConnectionContext, Synchronization};
use crate::core::usage::UsageAccountant;
use crate::core::valve::DispatchValve;

/// Predicate the administrative operations evaluate against each paged-in
/// reference, with the body loaded under reference-count protection.
pub trait MessageReferenceFilter: Send + Sync {
    fn evaluate(&self, message: &Message) -> bool;
}

impl<F> MessageReferenceFilter for F
where
    F: Fn(&Message) -> bool + Send + Sync,
{
    fn evaluate(&self, message: &Message) -> bool {
        self(message)
    }
}

/// Filter matching exactly one message id.
pub fn message_id_filter(id: MessageId) -> impl MessageReferenceFilter {
    move |message: &Message| message.id == id
}

/// Hands a message body to the broker for delivery to another destination.
/// Copy, move, and dead-letter paths route through this seam.
pub trait MessageResender: Send + Sync {
    fn resend(
        &self,
        ctx: &ConnectionContext,
        message: &Message,
        destination: &Destination,
    ) -> Result<(), QueueError>;
}

/// Stand-in resender for engines running without a broker around them.
#[derive(Debug, Default)]
pub struct DiscardingResender;

impl MessageResender for DiscardingResender {
    fn resend(
        &self,
        _ctx: &ConnectionContext,
        message: &Message,
        destination: &Destination,
    ) -> Result<(), QueueError> {
        warn!(
            "no resender configured; dropping message {} bound for {destination}",
            message.id
        );
        Ok(())
    }
}

/// Pluggable collaborators and their defaults.
pub struct QueueSettings {
    pub policy: Box<dyn DispatchPolicy>,
    pub cursor: Box<dyn PendingCursor>,
    pub group_map_factory: Box<dyn MessageGroupMapFactory>,
    pub dead_letter: Box<dyn DeadLetterStrategy>,
    pub resender: Arc<dyn MessageResender>,
    pub selector_factory: Option<SelectorFactory>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            policy: Box::new(RoundRobinPolicy::new()),
            cursor: Box::new(VmCursor::new()),
            group_map_factory: Box::new(GroupHashMapFactory),
            dead_letter: Box::new(SharedDeadLetterStrategy::default()),
            resender: Arc::new(DiscardingResender),
            selector_factory: None,
        }
    }
}

#[derive(Default)]
struct PagedIn {
    list: Vec<Arc<MessageReference>>,
    garbage_size: usize,
}

struct ExclusiveGate {
    owner: Option<OwnerId>,
    highest_priority: i32,
}

/// One point-to-point queue.
pub struct Queue {
    destination: Destination,
    statistics: DestinationStatistics,
    usage: Arc<UsageAccountant>,
    store: Option<Arc<dyn MessageStore>>,
    consumers: Mutex<Arc<Vec<Arc<dyn Subscription>>>>,
    dispatch_valve: DispatchValve,
    /// The pending cursor mutex; every cursor operation happens under it.
    messages: Mutex<Box<dyn PendingCursor>>,
    paged_in: Mutex<PagedIn>,
    exclusive_gate: Mutex<ExclusiveGate>,
    group_owners: Box<dyn MessageGroupMap>,
    policy: Box<dyn DispatchPolicy>,
    dead_letter: Box<dyn DeadLetterStrategy>,
    resender: Arc<dyn MessageResender>,
    selector_factory: Option<SelectorFactory>,
    max_paged_in: AtomicI64,
    gc_threshold: usize,
    /// Serializes page-then-dispatch cycles so two concurrent passes do
    /// not re-offer the same window out of order.
    do_dispatch: Mutex<()>,
    task_runner: DedicatedTaskRunner,
    /// Handle to this queue for commit-time synchronizations.
    self_ref: Weak<Queue>,
}

impl Queue {
    pub fn new(
        destination: Destination,
        config: &EngineConfig,
        broker_usage: Option<&Arc<UsageAccountant>>,
        store: Option<Arc<dyn MessageStore>>,
        parent_stats: Option<&DestinationStatistics>,
        settings: QueueSettings,
    ) -> Arc<Self> {
        let usage = match broker_usage {
            Some(parent) => UsageAccountant::with_parent(parent, config.memory.limit_bytes),
            None => UsageAccountant::new(config.memory.limit_bytes),
        };
        usage.set_send_fail_if_no_space(config.memory.send_fail_if_no_space);
        if let Some(store) = &store {
            store.set_usage_accountant(Arc::clone(&usage));
        }
        let statistics = match parent_stats {
            Some(parent) => DestinationStatistics::with_parent(parent),
            None => DestinationStatistics::new(),
        };
        let runner_name = format!("queue-{}", destination.name());

        Arc::new_cyclic(|weak: &Weak<Queue>| {
            let task: Weak<dyn Task> = weak.clone() as Weak<dyn Task>;
            Queue {
                destination,
                statistics,
                usage,
                store,
                consumers: Mutex::new(Arc::new(Vec::new())),
                dispatch_valve: DispatchValve::new(true),
                messages: Mutex::new(settings.cursor),
                paged_in: Mutex::new(PagedIn::default()),
                exclusive_gate: Mutex::new(ExclusiveGate {
                    owner: None,
                    highest_priority: i32::MIN,
                }),
                group_owners: settings.group_map_factory.create(),
                policy: settings.policy,
                dead_letter: settings.dead_letter,
                resender: settings.resender,
                selector_factory: settings.selector_factory,
                max_paged_in: AtomicI64::new(config.queue.max_paged_in as i64),
                gc_threshold: config.queue.gc_threshold,
                do_dispatch: Mutex::new(()),
                task_runner: DedicatedTaskRunner::new(task, &runner_name),
                self_ref: weak.clone(),
            }
        })
    }

    /// Starts the cursor and, when durable state awaits, merges the store
    /// replay into it. Messages that expired while stored are discarded.
    pub fn initialize(&self) -> Result<(), QueueError> {
        let recovery_required = {
            let mut cursor = self.messages.lock();
            cursor.start()?;
            cursor.is_recovery_required()
        };
        if let Some(store) = &self.store {
            if recovery_required {
                struct RecoveryMerge<'a> {
                    queue: &'a Queue,
                }
                impl MessageRecoveryListener for RecoveryMerge<'_> {
                    fn recover_message(&mut self, mut message: Message) {
                        if message.is_expired() {
                            debug!("discarding message {} that expired while stored", message.id);
                            return;
                        }
                        message.region_destination = Some(self.queue.destination.clone());
                        let size = message.size() as u64;
                        let appended = {
                            let mut cursor = self.queue.messages.lock();
                            cursor.add_message_last(Arc::new(message))
                        };
                        match appended {
                            Ok(()) => {
                                self.queue.usage.increase(size);
                                self.queue.statistics.messages.increment();
                            }
                            Err(e) => error!("failed to add recovered message to cursor: {e}"),
                        }
                    }
                }
                store.recover(&mut RecoveryMerge { queue: self })?;
            }
        }
        Ok(())
    }

    pub fn start(&self) -> Result<(), QueueError> {
        Ok(())
    }

    /// Completes the in-flight paging pass and stops the task runner.
    pub fn stop(&self) {
        self.task_runner.shutdown();
    }

    /// Destroys all durable state for this queue.
    pub fn dispose(&self, ctx: &ConnectionContext) -> Result<(), QueueError> {
        if let Some(store) = &self.store {
            store.remove_all_messages(ctx)?;
        }
        Ok(())
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn statistics(&self) -> &DestinationStatistics {
        &self.statistics
    }

    pub fn usage(&self) -> &Arc<UsageAccountant> {
        &self.usage
    }

    pub fn store(&self) -> Option<&Arc<dyn MessageStore>> {
        self.store.as_ref()
    }

    /// Current size of the in-memory working set, tombstones included.
    pub fn paged_in_count(&self) -> usize {
        self.paged_in.lock().list.len()
    }

    /// Backlog still sitting in the pending cursor.
    pub fn pending_count(&self) -> usize {
        self.messages.lock().size()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    /// Schedules a background paging pass.
    pub fn wakeup(&self) {
        self.task_runner.wakeup();
    }

    // Producer path
    // ---------------------------------------------------------------

    /// Accepts a message from a producer. Expired messages are discarded
    /// silently; under producer flow control a full accountant either
    /// raises [`QueueError::ResourceExhausted`] (fail-fast) or blocks
    /// until space frees, re-checking expiration on unblock.
    pub fn send(&self, ctx: &ConnectionContext, mut message: Message) -> Result<(), QueueError> {
        // delay between the producer sending and the message arriving
        // here may already have expired it
        if message.is_expired() {
            debug!("discarding expired message {}", message.id);
            return Ok(());
        }
        if ctx.is_producer_flow_control() {
            if self.usage.is_send_fail_if_no_space() && self.usage.is_full() {
                return Err(QueueError::ResourceExhausted(
                    self.destination.name().to_string(),
                ));
            }
            if !self.usage.wait_for_space_while(|| message.is_expired()) {
                return Ok(());
            }
            // the accountant may have delayed us past the expiration
            if message.is_expired() {
                return Ok(());
            }
        }
        message.region_destination = Some(self.destination.clone());
        let message = Arc::new(message);
        if message.persistent {
            if let Some(store) = &self.store {
                store.add_message(ctx, &message)?;
            }
        }
        if let Some(tx) = ctx.transaction() {
            if let Some(queue) = self.self_ref.upgrade() {
                tx.add_synchronization(Box::new(SendSynchronization { queue, message }));
            }
        } else {
            self.send_message(message)?;
        }
        Ok(())
    }

    fn send_message(&self, message: Arc<Message>) -> Result<(), QueueError> {
        let size = message.size() as u64;
        {
            let mut cursor = self.messages.lock();
            let mut attempt = 0;
            loop {
                match cursor.add_message_last(Arc::clone(&message)) {
                    Ok(()) => break,
                    Err(CursorError::Transient(reason)) if attempt < 2 => {
                        attempt += 1;
                        warn!("retrying cursor append for message {}: {reason}", message.id);
                    }
                    Err(e) => {
                        // the entry is lost to this cursor; the depth
                        // gauge stays untouched
                        error!("failed to add message {} to cursor: {e}", message.id);
                        return Ok(());
                    }
                }
            }
        }
        self.usage.increase(size);
        self.statistics.enqueues.increment();
        self.statistics.messages.increment();
        self.page_in_messages(false)
    }

    // Subscription topology
    // ---------------------------------------------------------------

    pub fn add_subscription(
        &self,
        ctx: &ConnectionContext,
        sub: Arc<dyn Subscription>,
    ) -> Result<(), QueueError> {
        sub.attached(ctx, &self.destination);
        self.statistics.consumers.increment();
        self.max_paged_in
            .fetch_add(sub.info().prefetch_size as i64, Ordering::SeqCst);

        {
            let mut consumers = self.consumers.lock();
            let mut list = (**consumers).clone();
            if sub.info().exclusive {
                // front of the list, so the policy sees the exclusive
                // consumer before any competing one
                list.insert(0, Arc::clone(&sub));
            } else {
                list.push(Arc::clone(&sub));
            }
            *consumers = Arc::new(list);
        }

        // Paging before the valve goes down means a dispatch already in
        // flight may run without seeing this subscription; the re-offer
        // below repairs anything it missed.
        self.page_in_messages(true)?;

        self.dispatch_valve.turn_off();
        {
            let mut gate = self.exclusive_gate.lock();
            if sub.info().priority > gate.highest_priority {
                gate.highest_priority = sub.info().priority;
            }
        }
        let eval = MessageEvaluationContext {
            destination: &self.destination,
            store: self.store.as_ref(),
        };
        {
            let paged = self.paged_in.lock();
            for node in paged.list.iter() {
                if node.is_dropped() {
                    continue;
                }
                if let Some(group) = node.group_id() {
                    // groups stay glued to their owning consumer
                    if self
                        .group_owners
                        .get(group)
                        .is_some_and(|owner| owner != sub.info().consumer_id)
                    {
                        continue;
                    }
                }
                if sub.matches(node, &eval) && sub.add(node, self) {
                    if let Some(group) = node.group_id() {
                        self.group_owners.put(group, &sub.info().consumer_id);
                    }
                }
            }
        }
        self.dispatch_valve.turn_on();
        Ok(())
    }

    pub fn remove_subscription(
        &self,
        ctx: &ConnectionContext,
        sub: &Arc<dyn Subscription>,
    ) -> Result<(), QueueError> {
        self.statistics.consumers.decrement();
        self.max_paged_in
            .fetch_sub(sub.info().prefetch_size as i64, Ordering::SeqCst);

        self.dispatch_valve.turn_off();

        let consumer_id = sub.info().consumer_id.clone();
        {
            let mut consumers = self.consumers.lock();
            let list: Vec<_> = consumers
                .iter()
                .filter(|s| s.info().consumer_id != consumer_id)
                .cloned()
                .collect();
            *consumers = Arc::new(list);
        }
        sub.detached(ctx, &self.destination);

        let highest = self.calc_highest_subscription_priority();
        let was_exclusive_owner = {
            let mut gate = self.exclusive_gate.lock();
            gate.highest_priority = highest;
            if gate.owner == Some(OwnerId::Consumer(consumer_id.clone())) {
                gate.owner = None;
                true
            } else {
                false
            }
        };

        let orphaned_groups = self.group_owners.remove_consumer(&consumer_id);

        if !sub.info().browser {
            // copy first: dispatching while holding the paged-in mutex
            // would re-enter it through the offer path
            let to_dispatch: Vec<_> = {
                let paged = self.paged_in.lock();
                paged
                    .list
                    .iter()
                    .filter(|node| {
                        if node.is_dropped() {
                            return false;
                        }
                        let locked_by_sub =
                            node.lock_owner() == Some(OwnerId::Consumer(consumer_id.clone()));
                        let orphaned = node
                            .group_id()
                            .is_some_and(|group| orphaned_groups.contains(group));
                        locked_by_sub || was_exclusive_owner || orphaned
                    })
                    .cloned()
                    .collect()
            };
            let consumers = self.consumers_snapshot();
            let eval = MessageEvaluationContext {
                destination: &self.destination,
                store: self.store.as_ref(),
            };
            for node in to_dispatch {
                node.increment_redelivery_counter();
                node.unlock();
                self.policy.dispatch(&node, &eval, &consumers, self);
            }
        }

        self.dispatch_valve.turn_on();
        Ok(())
    }

    fn calc_highest_subscription_priority(&self) -> i32 {
        self.consumers_snapshot()
            .iter()
            .map(|sub| sub.info().priority)
            .max()
            .unwrap_or(i32::MIN)
    }

    fn consumers_snapshot(&self) -> Arc<Vec<Arc<dyn Subscription>>> {
        Arc::clone(&self.consumers.lock())
    }

    // Locking
    // ---------------------------------------------------------------

    /// Queue-wide lock arbitration, checked in order: the current
    /// exclusive owner is re-granted; any other owner is denied while an
    /// exclusive owner exists; owners below the highest subscription
    /// priority are denied (the message is held for the better consumer);
    /// an exclusive owner claims the queue on first grant.
    pub fn lock(&self, _node: &MessageReference, owner: &LockOwner) -> bool {
        let mut gate = self.exclusive_gate.lock();
        if let Some(current) = &gate.owner {
            return *current == owner.id;
        }
        if owner.lock_priority < gate.highest_priority {
            return false;
        }
        if owner.exclusive {
            gate.owner = Some(owner.id.clone());
        }
        true
    }

    // Acknowledgement and drop bookkeeping
    // ---------------------------------------------------------------

    /// Durable delete for an acknowledged reference. A ranged ack is
    /// narrowed to the one concrete reference being acknowledged; ranges
    /// spanning several references are the caller's loop.
    pub fn acknowledge(
        &self,
        ctx: &ConnectionContext,
        ack: &MessageAck,
        node: &MessageReference,
    ) -> Result<(), QueueError> {
        if let Some(store) = &self.store {
            if node.is_persistent() {
                let single = if ack.is_ranged() {
                    ack.to_single(node.message_id())
                } else {
                    ack.clone()
                };
                store.remove_message(ctx, &single)?;
            }
        }
        Ok(())
    }

    /// Completes consumer delivery of `node`: store delete, unlock,
    /// tombstone, and statistics.
    pub fn message_consumed(
        &self,
        ctx: &ConnectionContext,
        node: &Arc<MessageReference>,
    ) -> Result<(), QueueError> {
        let ack = MessageAck::standard(self.destination.clone(), node.message_id());
        self.acknowledge(ctx, &ack, node)?;
        node.unlock();
        node.drop_message();
        self.statistics.dequeues.increment();
        self.drop_event(node, false);
        Ok(())
    }

    /// Notes a tombstoned reference: depth and memory bookkeeping plus
    /// the compaction trigger. Expirations come through here too, so the
    /// depth gauge stays honest.
    fn drop_event(&self, node: &MessageReference, skip_gc: bool) {
        self.statistics.messages.decrement();
        self.usage.decrease(node.size() as u64);
        let garbage = {
            let mut paged = self.paged_in.lock();
            paged.garbage_size += 1;
            paged.garbage_size
        };
        if !skip_gc && garbage > self.gc_threshold {
            self.gc();
        }
    }

    /// Compacts tombstoned references out of the paged-in set, then asks
    /// the task runner to resume paging into the freed room.
    pub fn gc(&self) {
        {
            let mut paged = self.paged_in.lock();
            let before = paged.list.len();
            paged.list.retain(|node| !node.is_dropped());
            let removed = before - paged.list.len();
            paged.garbage_size = paged.garbage_size.saturating_sub(removed);
        }
        self.task_runner.wakeup();
    }

    fn message_expired(&self, node: &Arc<MessageReference>) {
        debug!("message {} expired before dispatch", node.message_id());
        node.increment_reference_count();
        match node.message_or_load(self.store.as_ref()) {
            Ok(message) => {
                if self.dead_letter.send_to_dead_letter_queue(&message) {
                    let dlq = self.dead_letter.dead_letter_destination(&message);
                    let ctx = ConnectionContext::default();
                    if let Err(e) = self.resender.resend(&ctx, &message, &dlq) {
                        warn!("failed to dead-letter message {}: {e}", node.message_id());
                    }
                }
            }
            Err(e) => warn!(
                "could not load expired message {}: {e}",
                node.message_id()
            ),
        }
        node.decrement_reference_count();
        if node.is_persistent() {
            let ctx = ConnectionContext::default();
            let ack = MessageAck::standard(self.destination.clone(), node.message_id());
            if let Err(e) = self.acknowledge(&ctx, &ack, node) {
                warn!(
                    "failed to remove expired message {} from the store: {e}",
                    node.message_id()
                );
            }
        }
        node.drop_message();
        self.drop_event(node, false);
    }

    // Paging and dispatch
    // ---------------------------------------------------------------

    /// One cooperative page-then-dispatch cycle. Serialized so concurrent
    /// cycles cannot re-offer the same window out of order.
    fn page_in_messages(&self, force: bool) -> Result<(), QueueError> {
        let _cycle = self.do_dispatch.lock();
        self.do_page_in(force)?;
        self.do_dispatch()
    }

    /// Draws from the pending cursor into the paged-in set, up to the
    /// working-set bound. Without `force`, an empty consumer list skips
    /// the pass entirely.
    fn do_page_in(&self, force: bool) -> Result<(), QueueError> {
        let to_page = self.max_paged_in.load(Ordering::SeqCst)
            - self.paged_in.lock().list.len() as i64;
        if to_page <= 0 {
            return Ok(());
        }
        if !force && self.consumers_snapshot().is_empty() {
            return Ok(());
        }

        self.dispatch_valve.increment();
        let mut result = Vec::new();
        {
            let mut cursor = self.messages.lock();
            cursor.reset();
            let mut count = 0i64;
            while cursor.has_next() && count < to_page {
                let Some(message) = cursor.next() else { break };
                cursor.remove();
                let node = Arc::new(MessageReference::new(message));
                // only explicit holders keep the body pinned
                node.decrement_reference_count();
                result.push(node);
                count += 1;
            }
        }
        if !result.is_empty() {
            self.paged_in.lock().list.extend(result);
        }
        self.dispatch_valve.decrement();
        Ok(())
    }

    /// Walks the paged-in set in order, skipping tombstoned and in-flight
    /// references, and offers the rest through the policy; a repeat walk
    /// after an acknowledgement or a new subscriber picks up exactly the
    /// ones still waiting for credit. Expiration is applied only to
    /// references nobody holds.
    fn do_dispatch(&self) -> Result<(), QueueError> {
        let batch: Vec<_> = {
            let paged = self.paged_in.lock();
            paged.list.iter().cloned().collect()
        };
        if batch.is_empty() {
            return Ok(());
        }
        self.dispatch_valve.increment();
        let consumers = self.consumers_snapshot();
        let eval = MessageEvaluationContext {
            destination: &self.destination,
            store: self.store.as_ref(),
        };
        for node in &batch {
            if node.is_dropped() {
                continue;
            }
            // a locked reference is in flight; it belongs to its holder
            // until acknowledgement or redelivery unlocks it
            if node.lock_owner().is_some() {
                continue;
            }
            if node.is_expired() {
                self.message_expired(node);
                continue;
            }
            self.policy.dispatch(node, &eval, &consumers, self);
        }
        self.dispatch_valve.decrement();
        Ok(())
    }

    // Administrative surface
    // ---------------------------------------------------------------

    /// Snapshot of every live body: the paged-in set first, then the
    /// pending cursor walked to its end. Individual load failures are
    /// logged and skipped.
    pub fn browse(&self) -> Vec<Arc<Message>> {
        let mut result = Vec::new();
        {
            let paged = self.paged_in.lock();
            for node in paged.list.iter() {
                if node.is_dropped() {
                    continue;
                }
                node.increment_reference_count();
                match node.message_or_load(self.store.as_ref()) {
                    Ok(message) => result.push(message),
                    Err(e) => error!(
                        "caught an exception browsing {}: {e}",
                        node.message_id()
                    ),
                }
                node.decrement_reference_count();
            }
        }
        {
            let mut cursor = self.messages.lock();
            cursor.reset();
            while cursor.has_next() {
                if let Some(message) = cursor.next() {
                    result.push(message);
                }
            }
        }
        result
    }

    /// Looks a message up in the pending backlog; paged-in references are
    /// not consulted.
    pub fn get_message(&self, id: MessageId) -> Option<Arc<Message>> {
        let mut cursor = self.messages.lock();
        cursor.reset();
        while cursor.has_next() {
            match cursor.next() {
                Some(message) if message.id == id => return Some(message),
                _ => {}
            }
        }
        None
    }

    /// Fetches a body straight from the store.
    pub fn load_message(&self, id: MessageId) -> Result<Option<Arc<Message>>, QueueError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        Ok(store.get_message(id)?)
    }

    /// Deletes every reference that can be locked away from live
    /// consumers. Compaction runs once at the end instead of per drop.
    pub fn purge(&self) -> Result<usize, QueueError> {
        self.page_in_messages(true)?;
        let ctx = ConnectionContext::default();
        let admin = LockOwner::high_priority();
        let nodes = self.paged_in_snapshot();
        let mut purged = 0;
        for node in &nodes {
            if node.is_dropped() {
                continue;
            }
            if !self.lock(node, &admin) || !node.lock(&admin.id) {
                continue;
            }
            let ack = MessageAck::standard(self.destination.clone(), node.message_id());
            if let Err(e) = self.acknowledge(&ctx, &ack, node) {
                warn!("failed to purge message {}: {e}", node.message_id());
                node.unlock();
                continue;
            }
            node.drop_message();
            self.drop_event(node, true);
            purged += 1;
        }
        self.gc();
        Ok(purged)
    }

    /// Removes the message matching the given id.
    pub fn remove_message(&self, id: MessageId) -> Result<bool, QueueError> {
        Ok(self.remove_matching(&message_id_filter(id), 1)? > 0)
    }

    /// Removes messages matching `filter`, up to `maximum` when it is
    /// positive. Per-reference failures are logged and skipped; the
    /// returned count reflects successes only.
    pub fn remove_matching(
        &self,
        filter: &dyn MessageReferenceFilter,
        maximum: i64,
    ) -> Result<usize, QueueError> {
        self.page_in_messages(true)?;
        let ctx = ConnectionContext::default();
        let nodes = self.paged_in_snapshot();
        let mut counter = 0usize;
        for node in &nodes {
            if node.is_dropped() {
                continue;
            }
            match self.evaluate_filter(filter, node) {
                Ok(false) => continue,
                Ok(true) => {
                    if let Err(e) = self.remove_node(&ctx, node) {
                        warn!("failed to remove message {}: {e}", node.message_id());
                        continue;
                    }
                    counter += 1;
                    if maximum > 0 && counter as i64 >= maximum {
                        break;
                    }
                }
                Err(e) => {
                    warn!("skipping reference {}: {e}", node.message_id());
                }
            }
        }
        Ok(counter)
    }

    /// Removes messages matching a selector expression.
    pub fn remove_matching_selector(
        &self,
        selector: &str,
        maximum: i64,
    ) -> Result<usize, QueueError> {
        let filter = self.create_selector_filter(selector)?;
        self.remove_matching(&filter, maximum)
    }

    /// Copies the message matching the given id to `destination`.
    pub fn copy_message_to(
        &self,
        ctx: &ConnectionContext,
        id: MessageId,
        destination: &Destination,
    ) -> Result<bool, QueueError> {
        Ok(self.copy_matching(ctx, &message_id_filter(id), destination, 1)? > 0)
    }

    /// Copies matching messages to `destination`, up to `maximum` when it
    /// is positive. The originals stay in place.
    pub fn copy_matching(
        &self,
        ctx: &ConnectionContext,
        filter: &dyn MessageReferenceFilter,
        destination: &Destination,
        maximum: i64,
    ) -> Result<usize, QueueError> {
        self.page_in_messages(true)?;
        let nodes = self.paged_in_snapshot();
        let mut counter = 0usize;
        for node in &nodes {
            if node.is_dropped() {
                continue;
            }
            match self.evaluate_filter(filter, node) {
                Ok(false) => continue,
                Ok(true) => {
                    node.increment_reference_count();
                    let outcome = node
                        .message_or_load(self.store.as_ref())
                        .and_then(|message| self.resender.resend(ctx, &message, destination));
                    node.decrement_reference_count();
                    match outcome {
                        Ok(()) => {
                            counter += 1;
                            if maximum > 0 && counter as i64 >= maximum {
                                break;
                            }
                        }
                        Err(e) => warn!("failed to copy message {}: {e}", node.message_id()),
                    }
                }
                Err(e) => warn!("skipping reference {}: {e}", node.message_id()),
            }
        }
        Ok(counter)
    }

    pub fn copy_matching_selector(
        &self,
        ctx: &ConnectionContext,
        selector: &str,
        destination: &Destination,
        maximum: i64,
    ) -> Result<usize, QueueError> {
        let filter = self.create_selector_filter(selector)?;
        self.copy_matching(ctx, &filter, destination, maximum)
    }

    /// Moves the message matching the given id to `destination`.
    pub fn move_message_to(
        &self,
        ctx: &ConnectionContext,
        id: MessageId,
        destination: &Destination,
    ) -> Result<bool, QueueError> {
        Ok(self.move_matching(ctx, &message_id_filter(id), destination, 1)? > 0)
    }

    /// Moves matching messages to `destination`: lock, copy, then remove.
    /// References held by live consumers are skipped.
    pub fn move_matching(
        &self,
        ctx: &ConnectionContext,
        filter: &dyn MessageReferenceFilter,
        destination: &Destination,
        maximum: i64,
    ) -> Result<usize, QueueError> {
        self.page_in_messages(true)?;
        let admin = LockOwner::high_priority();
        let nodes = self.paged_in_snapshot();
        let mut counter = 0usize;
        for node in &nodes {
            if node.is_dropped() {
                continue;
            }
            match self.evaluate_filter(filter, node) {
                Ok(false) => continue,
                Ok(true) => {
                    if !self.lock(node, &admin) || !node.lock(&admin.id) {
                        continue;
                    }
                    node.increment_reference_count();
                    let outcome = node
                        .message_or_load(self.store.as_ref())
                        .and_then(|message| self.resender.resend(ctx, &message, destination));
                    node.decrement_reference_count();
                    match outcome {
                        Ok(()) => {
                            if let Err(e) = self.remove_node(ctx, node) {
                                warn!(
                                    "message {} copied to {destination} but not removed: {e}",
                                    node.message_id()
                                );
                                continue;
                            }
                            counter += 1;
                            if maximum > 0 && counter as i64 >= maximum {
                                break;
                            }
                        }
                        Err(e) => {
                            node.unlock();
                            warn!("failed to move message {}: {e}", node.message_id());
                        }
                    }
                }
                Err(e) => warn!("skipping reference {}: {e}", node.message_id()),
            }
        }
        Ok(counter)
    }

    pub fn move_matching_selector(
        &self,
        ctx: &ConnectionContext,
        selector: &str,
        destination: &Destination,
        maximum: i64,
    ) -> Result<usize, QueueError> {
        let filter = self.create_selector_filter(selector)?;
        self.move_matching(ctx, &filter, destination, maximum)
    }

    fn paged_in_snapshot(&self) -> Vec<Arc<MessageReference>> {
        self.paged_in.lock().list.clone()
    }

    fn evaluate_filter(
        &self,
        filter: &dyn MessageReferenceFilter,
        node: &Arc<MessageReference>,
    ) -> Result<bool, QueueError> {
        node.increment_reference_count();
        let result = node
            .message_or_load(self.store.as_ref())
            .map(|message| filter.evaluate(&message));
        node.decrement_reference_count();
        result
    }

    fn remove_node(
        &self,
        ctx: &ConnectionContext,
        node: &Arc<MessageReference>,
    ) -> Result<(), QueueError> {
        let ack = MessageAck::standard(self.destination.clone(), node.message_id());
        self.acknowledge(ctx, &ack, node)?;
        node.drop_message();
        self.drop_event(node, false);
        Ok(())
    }

    fn create_selector_filter(&self, selector: &str) -> Result<SelectorFilter, QueueError> {
        let factory = self.selector_factory.as_ref().ok_or_else(|| {
            QueueError::InvalidSelector("no selector factory configured".to_string())
        })?;
        Ok(SelectorFilter {
            predicate: factory(selector)?,
        })
    }
}

impl LockArbiter for Queue {
    fn lock(&self, node: &MessageReference, owner: &LockOwner) -> bool {
        Queue::lock(self, node, owner)
    }

    fn group_owner(&self, group_id: &str) -> Option<ConsumerId> {
        self.group_owners.get(group_id)
    }

    fn bind_group(&self, group_id: &str, consumer: &ConsumerId) {
        self.group_owners.put(group_id, consumer);
    }
}

impl Task for Queue {
    fn iterate(&self) -> bool {
        if let Err(e) = self.page_in_messages(false) {
            error!("failed to page in more queue messages: {e}");
        }
        false
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // depth is read under the cursor mutex only; paged-in entries are
        // not counted, so the reported size is approximate
        let size = self.messages.lock().size();
        write!(
            f,
            "Queue: destination={}, subscriptions={}, memory={}%, size={}",
            self.destination,
            self.consumer_count(),
            self.usage.percent_usage(),
            size
        )
    }
}

struct SelectorFilter {
    predicate: SelectorPredicate,
}

impl MessageReferenceFilter for SelectorFilter {
    fn evaluate(&self, message: &Message) -> bool {
        (self.predicate)(message)
    }
}

/// Transactional send: the cursor append waits for the commit, and a
/// commit arriving after the expiration enqueues nothing.
struct SendSynchronization {
    queue: Arc<Queue>,
    message: Arc<Message>,
}

impl Synchronization for SendSynchronization {
    fn after_commit(&self) -> Result<(), QueueError> {
        if self.message.is_expired() {
            return Ok(());
        }
        self.queue.send_message(Arc::clone(&self.message))
    }
}
