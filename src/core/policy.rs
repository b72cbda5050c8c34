//! Dispatch policy: chooses which subscription receives a paged-in
//! reference.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::reference::{LockOwner, MessageReference};
use crate::core::subscription::{ConsumerId, MessageEvaluationContext, Subscription};

/// Queue-side capabilities a dispatch needs: the queue-wide lock gate and
/// group ownership. The queue implements this; subscriptions receive it
/// per offer instead of holding a back-reference.
pub trait LockArbiter: Send + Sync {
    /// Arbitration for the queue-wide exclusive gate; granting may claim
    /// exclusivity for `owner`.
    fn lock(&self, node: &MessageReference, owner: &LockOwner) -> bool;

    fn group_owner(&self, group_id: &str) -> Option<ConsumerId>;

    fn bind_group(&self, group_id: &str, consumer: &ConsumerId);
}

/// Pure selection over (message, consumer list). Offers `node` to at most
/// one consuming subscription; browsers are fanned out non-destructively.
pub trait DispatchPolicy: Send + Sync {
    /// Returns whether a consuming subscription took the reference.
    fn dispatch(
        &self,
        node: &Arc<MessageReference>,
        ctx: &MessageEvaluationContext<'_>,
        consumers: &[Arc<dyn Subscription>],
        arbiter: &dyn LockArbiter,
    ) -> bool;
}

/// Default policy: exclusive subscriptions get first refusal, the rest
/// are offered round-robin. Group affinity binds on first dispatch and is
/// honored on every later one.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    next_start: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_offer(
        &self,
        node: &Arc<MessageReference>,
        ctx: &MessageEvaluationContext<'_>,
        sub: &Arc<dyn Subscription>,
        arbiter: &dyn LockArbiter,
    ) -> bool {
        if !sub.matches(node, ctx) {
            return false;
        }
        if let Some(group) = node.group_id() {
            if let Some(owner) = arbiter.group_owner(group) {
                if owner != sub.info().consumer_id {
                    return false;
                }
            }
        }
        if !sub.add(node, arbiter) {
            return false;
        }
        if let Some(group) = node.group_id() {
            arbiter.bind_group(group, &sub.info().consumer_id);
        }
        true
    }
}

impl DispatchPolicy for RoundRobinPolicy {
    fn dispatch(
        &self,
        node: &Arc<MessageReference>,
        ctx: &MessageEvaluationContext<'_>,
        consumers: &[Arc<dyn Subscription>],
        arbiter: &dyn LockArbiter,
    ) -> bool {
        if consumers.is_empty() {
            return false;
        }

        for sub in consumers.iter().filter(|s| s.info().browser) {
            if sub.matches(node, ctx) {
                sub.add(node, arbiter);
            }
        }

        for sub in consumers
            .iter()
            .filter(|s| s.info().exclusive && !s.info().browser)
        {
            if self.try_offer(node, ctx, sub, arbiter) {
                return true;
            }
        }

        let len = consumers.len();
        let start = self.next_start.load(Ordering::Relaxed) % len;
        for i in 0..len {
            let sub = &consumers[(start + i) % len];
            if sub.info().exclusive || sub.info().browser {
                continue;
            }
            if self.try_offer(node, ctx, sub, arbiter) {
                self.next_start.store((start + i + 1) % len, Ordering::Relaxed);
                return true;
            }
        }
        false
    }
}
