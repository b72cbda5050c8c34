//! Destination statistics: counters and gauges with hierarchical roll-up.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A counter that mirrors every change into its parent, so broker-level
/// statistics aggregate the per-destination ones.
#[derive(Clone, Debug, Default)]
pub struct Counter(Arc<CounterInner>);

#[derive(Debug, Default)]
struct CounterInner {
    count: AtomicI64,
    parent: Option<Counter>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parent(parent: &Counter) -> Self {
        Counter(Arc::new(CounterInner {
            count: AtomicI64::new(0),
            parent: Some(parent.clone()),
        }))
    }

    pub fn add(&self, delta: i64) {
        self.0.count.fetch_add(delta, Ordering::Relaxed);
        if let Some(parent) = &self.0.parent {
            parent.add(delta);
        }
    }

    pub fn increment(&self) {
        self.add(1);
    }

    pub fn decrement(&self) {
        self.add(-1);
    }

    pub fn count(&self) -> i64 {
        self.0.count.load(Ordering::Relaxed)
    }
}

/// The queue's exposed statistics: `enqueues` and `dequeues` are counters,
/// `messages` (depth) and `consumers` are gauges.
#[derive(Clone, Debug, Default)]
pub struct DestinationStatistics {
    pub enqueues: Counter,
    pub dequeues: Counter,
    pub messages: Counter,
    pub consumers: Counter,
}

impl DestinationStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parent(parent: &DestinationStatistics) -> Self {
        Self {
            enqueues: Counter::with_parent(&parent.enqueues),
            dequeues: Counter::with_parent(&parent.dequeues),
            messages: Counter::with_parent(&parent.messages),
            consumers: Counter::with_parent(&parent.consumers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changes_roll_up_to_parent() {
        let broker = DestinationStatistics::new();
        let queue_a = DestinationStatistics::with_parent(&broker);
        let queue_b = DestinationStatistics::with_parent(&broker);

        queue_a.enqueues.increment();
        queue_a.enqueues.increment();
        queue_b.enqueues.increment();
        queue_a.messages.increment();
        queue_a.messages.decrement();

        assert_eq!(queue_a.enqueues.count(), 2);
        assert_eq!(queue_b.enqueues.count(), 1);
        assert_eq!(broker.enqueues.count(), 3);
        assert_eq!(broker.messages.count(), 0);
    }
}
