//! Message-group ownership: sticky consumer affinity per group-id.

use std::collections::HashSet;
use std::fmt;

use dashmap::DashMap;

use crate::core::subscription::ConsumerId;

/// Mapping of group-id to the consumer that owns it. All messages sharing
/// a group-id go to the owning consumer while it remains subscribed.
pub trait MessageGroupMap: Send + Sync + fmt::Debug {
    fn put(&self, group_id: &str, consumer: &ConsumerId);

    fn get(&self, group_id: &str) -> Option<ConsumerId>;

    /// Unbinds every group owned by `consumer`, returning the orphaned
    /// group ids so their in-flight messages can be re-offered.
    fn remove_consumer(&self, consumer: &ConsumerId) -> HashSet<String>;
}

pub trait MessageGroupMapFactory: Send + Sync {
    fn create(&self) -> Box<dyn MessageGroupMap>;
}

/// Hash-map backed group ownership.
#[derive(Debug, Default)]
pub struct GroupHashMap {
    owners: DashMap<String, ConsumerId>,
}

impl GroupHashMap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageGroupMap for GroupHashMap {
    fn put(&self, group_id: &str, consumer: &ConsumerId) {
        self.owners.insert(group_id.to_string(), consumer.clone());
    }

    fn get(&self, group_id: &str) -> Option<ConsumerId> {
        self.owners.get(group_id).map(|entry| entry.value().clone())
    }

    fn remove_consumer(&self, consumer: &ConsumerId) -> HashSet<String> {
        let mut orphaned = HashSet::new();
        self.owners.retain(|group, owner| {
            if *owner == *consumer {
                orphaned.insert(group.clone());
                false
            } else {
                true
            }
        });
        orphaned
    }
}

#[derive(Debug, Default)]
pub struct GroupHashMapFactory;

impl MessageGroupMapFactory for GroupHashMapFactory {
    fn create(&self) -> Box<dyn MessageGroupMap> {
        Box::new(GroupHashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_binding_sticks() {
        let groups = GroupHashMap::new();
        let c1 = ConsumerId::from("c1");
        groups.put("orders-17", &c1);
        assert_eq!(groups.get("orders-17"), Some(c1));
        assert_eq!(groups.get("unknown"), None);
    }

    #[test]
    fn remove_consumer_reports_orphaned_groups() {
        let groups = GroupHashMap::new();
        let c1 = ConsumerId::from("c1");
        let c2 = ConsumerId::from("c2");
        groups.put("a", &c1);
        groups.put("b", &c1);
        groups.put("c", &c2);

        let orphaned = groups.remove_consumer(&c1);
        assert_eq!(
            orphaned,
            HashSet::from(["a".to_string(), "b".to_string()])
        );
        assert_eq!(groups.get("a"), None);
        assert_eq!(groups.get("c"), Some(c2));
    }
}
