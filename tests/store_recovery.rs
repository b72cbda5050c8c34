use std::sync::Arc;
use std::time::Duration;

use relaymq::config::EngineConfig;
use relaymq::core::message::{current_timestamp, Destination, Message, MessageAck, MessageId};
use relaymq::core::queue::{Queue, QueueSettings};
use relaymq::core::reference::MessageReference;
use relaymq::core::store::{InMemoryStore, MessageStore};
use relaymq::core::subscription::{ConsumerInfo, QueueSubscription, Subscription};
use relaymq::core::transaction::ConnectionContext;

mod common;

fn new_queue(store: &Arc<InMemoryStore>) -> Arc<Queue> {
    common::init_logging();
    Queue::new(
        Destination::queue("orders"),
        &EngineConfig::default(),
        None,
        Some(Arc::clone(store) as Arc<dyn MessageStore>),
        None,
        QueueSettings::default(),
    )
}

fn msg(id: u64) -> Message {
    Message::new(Destination::queue("orders"), "payload")
        .with_id(MessageId(id))
        .persistent()
}

#[test]
fn unacknowledged_messages_survive_a_restart() {
    let store = InMemoryStore::new();
    let ctx = ConnectionContext::default();

    let queue = new_queue(&store);
    queue.initialize().unwrap();
    assert!(
        store.usage_accountant().is_some(),
        "the queue wires its accountant into the store"
    );
    for id in 1..=3 {
        queue.send(&ctx, msg(id)).unwrap();
    }
    assert_eq!(store.len(), 3);

    // consume and acknowledge only the first message
    let (sub, rx) = QueueSubscription::new(ConsumerInfo::new("c1").with_prefetch(10));
    queue.add_subscription(&ctx, Arc::clone(&sub) as Arc<dyn Subscription>).unwrap();
    let node = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(node.message_id(), MessageId(1));
    sub.acknowledge(&ctx, &queue, &node).unwrap();
    assert_eq!(store.len(), 2);
    queue.stop();
    drop(queue);

    // a fresh queue over the same store sees exactly the unacknowledged ones
    let revived = new_queue(&store);
    revived.initialize().unwrap();
    assert_eq!(revived.pending_count(), 2);
    let recovered: Vec<u64> = revived.browse().iter().map(|m| m.id.0).collect();
    assert_eq!(recovered, vec![2, 3]);
    assert_eq!(revived.statistics().messages.count(), 2);

    revived.stop();
}

#[test]
fn recovery_discards_messages_that_expired_in_the_store() {
    let store = InMemoryStore::new();
    let ctx = ConnectionContext::default();

    let stale = Arc::new(
        msg(1).with_expiration(current_timestamp().saturating_sub(10)),
    );
    store.add_message(&ctx, &stale).unwrap();
    store.add_message(&ctx, &Arc::new(msg(2))).unwrap();

    let queue = new_queue(&store);
    queue.initialize().unwrap();
    assert_eq!(queue.pending_count(), 1);
    assert!(queue.get_message(MessageId(1)).is_none());
    assert!(queue.get_message(MessageId(2)).is_some());

    queue.stop();
}

#[test]
fn acknowledging_an_unknown_id_is_a_noop() {
    let store = InMemoryStore::new();
    let ctx = ConnectionContext::default();

    let queue = new_queue(&store);
    queue.send(&ctx, msg(1)).unwrap();

    let ghost = MessageReference::new(Arc::new(msg(99)));
    let ack = MessageAck::standard(Destination::queue("orders"), MessageId(99));
    queue.acknowledge(&ctx, &ack, &ghost).unwrap();
    queue.acknowledge(&ctx, &ack, &ghost).unwrap();
    assert_eq!(store.len(), 1);

    queue.stop();
}

#[test]
fn ranged_acks_are_narrowed_to_the_reference() {
    let store = InMemoryStore::new();
    let ctx = ConnectionContext::default();

    let queue = new_queue(&store);
    for id in 1..=3 {
        queue.send(&ctx, msg(id)).unwrap();
    }

    let node = MessageReference::new(Arc::new(msg(2)));
    let ranged = MessageAck::ranged(
        Destination::queue("orders"),
        MessageId(1),
        MessageId(3),
        3,
    );
    queue.acknowledge(&ctx, &ranged, &node).unwrap();

    assert!(store.get_message(MessageId(1)).unwrap().is_some());
    assert!(store.get_message(MessageId(2)).unwrap().is_none());
    assert!(store.get_message(MessageId(3)).unwrap().is_some());

    queue.stop();
}

#[test]
fn dispose_destroys_all_store_state() {
    let store = InMemoryStore::new();
    let ctx = ConnectionContext::default();

    let queue = new_queue(&store);
    for id in 1..=4 {
        queue.send(&ctx, msg(id)).unwrap();
    }
    assert_eq!(store.len(), 4);

    queue.dispose(&ctx).unwrap();
    assert!(store.is_empty());

    queue.stop();
}
