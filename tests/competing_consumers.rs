use std::sync::Arc;
use std::time::Duration;

use relaymq::config::EngineConfig;
use relaymq::core::message::{Destination, Message, MessageId};
use relaymq::core::queue::{Queue, QueueSettings};
use relaymq::core::subscription::{ConsumerInfo, QueueSubscription, Subscription};
use relaymq::core::transaction::ConnectionContext;

mod common;

fn new_queue() -> Arc<Queue> {
    common::init_logging();
    Queue::new(
        Destination::queue("orders"),
        &EngineConfig::default(),
        None,
        None,
        None,
        QueueSettings::default(),
    )
}

fn msg(id: u64) -> Message {
    Message::new(Destination::queue("orders"), "payload").with_id(MessageId(id))
}

#[test]
fn backlog_is_delivered_in_order_to_a_new_consumer() {
    let queue = new_queue();
    let ctx = ConnectionContext::default();

    queue.send(&ctx, msg(1)).unwrap();
    queue.send(&ctx, msg(2)).unwrap();
    assert_eq!(queue.pending_count(), 2, "nothing pages in without consumers");

    let (sub, rx) = QueueSubscription::new(ConsumerInfo::new("c1").with_prefetch(10));
    queue.add_subscription(&ctx, sub).unwrap();

    let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first.message_id(), MessageId(1));
    assert_eq!(second.message_id(), MessageId(2));
    assert_eq!(queue.pending_count(), 0);

    queue.stop();
}

#[test]
fn exclusive_consumer_receives_everything() {
    let queue = new_queue();
    let ctx = ConnectionContext::default();

    for id in 1..=5 {
        queue.send(&ctx, msg(id)).unwrap();
    }

    let (c1, r1) = QueueSubscription::new(ConsumerInfo::new("c1").exclusive().with_prefetch(2));
    let (c2, r2) = QueueSubscription::new(ConsumerInfo::new("c2").with_prefetch(10));
    queue.add_subscription(&ctx, c1.clone()).unwrap();
    queue.add_subscription(&ctx, c2).unwrap();

    let mut received = Vec::new();
    while received.len() < 5 {
        let node = r1
            .recv_timeout(Duration::from_secs(2))
            .expect("exclusive consumer should receive the whole backlog");
        received.push(node.message_id().0);
        c1.acknowledge(&ctx, &queue, &node).unwrap();
    }
    assert_eq!(received, vec![1, 2, 3, 4, 5]);
    assert!(
        r2.recv_timeout(Duration::from_millis(100)).is_err(),
        "the competing consumer must stay empty while an exclusive one is present"
    );

    queue.stop();
}

#[test]
fn group_affinity_sticks_and_orphans_are_redelivered() {
    let queue = new_queue();
    let ctx = ConnectionContext::default();

    let (c1, r1) = QueueSubscription::new(ConsumerInfo::new("c1").with_prefetch(10));
    let (c2, r2) = QueueSubscription::new(ConsumerInfo::new("c2").with_prefetch(10));
    queue.add_subscription(&ctx, c1.clone()).unwrap();
    queue.add_subscription(&ctx, c2).unwrap();

    // both group-A messages follow the first one to its consumer
    queue.send(&ctx, msg(1).with_group("A")).unwrap();
    queue.send(&ctx, msg(2).with_group("A")).unwrap();
    queue.send(&ctx, msg(3).with_group("B")).unwrap();

    let first = r1.recv_timeout(Duration::from_secs(2)).unwrap();
    let second = r1.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first.message_id(), MessageId(1));
    assert_eq!(second.message_id(), MessageId(2));
    assert_eq!(first.group_id(), Some("A"));

    // remove the owner without acknowledging; its in-flight messages are
    // redelivered to the survivor with a bumped redelivery counter
    let c1_dyn: Arc<dyn Subscription> = c1;
    queue.remove_subscription(&ctx, &c1_dyn).unwrap();

    let mut redelivered = Vec::new();
    while redelivered.len() < 2 {
        let node = r2.recv_timeout(Duration::from_secs(2)).unwrap();
        if node.message_id() == MessageId(3) {
            continue;
        }
        assert!(node.redelivery_counter() >= 1);
        redelivered.push(node.message_id().0);
    }
    assert_eq!(redelivered, vec![1, 2]);

    queue.stop();
}
