use std::sync::Arc;
use std::thread;
use std::time::Duration;

use relaymq::config::{EngineConfig, MemoryTuning};
use relaymq::core::error::QueueError;
use relaymq::core::message::{current_timestamp, Destination, Message, MessageId};
use relaymq::core::queue::{Queue, QueueSettings};
use relaymq::core::subscription::{ConsumerInfo, QueueSubscription, Subscription};
use relaymq::core::transaction::{ConnectionContext, Transaction};

mod common;

fn new_queue(limit_bytes: u64, fail_fast: bool) -> Arc<Queue> {
    common::init_logging();
    let config = EngineConfig {
        memory: MemoryTuning {
            limit_bytes,
            send_fail_if_no_space: fail_fast,
        },
        ..EngineConfig::default()
    };
    Queue::new(
        Destination::queue("orders"),
        &config,
        None,
        None,
        None,
        QueueSettings::default(),
    )
}

fn msg(id: u64) -> Message {
    // ten payload bytes, so one message saturates a small accountant
    Message::new(Destination::queue("orders"), "0123456789").with_id(MessageId(id))
}

#[test]
fn fail_fast_raises_when_the_accountant_is_full() {
    let queue = new_queue(8, true);
    let ctx = ConnectionContext::new().with_producer_flow_control(true);

    queue.send(&ctx, msg(1)).unwrap();
    assert!(queue.usage().is_full());

    let err = queue.send(&ctx, msg(2));
    assert!(matches!(err, Err(QueueError::ResourceExhausted(_))));

    queue.stop();
}

#[test]
fn blocked_send_completes_after_space_frees() {
    let queue = new_queue(8, false);
    let ctx = ConnectionContext::new().with_producer_flow_control(true);

    queue.send(&ctx, msg(1)).unwrap();
    assert!(queue.usage().is_full());

    let sender = {
        let queue = Arc::clone(&queue);
        let ctx = ctx.clone();
        thread::spawn(move || queue.send(&ctx, msg(2)))
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!sender.is_finished(), "the producer blocks while full");

    // consuming the first message frees the accountant
    let (sub, rx) = QueueSubscription::new(ConsumerInfo::new("c1").with_prefetch(10));
    queue.add_subscription(&ctx, Arc::clone(&sub) as Arc<dyn Subscription>).unwrap();
    let node = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    sub.acknowledge(&ctx, &queue, &node).unwrap();

    sender.join().unwrap().unwrap();
    let node = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(node.message_id(), MessageId(2));

    queue.stop();
}

#[test]
fn message_expiring_while_blocked_is_not_enqueued() {
    let queue = new_queue(8, false);
    let ctx = ConnectionContext::new().with_producer_flow_control(true);

    queue.send(&ctx, msg(1)).unwrap();
    assert!(queue.usage().is_full());

    let doomed = msg(2).with_expiration(current_timestamp() + 150);
    queue.send(&ctx, doomed).unwrap();

    assert_eq!(queue.pending_count(), 1, "only the first message exists");
    assert_eq!(queue.statistics().enqueues.count(), 1);

    queue.stop();
}

#[test]
fn transactional_send_enqueues_at_commit() {
    let queue = new_queue(u64::MAX, false);
    let tx = Transaction::new();
    let ctx = ConnectionContext::new().with_transaction(Arc::clone(&tx));

    queue.send(&ctx, msg(1)).unwrap();
    assert_eq!(queue.pending_count(), 0, "nothing visible before commit");

    tx.commit().unwrap();
    assert_eq!(queue.pending_count(), 1);

    queue.stop();
}

#[test]
fn rolled_back_send_enqueues_nothing() {
    let queue = new_queue(u64::MAX, false);
    let tx = Transaction::new();
    let ctx = ConnectionContext::new().with_transaction(Arc::clone(&tx));

    queue.send(&ctx, msg(1)).unwrap();
    tx.rollback();
    assert_eq!(queue.pending_count(), 0);
    assert_eq!(queue.statistics().enqueues.count(), 0);

    queue.stop();
}

#[test]
fn commit_after_expiration_enqueues_nothing() {
    let queue = new_queue(u64::MAX, false);
    let tx = Transaction::new();
    let ctx = ConnectionContext::new().with_transaction(Arc::clone(&tx));

    let doomed = msg(1).with_expiration(current_timestamp() + 50);
    queue.send(&ctx, doomed).unwrap();
    thread::sleep(Duration::from_millis(100));

    tx.commit().unwrap();
    assert_eq!(queue.pending_count(), 0);

    queue.stop();
}
