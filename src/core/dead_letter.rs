//! Dead-letter routing for messages that expire before delivery.

use crate::core::message::{Destination, Message};

/// Decides whether an undeliverable message is preserved on a dead-letter
/// queue and where that queue lives.
pub trait DeadLetterStrategy: Send + Sync {
    fn send_to_dead_letter_queue(&self, message: &Message) -> bool;

    fn dead_letter_destination(&self, message: &Message) -> Destination;
}

/// Routes every dead letter to one shared destination.
#[derive(Debug, Clone)]
pub struct SharedDeadLetterStrategy {
    destination: Destination,
    process_expired: bool,
}

impl SharedDeadLetterStrategy {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            process_expired: true,
        }
    }

    pub fn with_process_expired(mut self, process_expired: bool) -> Self {
        self.process_expired = process_expired;
        self
    }
}

impl Default for SharedDeadLetterStrategy {
    fn default() -> Self {
        Self::new(Destination::queue("DLQ"))
    }
}

impl DeadLetterStrategy for SharedDeadLetterStrategy {
    fn send_to_dead_letter_queue(&self, _message: &Message) -> bool {
        self.process_expired
    }

    fn dead_letter_destination(&self, _message: &Message) -> Destination {
        self.destination.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_strategy_uses_one_destination() {
        let strategy = SharedDeadLetterStrategy::default();
        let message = Message::new(Destination::queue("orders"), "payload");
        assert!(strategy.send_to_dead_letter_queue(&message));
        assert_eq!(strategy.dead_letter_destination(&message).name(), "DLQ");

        let silent = SharedDeadLetterStrategy::default().with_process_expired(false);
        assert!(!silent.send_to_dead_letter_queue(&message));
    }
}
