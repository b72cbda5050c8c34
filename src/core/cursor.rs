//! Pending message cursor: the ordered backlog not yet paged into memory.
//!
//! The queue owns exactly one cursor behind its own mutex; every operation
//! here assumes that mutex is held. Implementations may be a volatile
//! FIFO, a disk-spillable cursor, or a store-recovery cursor, all under
//! the same contract.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::core::error::CursorError;
use crate::core::message::Message;

/// Forward iteration with removal of the last-yielded element, plus
/// ordering-preserving append.
pub trait PendingCursor: Send {
    /// Opens backing resources. Idempotent.
    fn start(&mut self) -> Result<(), CursorError>;

    /// True iff durable state exists that has not been merged yet.
    fn is_recovery_required(&self) -> bool;

    fn add_message_last(&mut self, message: Arc<Message>) -> Result<(), CursorError>;

    fn reset(&mut self);

    fn has_next(&self) -> bool;

    fn next(&mut self) -> Option<Arc<Message>>;

    /// Removes the element returned by the most recent `next`.
    fn remove(&mut self);

    fn size(&self) -> usize;
}

/// Volatile FIFO cursor. Holds nothing durable of its own, so a store
/// replay is always required to merge persistent state.
#[derive(Debug, Default)]
pub struct VmCursor {
    messages: VecDeque<Arc<Message>>,
    position: usize,
    last_yielded: Option<usize>,
}

impl VmCursor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PendingCursor for VmCursor {
    fn start(&mut self) -> Result<(), CursorError> {
        Ok(())
    }

    fn is_recovery_required(&self) -> bool {
        true
    }

    fn add_message_last(&mut self, message: Arc<Message>) -> Result<(), CursorError> {
        self.messages.push_back(message);
        Ok(())
    }

    fn reset(&mut self) {
        self.position = 0;
        self.last_yielded = None;
    }

    fn has_next(&self) -> bool {
        self.position < self.messages.len()
    }

    fn next(&mut self) -> Option<Arc<Message>> {
        let message = self.messages.get(self.position)?.clone();
        self.last_yielded = Some(self.position);
        self.position += 1;
        Some(message)
    }

    fn remove(&mut self) {
        if let Some(index) = self.last_yielded.take() {
            self.messages.remove(index);
            // the element after the removed one shifted into its slot
            self.position = index;
        }
    }

    fn size(&self) -> usize {
        self.messages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{Destination, MessageId};

    fn msg(id: u64) -> Arc<Message> {
        Arc::new(Message::new(Destination::queue("orders"), "payload").with_id(MessageId(id)))
    }

    fn drain_ids(cursor: &mut VmCursor) -> Vec<u64> {
        let mut ids = Vec::new();
        cursor.reset();
        while cursor.has_next() {
            ids.push(cursor.next().unwrap().id.0);
        }
        ids
    }

    #[test]
    fn appends_preserve_order() {
        let mut cursor = VmCursor::new();
        for id in 1..=3 {
            cursor.add_message_last(msg(id)).unwrap();
        }
        assert_eq!(cursor.size(), 3);
        assert_eq!(drain_ids(&mut cursor), vec![1, 2, 3]);
    }

    #[test]
    fn remove_takes_out_the_last_yielded() {
        let mut cursor = VmCursor::new();
        for id in 1..=4 {
            cursor.add_message_last(msg(id)).unwrap();
        }

        cursor.reset();
        cursor.next();
        let second = cursor.next().unwrap();
        assert_eq!(second.id.0, 2);
        cursor.remove();

        // iteration continues at the element after the removed one
        assert_eq!(cursor.next().unwrap().id.0, 3);
        assert_eq!(cursor.size(), 3);
        assert_eq!(drain_ids(&mut cursor), vec![1, 3, 4]);
    }

    #[test]
    fn remove_without_next_is_a_noop() {
        let mut cursor = VmCursor::new();
        cursor.add_message_last(msg(1)).unwrap();
        cursor.reset();
        cursor.remove();
        assert_eq!(cursor.size(), 1);
    }
}
