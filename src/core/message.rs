//! Message, destination identity, and acknowledgement types.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

/// Returns the current system time as a UNIX timestamp in milliseconds.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time is before Unix epoch")
        .as_millis() as u64
}

/// Generates a random u64 ID using UUID v4 (lower 64 bits).
fn generate_id() -> u64 {
    use uuid::Uuid;
    let uuid = Uuid::new_v4();
    let bytes = uuid.as_u128().to_be_bytes();
    u64::from_be_bytes(bytes[8..16].try_into().unwrap())
}

/// Unique identifier for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    Queue,
}

/// Immutable destination identity: a name plus a type tag. One queue
/// instance exists per identity per broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    name: String,
    kind: DestinationKind,
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Queue,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A produced message. Immutable after send except for the
/// broker-maintained region back-reference stamped on arrival; the
/// redelivery counter lives on the paged-in reference.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub destination: Destination,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
    pub persistent: bool,
    /// Absolute expiration in milliseconds since the epoch; zero never
    /// expires.
    pub expiration: u64,
    pub group_id: Option<String>,
    pub timestamp: u64,
    pub region_destination: Option<Destination>,
}

impl Message {
    pub fn new(destination: Destination, payload: impl Into<Bytes>) -> Self {
        Self {
            id: MessageId(generate_id()),
            destination,
            payload: payload.into(),
            headers: HashMap::new(),
            persistent: false,
            expiration: 0,
            group_id: None,
            timestamp: current_timestamp(),
            region_destination: None,
        }
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_expiration(mut self, at: u64) -> Self {
        self.expiration = at;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group_id = Some(group.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expiration > 0 && current_timestamp() >= self.expiration
    }

    /// Approximate in-memory footprint charged to the usage accountant.
    pub fn size(&self) -> usize {
        self.payload.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// Acknowledgement covering one or more messages.
///
/// A ranged ack spans `first_message_id..=last_message_id`; the queue
/// converts it to a single-id ack before a store delete since the store
/// removes exactly one id at a time.
#[derive(Debug, Clone)]
pub struct MessageAck {
    pub destination: Destination,
    pub first_message_id: MessageId,
    pub last_message_id: MessageId,
    pub message_count: u32,
}

impl MessageAck {
    pub fn standard(destination: Destination, id: MessageId) -> Self {
        Self {
            destination,
            first_message_id: id,
            last_message_id: id,
            message_count: 1,
        }
    }

    pub fn ranged(
        destination: Destination,
        first: MessageId,
        last: MessageId,
        count: u32,
    ) -> Self {
        Self {
            destination,
            first_message_id: first,
            last_message_id: last,
            message_count: count,
        }
    }

    pub fn is_ranged(&self) -> bool {
        self.message_count > 1 || self.first_message_id != self.last_message_id
    }

    /// Narrows a ranged ack down to one concrete message id.
    pub fn to_single(&self, id: MessageId) -> Self {
        Self {
            destination: self.destination.clone(),
            first_message_id: id,
            last_message_id: id,
            message_count: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiration_is_absolute() {
        let msg = Message::new(Destination::queue("orders"), "payload");
        assert!(!msg.is_expired());

        let expired = Message::new(Destination::queue("orders"), "payload")
            .with_expiration(current_timestamp().saturating_sub(5));
        assert!(expired.is_expired());
    }

    #[test]
    fn ranged_ack_narrows_to_single() {
        let dest = Destination::queue("orders");
        let ack = MessageAck::ranged(dest.clone(), MessageId(1), MessageId(9), 9);
        assert!(ack.is_ranged());

        let single = ack.to_single(MessageId(4));
        assert!(!single.is_ranged());
        assert_eq!(single.first_message_id, MessageId(4));
        assert_eq!(single.last_message_id, MessageId(4));
        assert_eq!(single.message_count, 1);
    }
}
