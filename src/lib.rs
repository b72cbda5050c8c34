//! relaymq — the point-to-point queue engine of a message broker.
//!
//! Producer sends gate through a usage accountant into a pending cursor;
//! a bounded working set is paged into memory and dispatched to exactly
//! one of possibly many competing subscribers, honoring prefetch credit,
//! message-group affinity, exclusive consumers, and priorities. Delivery
//! is at-least-once against a pluggable message store.

pub mod config;
pub mod core;
pub mod logging;
