//! Transport-backed backend.
//!
//! Speaks AMQP semantics (durable queues, per-queue TTL and dead-lettering,
//! channel transactions, prefetch) through the [`crate::transport`] traits.

mod broker;
mod consumer;
mod queue;
mod supervisor;

pub use broker::AmqpBroker;
pub use consumer::AmqpJobIterator;
pub use queue::AmqpQueue;
pub use supervisor::SupervisorState;
