//! Transport client seam.
//!
//! The transport-backed broker never speaks a wire protocol itself. It drives
//! a client library through the [`Transport`], [`Connection`] and [`Channel`]
//! traits below, which expose exactly the primitives the broker needs:
//! dial, open channel, close notification, queue declaration, publish,
//! prefetch, consume/cancel, transactions and per-delivery ack/reject.
//!
//! [`amqp::LapinTransport`] binds these traits to an AMQP 0-9-1 server.

#[cfg(feature = "amqp")]
pub mod amqp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures_core::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Stream of deliveries for one consumer registration
pub type DeliveryStream = BoxStream<Result<Delivery, TransportError>>;

pub type TransportResult<T> = Result<T, TransportError>;

/// Failure reported by the transport client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Wire representation of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message_id: String,
    pub priority: u8,
    pub timestamp: DateTime<Utc>,
    pub content_type: String,
    /// Ask the server to persist the message to disk
    pub persistent: bool,
    pub body: Vec<u8>,
}

/// A message handed to a consumer, identified by its channel-scoped tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub envelope: Envelope,
}

/// Flags for queue declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl QueueOptions {
    /// Durable queue that survives server restarts
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }
}

/// Lower bound on the idle expiry of a delayed job's holding queue
pub const MIN_HOLDING_EXPIRY_MS: i64 = 1_000;

/// Optional queue declaration arguments
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueArgs {
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    /// Per-message time-to-live in milliseconds
    pub message_ttl_ms: Option<i64>,
    /// Idle time in milliseconds after which the queue itself is deleted
    pub expires_ms: Option<i64>,
}

impl QueueArgs {
    /// Arguments for a transient queue that holds messages for `delay` and
    /// then dead-letters them into `target` through the default exchange.
    ///
    /// The queue expires after twice the delay, so it disappears even if its
    /// message is never moved. Publishing does not count as queue use, so the
    /// expiry never drops below [`MIN_HOLDING_EXPIRY_MS`] and a short delay
    /// cannot delete the queue before its message arrives.
    pub fn delayed(target: &str, delay: Duration) -> Self {
        let ttl = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);
        Self {
            dead_letter_exchange: Some(String::new()),
            dead_letter_routing_key: Some(target.to_string()),
            message_ttl_ms: Some(ttl),
            expires_ms: Some(ttl.saturating_mul(2).max(MIN_HOLDING_EXPIRY_MS)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Factory for transport connections
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn dial(&self, url: &str) -> TransportResult<Arc<dyn Connection>>;
}

/// A live connection to the server
#[async_trait]
pub trait Connection: Send + Sync {
    async fn open_channel(&self) -> TransportResult<Arc<dyn Channel>>;

    /// Resolves with the cause once the connection closes unexpectedly.
    ///
    /// Only the first call observes the notification; later calls never resolve.
    fn closed(&self) -> BoxFuture<'static, TransportError>;

    async fn close(&self) -> TransportResult<()>;
}

/// A channel multiplexed over a connection
#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        args: &QueueArgs,
    ) -> TransportResult<()>;

    /// Publish through the default exchange, routed by queue name
    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> TransportResult<()>;

    /// Limit unacknowledged deliveries held by consumers on this channel
    async fn set_qos(&self, prefetch_count: u16) -> TransportResult<()>;

    /// Register a consumer with manual acknowledgement
    async fn consume(&self, queue: &str, consumer_tag: &str) -> TransportResult<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> TransportResult<()>;

    async fn tx_select(&self) -> TransportResult<()>;

    async fn tx_commit(&self) -> TransportResult<()>;

    async fn tx_rollback(&self) -> TransportResult<()>;

    async fn ack(&self, delivery_tag: u64) -> TransportResult<()>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> TransportResult<()>;

    async fn close(&self) -> TransportResult<()>;
}
