pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::{Job, QueueResult};

/// Callback run inside [`Queue::transaction`] with a queue scoped to the transaction
pub type TxCallback = Box<dyn FnOnce(Arc<dyn Queue>) -> BoxFuture<'static, QueueResult<()>> + Send>;

/// Build a [`TxCallback`] from an async closure
///
/// ```rust
/// use dog_broker::{backend::{tx, Queue}, Job};
///
/// let callback = tx(|queue| async move {
///     queue.publish(&Job::new().with_payload(b"first".to_vec())).await?;
///     queue.publish(&Job::new().with_payload(b"second".to_vec())).await
/// });
/// # drop(callback);
/// ```
pub fn tx<F, Fut>(callback: F) -> TxCallback
where
    F: FnOnce(Arc<dyn Queue>) -> Fut + Send + 'static,
    Fut: Future<Output = QueueResult<()>> + Send + 'static,
{
    Box::new(move |queue| callback(queue).boxed())
}

/// Top-level handle to a backend; resolves queue names to [`Queue`]s
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare (idempotently) a durable queue and return a handle bound to it
    async fn queue(&self, name: &str) -> QueueResult<Arc<dyn Queue>>;

    /// Release the backend connection. Queues derived from this broker
    /// fail with `Closed` afterwards.
    async fn close(&self) -> QueueResult<()>;
}

/// A named queue
#[async_trait]
pub trait Queue: Send + Sync {
    fn name(&self) -> &str;

    /// Publish a job for immediate delivery
    async fn publish(&self, job: &Job) -> QueueResult<()>;

    /// Publish a job that must not be delivered before `delay` has elapsed
    async fn publish_delayed(&self, job: &Job, delay: Duration) -> QueueResult<()>;

    /// Run `callback` against a transactional view of this queue.
    ///
    /// Publishes made through the scoped queue become visible together when
    /// the callback succeeds and are discarded when it fails, in which case
    /// the callback's error is returned.
    async fn transaction(&self, callback: TxCallback) -> QueueResult<()>;

    /// Start pulling jobs from this queue, one unacknowledged job at a time
    async fn consume(&self) -> QueueResult<Box<dyn JobIterator>>;
}

/// Pull handle over a queue's deliveries
///
/// Both methods take `&self`, so an iterator shared behind an `Arc` can be
/// closed from one task while another is suspended in [`JobIterator::next`].
#[async_trait]
pub trait JobIterator: Send + Sync {
    /// Wait for the next job. Fails with `IteratorClosed` once the iterator
    /// has been closed.
    async fn next(&self) -> QueueResult<Job>;

    /// Cancel the consumer registration and release its channel
    async fn close(&self) -> QueueResult<()>;
}

/// Signals the fate of one delivered job
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> QueueResult<()>;

    /// `requeue = true` returns the job to the queue for redelivery
    async fn reject(&self, requeue: bool) -> QueueResult<()>;
}
