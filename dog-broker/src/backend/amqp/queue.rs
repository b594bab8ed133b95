use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::broker::BrokerShared;
use super::consumer::AmqpJobIterator;
use super::supervisor::Link;
use crate::{
    backend::{JobIterator, Queue, TxCallback},
    transport::{Channel, DeliveryStream, QueueArgs, QueueOptions},
    Job, QueueError, QueueResult,
};

/// Consumers hold at most one unacknowledged job at a time
const PREFETCH_COUNT: u16 = 1;

/// Queue bound to a transport-backed broker
///
/// Unscoped queues resolve the broker's current link on every operation.
/// A queue handed to a transaction callback is pinned to the transaction's
/// dedicated channel instead.
pub struct AmqpQueue {
    name: String,
    shared: Arc<BrokerShared>,
    scope: Option<Arc<Link>>,
}

impl AmqpQueue {
    pub(crate) fn new(name: &str, shared: Arc<BrokerShared>) -> Self {
        Self {
            name: name.to_string(),
            shared,
            scope: None,
        }
    }

    fn link(&self) -> QueueResult<Arc<Link>> {
        let current = self.shared.link()?;
        Ok(match &self.scope {
            Some(scoped) => scoped.clone(),
            None => current,
        })
    }

    async fn run_transaction(
        &self,
        link: &Link,
        channel: Arc<dyn Channel>,
        callback: TxCallback,
    ) -> QueueResult<()> {
        channel
            .tx_select()
            .await
            .map_err(|err| QueueError::transport("tx_select", err))?;

        let scoped = Arc::new(AmqpQueue {
            name: self.name.clone(),
            shared: self.shared.clone(),
            scope: Some(Arc::new(Link {
                connection: link.connection.clone(),
                channel: channel.clone(),
            })),
        });

        match callback(scoped).await {
            Ok(()) => channel
                .tx_commit()
                .await
                .map_err(|err| QueueError::transaction("commit", err)),
            Err(err) => {
                channel
                    .tx_rollback()
                    .await
                    .map_err(|rollback| QueueError::transaction("rollback", rollback))?;
                debug!(error = %err, "transaction rolled back");
                Err(err)
            }
        }
    }
}

async fn register_consumer(
    channel: &dyn Channel,
    queue: &str,
    consumer_tag: &str,
) -> QueueResult<DeliveryStream> {
    channel
        .set_qos(PREFETCH_COUNT)
        .await
        .map_err(|err| QueueError::transport("set_qos", err))?;
    channel
        .consume(queue, consumer_tag)
        .await
        .map_err(|err| QueueError::transport("consume", err))
}

#[async_trait]
impl Queue for AmqpQueue {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, job), fields(queue = %self.name, job_id = %job.id))]
    async fn publish(&self, job: &Job) -> QueueResult<()> {
        job.ensure_publishable()?;
        let link = self.link()?;

        link.channel
            .publish(&self.name, &job.to_envelope())
            .await
            .map_err(|err| QueueError::transport("publish", err))?;
        debug!("published job");
        Ok(())
    }

    /// Park the job in a transient queue named after its id. The queue's TTL
    /// and dead-letter settings move it into this queue once `delay` elapses.
    #[instrument(skip(self, job), fields(queue = %self.name, job_id = %job.id))]
    async fn publish_delayed(&self, job: &Job, delay: Duration) -> QueueResult<()> {
        job.ensure_publishable()?;
        let link = self.link()?;

        let holding = job.id.as_str();
        let options = QueueOptions {
            durable: true,
            auto_delete: true,
            exclusive: false,
        };
        link.declare(holding, options, &QueueArgs::delayed(&self.name, delay)).await?;

        link.channel
            .publish(holding, &job.to_envelope())
            .await
            .map_err(|err| QueueError::transport("publish", err))?;
        debug!(delay_ms = delay.as_millis() as u64, "published delayed job");
        Ok(())
    }

    #[instrument(skip(self, callback), fields(queue = %self.name))]
    async fn transaction(&self, callback: TxCallback) -> QueueResult<()> {
        if self.scope.is_some() {
            return Err(QueueError::NestedTransaction);
        }
        let link = self.link()?;

        let channel = link
            .connection
            .open_channel()
            .await
            .map_err(|err| QueueError::transport("open_channel", err))?;

        let result = self.run_transaction(&link, channel.clone(), callback).await;

        if let Err(err) = channel.close().await {
            warn!(error = %err, "failed to release transaction channel");
        }
        result
    }

    #[instrument(skip(self), fields(queue = %self.name))]
    async fn consume(&self) -> QueueResult<Box<dyn JobIterator>> {
        let link = self.link()?;
        let channel = link
            .connection
            .open_channel()
            .await
            .map_err(|err| QueueError::transport("open_channel", err))?;

        let consumer_tag = self.shared.tags.next_for(&self.name);
        match register_consumer(channel.as_ref(), &self.name, &consumer_tag).await {
            Ok(deliveries) => {
                debug!(consumer = %consumer_tag, "consumer registered");
                Ok(Box::new(AmqpJobIterator::new(consumer_tag, channel, deliveries)))
            }
            Err(err) => {
                let _ = channel.close().await;
                Err(err)
            }
        }
    }
}
