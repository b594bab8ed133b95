use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::{
    backend::{Acknowledger, JobIterator},
    transport::{Channel, DeliveryStream},
    Job, QueueError, QueueResult,
};

/// Iterator over one consumer registration on a dedicated channel
pub struct AmqpJobIterator {
    consumer_tag: String,
    channel: Arc<dyn Channel>,
    deliveries: Mutex<DeliveryStream>,
    closed_tx: watch::Sender<bool>,
}

impl AmqpJobIterator {
    pub(crate) fn new(
        consumer_tag: String,
        channel: Arc<dyn Channel>,
        deliveries: DeliveryStream,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            consumer_tag,
            channel,
            deliveries: Mutex::new(deliveries),
            closed_tx,
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }
}

/// Resolves once the iterator is marked closed
async fn closed(mut closed_rx: watch::Receiver<bool>) {
    while !*closed_rx.borrow_and_update() {
        if closed_rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl JobIterator for AmqpJobIterator {
    async fn next(&self) -> QueueResult<Job> {
        let closed_rx = self.closed_tx.subscribe();
        if *self.closed_tx.borrow() {
            return Err(QueueError::IteratorClosed);
        }

        let delivery = tokio::select! {
            biased;
            _ = closed(closed_rx) => return Err(QueueError::IteratorClosed),
            delivery = async { self.deliveries.lock().await.next().await } => delivery,
        };

        match delivery {
            Some(Ok(delivery)) => {
                let acknowledger = AmqpAcknowledger {
                    channel: self.channel.clone(),
                    tag: delivery.tag,
                };
                Ok(Job::from_delivery(
                    delivery.envelope,
                    delivery.tag,
                    Box::new(acknowledger),
                ))
            }
            Some(Err(err)) => Err(QueueError::transport("consume", err)),
            None => Err(QueueError::IteratorClosed),
        }
    }

    async fn close(&self) -> QueueResult<()> {
        if self.closed_tx.send_replace(true) {
            return Err(QueueError::Closed);
        }

        let cancelled = self.channel.cancel(&self.consumer_tag).await;
        let channel_closed = self.channel.close().await;
        debug!(consumer = %self.consumer_tag, "consumer closed");

        cancelled.map_err(|err| QueueError::transport("cancel", err))?;
        channel_closed.map_err(|err| QueueError::transport("close_channel", err))
    }
}

/// Acks or rejects one delivery on the channel that received it
struct AmqpAcknowledger {
    channel: Arc<dyn Channel>,
    tag: u64,
}

#[async_trait]
impl Acknowledger for AmqpAcknowledger {
    async fn ack(&self) -> QueueResult<()> {
        self.channel
            .ack(self.tag)
            .await
            .map_err(|err| QueueError::transport("ack", err))
    }

    async fn reject(&self, requeue: bool) -> QueueResult<()> {
        self.channel
            .reject(self.tag, requeue)
            .await
            .map_err(|err| QueueError::transport("reject", err))
    }
}
