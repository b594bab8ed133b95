use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::{self, BoxFuture, FutureExt};
use futures::StreamExt;
use lapin::{
    message::Delivery as AmqpDelivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, ConnectionProperties,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

use super::{
    Channel, Connection, Delivery, DeliveryStream, Envelope, QueueArgs, QueueOptions, Transport,
    TransportError, TransportResult,
};

const REPLY_SUCCESS: u16 = 200;
const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Header carrying the full-precision job timestamp; the AMQP property only
/// holds whole seconds
const TIMESTAMP_HEADER: &str = "x-dog-timestamp";

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// AMQP 0-9-1 transport backed by `lapin`
#[derive(Clone, Default)]
pub struct LapinTransport {
    properties: ConnectionProperties,
}

impl LapinTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn dial(&self, url: &str) -> TransportResult<Arc<dyn Connection>> {
        let connection = lapin::Connection::connect(url, self.properties.clone()).await?;
        Ok(Arc::new(LapinConnection::new(connection)))
    }
}

pub struct LapinConnection {
    inner: lapin::Connection,
    closed_rx: Mutex<Option<oneshot::Receiver<TransportError>>>,
}

impl LapinConnection {
    fn new(inner: lapin::Connection) -> Self {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        inner.on_error(move |err| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(TransportError::from(err));
            }
        });

        Self {
            inner,
            closed_rx: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl Connection for LapinConnection {
    async fn open_channel(&self) -> TransportResult<Arc<dyn Channel>> {
        let channel = self.inner.create_channel().await?;
        Ok(Arc::new(LapinChannel { inner: channel }))
    }

    fn closed(&self) -> BoxFuture<'static, TransportError> {
        match self.closed_rx.lock().take() {
            Some(rx) => async move {
                rx.await
                    .unwrap_or_else(|_| TransportError::new("connection handle dropped"))
            }
            .boxed(),
            None => future::pending().boxed(),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.inner.close(REPLY_SUCCESS, "closing").await?;
        Ok(())
    }
}

pub struct LapinChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl Channel for LapinChannel {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        args: &QueueArgs,
    ) -> TransportResult<()> {
        let declare = QueueDeclareOptions {
            passive: false,
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            nowait: false,
        };
        self.inner
            .queue_declare(name, declare, field_table(args))
            .await?;
        Ok(())
    }

    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> TransportResult<()> {
        self.inner
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                &envelope.body,
                properties_for(envelope),
            )
            .await?;
        Ok(())
    }

    async fn set_qos(&self, prefetch_count: u16) -> TransportResult<()> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> TransportResult<DeliveryStream> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let deliveries = consumer.map(|item| item.map(to_delivery).map_err(TransportError::from));
        Ok(Box::pin(deliveries))
    }

    async fn cancel(&self, consumer_tag: &str) -> TransportResult<()> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn tx_select(&self) -> TransportResult<()> {
        self.inner.tx_select().await?;
        Ok(())
    }

    async fn tx_commit(&self) -> TransportResult<()> {
        self.inner.tx_commit().await?;
        Ok(())
    }

    async fn tx_rollback(&self) -> TransportResult<()> {
        self.inner.tx_rollback().await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> TransportResult<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> TransportResult<()> {
        self.inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.inner.close(REPLY_SUCCESS, "closing").await?;
        Ok(())
    }
}

fn field_table(args: &QueueArgs) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(exchange) = &args.dead_letter_exchange {
        table.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.as_str().into()),
        );
    }
    if let Some(routing_key) = &args.dead_letter_routing_key {
        table.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(routing_key.as_str().into()),
        );
    }
    if let Some(ttl) = args.message_ttl_ms {
        table.insert("x-message-ttl".into(), AMQPValue::LongLongInt(ttl));
    }
    if let Some(expires) = args.expires_ms {
        table.insert("x-expires".into(), AMQPValue::LongLongInt(expires));
    }
    table
}

fn properties_for(envelope: &Envelope) -> BasicProperties {
    let delivery_mode = if envelope.persistent {
        DELIVERY_MODE_PERSISTENT
    } else {
        DELIVERY_MODE_TRANSIENT
    };
    let precise = envelope.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true);
    let mut headers = FieldTable::default();
    headers.insert(
        TIMESTAMP_HEADER.into(),
        AMQPValue::LongString(precise.as_str().into()),
    );

    BasicProperties::default()
        .with_delivery_mode(delivery_mode)
        .with_message_id(envelope.message_id.as_str().into())
        .with_priority(envelope.priority)
        .with_timestamp(envelope.timestamp.timestamp().max(0) as u64)
        .with_content_type(envelope.content_type.as_str().into())
        .with_headers(headers)
}

/// Full-precision timestamp from the header, else whole seconds from the
/// property, else now
fn timestamp_from(properties: &BasicProperties) -> DateTime<Utc> {
    let precise = properties.headers().as_ref().and_then(|headers| {
        match headers.inner().get(&ShortString::from(TIMESTAMP_HEADER)) {
            Some(AMQPValue::LongString(value)) => {
                DateTime::parse_from_rfc3339(&String::from_utf8_lossy(value.as_bytes())).ok()
            }
            _ => None,
        }
    });

    match precise {
        Some(timestamp) => timestamp.with_timezone(&Utc),
        None => (*properties.timestamp())
            .and_then(|secs| DateTime::from_timestamp(secs as i64, 0))
            .unwrap_or_else(Utc::now),
    }
}

fn to_delivery(delivery: AmqpDelivery) -> Delivery {
    let properties = &delivery.properties;
    let message_id = properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
        .unwrap_or_default();
    let content_type = properties
        .content_type()
        .as_ref()
        .map(|ct| ct.as_str().to_string())
        .unwrap_or_default();
    let timestamp = timestamp_from(properties);
    let priority = (*properties.priority()).unwrap_or_default();
    let persistent = *properties.delivery_mode() == Some(DELIVERY_MODE_PERSISTENT);

    Delivery {
        tag: delivery.delivery_tag,
        envelope: Envelope {
            message_id,
            priority,
            timestamp,
            content_type,
            persistent,
            body: delivery.data,
        },
    }
}
