use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

use super::{JobId, Priority};
use crate::{backend::Acknowledger, transport::Envelope, QueueError, QueueResult};

/// Declared encoding of a job payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ContentType {
    #[default]
    Json,
    Raw,
    /// Any other content type, passed through unchanged
    Other(String),
}

impl ContentType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Json => "application/json",
            Self::Raw => "application/octet-stream",
            Self::Other(value) => value,
        }
    }
}

impl From<&str> for ContentType {
    fn from(value: &str) -> Self {
        match value {
            "application/json" => Self::Json,
            "application/octet-stream" => Self::Raw,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work published to, or received from, a queue.
///
/// Jobs built with [`Job::new`] carry no delivery state. Jobs handed out by a
/// [`JobIterator`](crate::backend::JobIterator) additionally own a delivery
/// tag and an exclusive acknowledger, which is why `Job` is not `Clone`.
pub struct Job {
    pub id: JobId,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub content_type: ContentType,
    raw: Vec<u8>,
    delivery_tag: Option<u64>,
    acknowledger: Option<Box<dyn Acknowledger>>,
}

impl Job {
    /// Create an empty job with a fresh id, normal priority and current timestamp
    pub fn new() -> Self {
        Self {
            id: JobId::new(),
            priority: Priority::default(),
            timestamp: Utc::now(),
            content_type: ContentType::default(),
            raw: Vec::new(),
            delivery_tag: None,
            acknowledger: None,
        }
    }

    /// Create a job whose payload is `value` encoded as JSON
    pub fn encode<T: Serialize>(value: &T) -> QueueResult<Self> {
        let mut job = Self::new();
        job.raw = serde_json::to_vec(value)?;
        job.content_type = ContentType::Json;
        Ok(job)
    }

    /// Decode the JSON payload into `T`
    pub fn decode<T: DeserializeOwned>(&self) -> QueueResult<T> {
        if self.content_type != ContentType::Json {
            return Err(QueueError::Serialization(format!(
                "cannot decode {} payload as json",
                self.content_type
            )));
        }
        Ok(serde_json::from_slice(&self.raw)?)
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    /// Replace the payload with raw bytes, leaving the content type unchanged
    pub fn with_payload(mut self, raw: impl Into<Vec<u8>>) -> Self {
        self.raw = raw.into();
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Backend-assigned delivery tag, present only on received jobs
    pub fn delivery_tag(&self) -> Option<u64> {
        self.delivery_tag
    }

    pub fn is_delivered(&self) -> bool {
        self.acknowledger.is_some()
    }

    /// Acknowledge successful processing of this delivery
    pub async fn ack(&self) -> QueueResult<()> {
        match &self.acknowledger {
            Some(acknowledger) => acknowledger.ack().await,
            None => Err(QueueError::NotDelivered),
        }
    }

    /// Signal failed processing; `requeue` returns the job to its queue
    pub async fn reject(&self, requeue: bool) -> QueueResult<()> {
        match &self.acknowledger {
            Some(acknowledger) => acknowledger.reject(requeue).await,
            None => Err(QueueError::NotDelivered),
        }
    }

    /// Fail with `EmptyJob` unless the payload carries bytes
    pub(crate) fn ensure_publishable(&self) -> QueueResult<()> {
        if self.raw.is_empty() {
            return Err(QueueError::EmptyJob);
        }
        Ok(())
    }

    /// Wire representation used for publishing
    pub(crate) fn to_envelope(&self) -> Envelope {
        Envelope {
            message_id: self.id.to_string(),
            priority: self.priority.as_u8(),
            timestamp: self.timestamp,
            content_type: self.content_type.as_str().to_string(),
            persistent: true,
            body: self.raw.clone(),
        }
    }

    /// Rebuild a received job from its wire representation
    pub(crate) fn from_delivery(
        envelope: Envelope,
        delivery_tag: u64,
        acknowledger: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            id: JobId::from(envelope.message_id),
            priority: Priority(envelope.priority),
            timestamp: envelope.timestamp,
            content_type: ContentType::from(envelope.content_type.as_str()),
            raw: envelope.body,
            delivery_tag: Some(delivery_tag),
            acknowledger: Some(acknowledger),
        }
    }
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("timestamp", &self.timestamp)
            .field("content_type", &self.content_type)
            .field("payload_len", &self.raw.len())
            .field("delivery_tag", &self.delivery_tag)
            .finish_non_exhaustive()
    }
}
