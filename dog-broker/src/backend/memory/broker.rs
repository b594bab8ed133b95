use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::storage::MemoryStore;
use crate::{
    backend::{Acknowledger, Broker, JobIterator, Queue, TxCallback},
    transport::Envelope,
    Job, QueueError, QueueResult,
};

/// In-process reference broker for tests and development
///
/// Queues are ordered sequences held in memory. Priority is carried along
/// but never reorders delivery.
pub struct MemoryBroker {
    queues: RwLock<HashMap<String, Arc<MemoryStore>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of jobs waiting in `name`, zero for undeclared queues
    pub fn pending(&self, name: &str) -> usize {
        self.queues.read().get(name).map_or(0, |store| store.len())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn queue(&self, name: &str) -> QueueResult<Arc<dyn Queue>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }

        let store = {
            let mut queues = self.queues.write();
            queues
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MemoryStore::new()))
                .clone()
        };

        Ok(Arc::new(MemoryQueue {
            name: name.to_string(),
            store,
            closed: self.closed.clone(),
            scoped: false,
        }))
    }

    async fn close(&self) -> QueueResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(QueueError::Closed);
        }
        info!("memory broker closed");
        Ok(())
    }
}

/// Queue backed by a [`MemoryStore`]
///
/// A scoped queue is the view handed to a transaction callback: it writes to
/// a scratch store, publishes delayed jobs immediately and refuses nesting.
pub struct MemoryQueue {
    name: String,
    store: Arc<MemoryStore>,
    closed: Arc<AtomicBool>,
    scoped: bool,
}

impl MemoryQueue {
    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, job), fields(queue = %self.name, job_id = %job.id))]
    async fn publish(&self, job: &Job) -> QueueResult<()> {
        self.ensure_open()?;
        job.ensure_publishable()?;

        self.store.push_back(job.to_envelope());
        debug!("published job");
        Ok(())
    }

    #[instrument(skip(self, job), fields(queue = %self.name, job_id = %job.id))]
    async fn publish_delayed(&self, job: &Job, delay: Duration) -> QueueResult<()> {
        self.ensure_open()?;
        job.ensure_publishable()?;

        if self.scoped {
            self.store.push_back(job.to_envelope());
            return Ok(());
        }

        let store = self.store.clone();
        let envelope = job.to_envelope();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            store.push_back(envelope);
        });
        debug!(delay_ms = delay.as_millis() as u64, "scheduled delayed job");
        Ok(())
    }

    #[instrument(skip(self, callback), fields(queue = %self.name))]
    async fn transaction(&self, callback: TxCallback) -> QueueResult<()> {
        self.ensure_open()?;
        if self.scoped {
            return Err(QueueError::NestedTransaction);
        }

        let scratch = Arc::new(MemoryStore::new());
        let scoped = Arc::new(MemoryQueue {
            name: self.name.clone(),
            store: scratch.clone(),
            closed: self.closed.clone(),
            scoped: true,
        });

        if let Err(err) = callback(scoped).await {
            debug!(error = %err, dropped = scratch.len(), "transaction rolled back");
            return Err(err);
        }

        let batch = scratch.drain();
        debug!(count = batch.len(), "transaction committed");
        self.store.append(batch);
        Ok(())
    }

    async fn consume(&self) -> QueueResult<Box<dyn JobIterator>> {
        self.ensure_open()?;
        let (closed_tx, _) = watch::channel(false);
        Ok(Box::new(MemoryJobIterator {
            store: self.store.clone(),
            closed_tx,
        }))
    }
}

pub struct MemoryJobIterator {
    store: Arc<MemoryStore>,
    closed_tx: watch::Sender<bool>,
}

#[async_trait]
impl JobIterator for MemoryJobIterator {
    async fn next(&self) -> QueueResult<Job> {
        let mut closed_rx = self.closed_tx.subscribe();
        loop {
            if *closed_rx.borrow_and_update() {
                return Err(QueueError::IteratorClosed);
            }

            // Register interest before checking so a concurrent publish is not missed
            let notified = self.store.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some((tag, envelope)) = self.store.pop_front() {
                let acknowledger = MemoryAcknowledger {
                    store: self.store.clone(),
                    envelope: envelope.clone(),
                    settled: AtomicBool::new(false),
                };
                return Ok(Job::from_delivery(envelope, tag, Box::new(acknowledger)));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = closed_rx.changed() => {}
            }
        }
    }

    async fn close(&self) -> QueueResult<()> {
        if self.closed_tx.send_replace(true) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }
}

struct MemoryAcknowledger {
    store: Arc<MemoryStore>,
    envelope: Envelope,
    settled: AtomicBool,
}

impl MemoryAcknowledger {
    fn settle(&self) -> bool {
        let first = !self.settled.swap(true, Ordering::AcqRel);
        if !first {
            warn!(job_id = %self.envelope.message_id, "job already acknowledged");
        }
        first
    }
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn ack(&self) -> QueueResult<()> {
        self.settle();
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> QueueResult<()> {
        if self.settle() && requeue {
            self.store.push_front(self.envelope.clone());
        }
        Ok(())
    }
}
