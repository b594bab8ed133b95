use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

use crate::transport::Envelope;

/// Ordered in-process storage for one named queue
pub(crate) struct MemoryStore {
    jobs: Mutex<VecDeque<Envelope>>,

    /// Woken once per stored job so suspended consumers can retry
    pub(crate) available: Notify,

    next_tag: AtomicU64,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            next_tag: AtomicU64::new(0),
        }
    }

    pub(crate) fn push_back(&self, envelope: Envelope) {
        self.jobs.lock().push_back(envelope);
        self.available.notify_one();
    }

    /// Return a rejected job to the head of the queue
    pub(crate) fn push_front(&self, envelope: Envelope) {
        self.jobs.lock().push_front(envelope);
        self.available.notify_one();
    }

    /// Append a batch atomically, preserving its order
    pub(crate) fn append(&self, batch: Vec<Envelope>) {
        let count = batch.len();
        self.jobs.lock().extend(batch);
        for _ in 0..count {
            self.available.notify_one();
        }
    }

    /// Pop the oldest job together with a fresh delivery tag
    pub(crate) fn pop_front(&self) -> Option<(u64, Envelope)> {
        let envelope = self.jobs.lock().pop_front()?;
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
        Some((tag, envelope))
    }

    pub(crate) fn drain(&self) -> Vec<Envelope> {
        self.jobs.lock().drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.lock().len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}
